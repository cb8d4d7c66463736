//! Two tagged instantiations of a generic kernel, scheduled with a script.
//! Only the `const7` instance gets a pipelined `add`.
//!
//! Run with `cargo run --example nested_compose`.

use accel_schedule::builder::{call, grid, store, FunctionBuilder};
use accel_schedule::{run_script, CompileResult, CompilerConfig, DType, Expr, Program, TensorType};

const SCRIPT: &str = r#"
# schedule the leaf once
s_add = customize(add)
s_add.pipeline(i)

# one schedule per instantiation
s5 = customize(add_const, [5], tag="const5")
s7 = customize(add_const, [7], tag="const7")
s7.compose(s_add)

top = customize(top)
top.compose(s7, id=const7)
emit(top)
"#;

fn program() -> Program {
    let ty = TensorType::new(DType::I32, [10]);
    let i = Expr::var("i");

    let add = FunctionBuilder::new("add")
        .param("A", ty.clone())
        .returns(ty.clone())
        .alloc("B", ty.clone())
        .op(grid(&[("i", 10)], vec![store("B", vec![i.clone()], Expr::load("A", vec![i.clone()]) + 1)]))
        .ret("B")
        .build();
    let add_const = FunctionBuilder::new("add_const")
        .param("A", ty.clone())
        .returns(ty.clone())
        .op(call("add").arg("A").result("T", ty.clone()).build())
        .alloc("C", ty.clone())
        .op(grid(
            &[("i", 10)],
            vec![store("C", vec![i.clone()], Expr::load("T", vec![i]) + Expr::var("N") - 1)],
        ))
        .ret("C")
        .build();
    let top = FunctionBuilder::new("top")
        .param("X", ty.clone())
        .returns(ty.clone())
        .op(call("add_const").inst(&[5]).tag("const5").arg("X").result("Y", ty.clone()).build())
        .op(call("add_const").inst(&[7]).tag("const7").arg("Y").result("Z", ty).build())
        .ret("Z")
        .build();

    Program::new()
        .with(add)
        .with_generic(add_const, &["N"])
        .with(top)
}

fn main() -> CompileResult<()> {
    for hls in run_script(program(), CompilerConfig::default(), SCRIPT)? {
        println!("// functions: {}", hls.functions.join(", "));
        println!("// pipelined loops: {}", hls.pragma_count("pipeline"));
        println!("{}", hls.code);
    }
    Ok(())
}
