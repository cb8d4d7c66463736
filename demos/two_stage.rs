//! Two chained stages composed into one top function and turned into a
//! dataflow region.
//!
//! Run with `cargo run --example two_stage`; pass `--json` to print the
//! program in the format `accel-sched` reads.

use accel_schedule::builder::{call, grid, store, FunctionBuilder};
use accel_schedule::{emit, optimize, CompileResult, DType, Expr, Granularity, Interpreter, Program, Session, TensorType};

fn program() -> Program {
    let ty = TensorType::new(DType::I32, [10, 10]);
    let (i, j) = (Expr::var("i"), Expr::var("j"));

    let stage_a = FunctionBuilder::new("stageA")
        .returns(ty.clone())
        .alloc("A", ty.clone())
        .op(grid(
            &[("i", 10), ("j", 10)],
            vec![store("A", vec![i.clone(), j.clone()], i.clone() + j.clone())],
        ))
        .ret("A")
        .build();
    let stage_b = FunctionBuilder::new("stageB")
        .param("A", ty.clone())
        .returns(ty.clone())
        .alloc("B", ty.clone())
        .op(grid(
            &[("i", 10), ("j", 10)],
            vec![store("B", vec![i.clone(), j.clone()], Expr::load("A", vec![i, j]) + 1)],
        ))
        .ret("B")
        .build();
    let top = FunctionBuilder::new("top")
        .returns(ty.clone())
        .op(call("stageA").result("A", ty.clone()).build())
        .op(call("stageB").arg("A").result("B", ty).build())
        .ret("B")
        .build();

    Program::new().with(stage_a).with(stage_b).with(top)
}

fn main() -> CompileResult<()> {
    let program = program();
    if std::env::args().any(|a| a == "--json") {
        match program.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("failed to serialize program: {}", e),
        }
        return Ok(());
    }

    let mut session = Session::new(program);
    let mut stage_a = session.customize("stageA")?;
    stage_a.pipeline("j")?;
    let mut stage_b = session.customize("stageB")?;
    stage_b.pipeline("j")?;

    let mut top = session.customize("top")?;
    top.compose_all([&stage_a, &stage_b], None)?;
    let top = optimize(&top, Granularity::Graph, None)?;
    println!("{}", top);

    let library = session.library();
    let out = Interpreter::new(&library).run(top.module(), vec![])?;
    if let Some(result) = out.result {
        let row: Vec<i64> = result.to_i64_vec().into_iter().take(10).collect();
        println!("B[0, ..] = {:?}", row);
    }

    println!("{}", emit(&top, &library)?.code);
    Ok(())
}
