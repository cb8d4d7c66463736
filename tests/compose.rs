use std::collections::BTreeMap;

use pretty_assertions::assert_eq;

use accel_schedule::builder::{call, grid, store, FunctionBuilder};
use accel_schedule::{
    emit, CompileError, DType, Expr, Interpreter, LogEntry, Module, OpKind, PartitionKind, Program, Session, Tensor,
    TensorType,
};

fn vec10() -> TensorType {
    TensorType::new(DType::I32, [10])
}

fn add() -> Module {
    let i = Expr::var("i");
    FunctionBuilder::new("add")
        .param("A", vec10())
        .returns(vec10())
        .alloc("B", vec10())
        .op(grid(&[("i", 10)], vec![store("B", vec![i.clone()], Expr::load("A", vec![i]) + 1)]))
        .ret("B")
        .build()
}

/// add_const[N](A) = add(A) + N - 1
fn add_const() -> Module {
    let i = Expr::var("i");
    FunctionBuilder::new("add_const")
        .param("A", vec10())
        .returns(vec10())
        .op(call("add").arg("A").result("T", vec10()).build())
        .alloc("C", vec10())
        .op(grid(
            &[("i", 10)],
            vec![store("C", vec![i.clone()], Expr::load("T", vec![i]) + Expr::var("N") - 1)],
        ))
        .ret("C")
        .build()
}

fn top() -> Module {
    FunctionBuilder::new("top")
        .param("X", vec10())
        .returns(vec10())
        .op(call("add_const").inst(&[5]).tag("const5").arg("X").result("Y", vec10()).build())
        .op(call("add_const").inst(&[7]).tag("const7").arg("Y").result("Z", vec10()).build())
        .ret("Z")
        .build()
}

fn program() -> Program {
    Program::new()
        .with(add())
        .with_generic(add_const(), &["N"])
        .with(top())
}

fn evaluate(session: &Session, module: &Module) -> Vec<i64> {
    let library = session.library();
    let x = Tensor::from_fn(vec10(), |ix| (ix[0] * 3) as i64);
    let out = Interpreter::new(&library).run(module, vec![x]).unwrap();
    out.result.unwrap().to_i64_vec()
}

#[test]
fn test_instances_are_named_by_tag() {
    let mut session = Session::new(program());
    let top = session.customize("top").unwrap();
    let library = session.library();
    assert!(library.contains_key("add_const_const5"));
    assert!(library.contains_key("add_const_const7"));
    assert!(top.module().op("add_const_const5").unwrap().as_call().is_some());

    // Calls inside a tagged instance carry the tag
    let const5 = &library["add_const_const5"];
    assert!(const5.op("add_const5").unwrap().as_call().is_some());
}

#[test]
fn test_only_the_const7_site_is_pipelined() {
    let mut session = Session::new(program());
    let mut s_add = session.customize("add").unwrap();
    s_add.pipeline("i").unwrap();
    let mut s7 = session.customize_instance("add_const", &[7], Some("const7")).unwrap();
    s7.compose(&s_add, None).unwrap();
    let mut top = session.customize("top").unwrap();
    top.compose(&s7, Some("const7")).unwrap();

    let pipelined: Vec<_> = top.primitives().filter(|p| p.name() == "pipeline").collect();
    assert_eq!(pipelined.len(), 1);
    assert_eq!(pipelined[0].target(), "add_const_const7.add_const7.i");
    let l = top.module().op(pipelined[0].target()).unwrap().as_loop().unwrap();
    assert_eq!(l.pipeline, Some(1));

    let hls = emit(&top, &session.library()).unwrap();
    assert_eq!(hls.pragma_count("pipeline"), 1);
    assert_eq!(hls.functions, vec!["add", "add_const_const5", "top"]);
    assert!(hls.code.contains("// inlined add_const_const7 at add_const_const7"));
    assert!(hls.code.contains("// inlined add at add_const_const7_add_const7"));
    assert!(hls.code.contains("// call site add_const5"));
}

#[test]
fn test_inlined_region_matches_standalone_evaluation() {
    let mut session = Session::new(program());
    let mut s_add = session.customize("add").unwrap();
    s_add.split("i", 4).unwrap();
    let mut s5 = session.customize_instance("add_const", &[5], Some("const5")).unwrap();
    s5.compose(&s_add, None).unwrap();
    let mut s7 = session.customize_instance("add_const", &[7], Some("const7")).unwrap();
    s7.pipeline("i").unwrap();

    let mut top = session.customize("top").unwrap();
    let expected = evaluate(&session, top.module());
    assert_eq!(expected, (0..10).map(|v| v * 3 + 12).collect::<Vec<_>>());

    top.compose(&s5, Some("const5")).unwrap();
    top.compose(&s7, Some("const7")).unwrap();
    assert!(top.module().call_sites().into_iter().any(|(_, op)| op.name.ends_with("add_const7")));
    assert_eq!(evaluate(&session, top.module()), expected);
}

#[test]
fn test_sites_do_not_share_ir() {
    let mut session = Session::new(program());
    let s_add = session.customize("add").unwrap();
    let mut s5 = session.customize_instance("add_const", &[5], Some("const5")).unwrap();
    s5.compose(&s_add, None).unwrap();
    let mut s7 = session.customize_instance("add_const", &[7], Some("const7")).unwrap();
    s7.compose(&s_add, None).unwrap();

    let mut top = session.customize("top").unwrap();
    top.compose(&s5, Some("const5")).unwrap();
    top.compose(&s7, Some("const7")).unwrap();
    let log_before = top.log().len();

    top.pipeline("add_const_const5.add_const5.i").unwrap();
    let other = top.module().op("add_const_const7.add_const7.i").unwrap().as_loop().unwrap();
    assert_eq!(other.pipeline, None);
    assert_eq!(top.log().len(), log_before + 1);

    // The children are untouched by what happened in the parent
    assert!(s_add.module().op("i").unwrap().as_loop().unwrap().pipeline.is_none());
    assert!(s7.module().op("add_const7.i").unwrap().as_loop().unwrap().pipeline.is_none());
}

#[test]
fn test_partition_survives_nested_composition() {
    let mut session = Session::new(program());
    let mut s_add = session.customize("add").unwrap();
    s_add.partition("A", 1, 2, PartitionKind::Cyclic).unwrap();
    let mut s7 = session.customize_instance("add_const", &[7], Some("const7")).unwrap();
    s7.compose(&s_add, None).unwrap();
    let mut top = session.customize("top").unwrap();
    top.compose(&s7, Some("const7")).unwrap();

    // add's A is add_const's A, which is top's Y at the const7 site
    assert_eq!(top.module().partitions["Y"].len(), 1);
    assert_eq!(top.module().partitions["Y"][0].kind, PartitionKind::Cyclic);
    let hls = emit(&top, &session.library()).unwrap();
    assert!(hls.code.contains("#pragma HLS array_partition variable=Y cyclic factor=2 dim=1"));
}

#[test]
fn test_equivalence_through_composed_chain() {
    let mut session = Session::new(program());
    let s_add = session.customize("add").unwrap();
    let mut s7 = session.customize_instance("add_const", &[7], Some("const7")).unwrap();
    s7.compose(&s_add, None).unwrap();
    let mut top = session.customize("top").unwrap();
    top.compose(&s7, Some("const7")).unwrap();

    let inputs = top.equivalent_values("top:X");
    assert!(inputs.contains("add_const_const5:A"));
    assert!(inputs.contains("add:A"));
    let outputs = top.equivalent_values("top:Z");
    assert!(outputs.contains("add_const_const7:C"));
    // Pre-composition names still resolve after inlining
    assert!(top.equivalent_values("add_const_const7:T").contains("add:B"));
}

#[test]
fn test_mismatched_instance_is_rejected() {
    let mut session = Session::new(program());
    let s5 = session.customize_instance("add_const", &[5], Some("const5")).unwrap();
    let mut top = session.customize("top").unwrap();
    let before = top.module().clone();
    assert!(matches!(top.compose(&s5, Some("const7")), Err(CompileError::TypeMismatch { .. })));
    assert!(matches!(top.compose(&s5, None), Err(CompileError::AmbiguousCallSite { .. })));
    assert!(matches!(top.compose(&s5, Some("const9")), Err(CompileError::UnknownCallSite { .. })));
    assert_eq!(top.module(), &before);
}

#[test]
fn test_compose_list_is_all_or_nothing() {
    let mut session = Session::new(program());
    let s_add = session.customize("add").unwrap();
    let s7 = session.customize_instance("add_const", &[7], Some("const7")).unwrap();
    let mut top = session.customize("top").unwrap();
    let before = top.module().clone();

    // s7 inlines fine, but no `add` call in top matches `const7` afterwards
    let err = top.compose_all([&s7, &s_add], Some("const7")).unwrap_err();
    assert!(matches!(err, CompileError::UnknownCallSite { .. }));
    assert_eq!(top.module(), &before);
    assert!(top.log().is_empty());

    top.compose_all([&s7], Some("const7")).unwrap();
    let block = top.module().op("add_const_const7").unwrap();
    assert!(matches!(&block.kind, OpKind::Block(b) if b.inlined_from.as_deref() == Some("add_const_const7")));
    assert!(matches!(top.log().last(), Some(LogEntry::Compose { site, .. }) if site == "add_const_const7"));
}

#[test]
fn test_generic_without_arguments_is_rejected() {
    let mut session = Session::new(program());
    let err = session.customize("add_const").unwrap_err();
    assert!(matches!(err, CompileError::TypeMismatch { .. }));
    let library: BTreeMap<String, Module> = session.library();
    assert!(!library.contains_key("add_const"));
}
