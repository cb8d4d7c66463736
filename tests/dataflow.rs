use pretty_assertions::assert_eq;

use accel_schedule::builder::{alloc, call, grid, store, FunctionBuilder};
use accel_schedule::dataflow::{stage_graphs, EdgeKind};
use accel_schedule::{
    emit, optimize, resume, Checkpoint, CompileError, DType, Expr, Granularity, Interpreter, LogEntry, Module,
    OpKind, Program, Schedule, Session, Storage, TensorType,
};

fn mat() -> TensorType {
    TensorType::new(DType::I32, [10, 10])
}

/// stageA() -> A[i,j] = i + j, written row-major unless `column_major`
fn stage_a(column_major: bool) -> Module {
    let (i, j) = (Expr::var("i"), Expr::var("j"));
    let dims: &[(&str, i64)] = if column_major { &[("j", 10), ("i", 10)] } else { &[("i", 10), ("j", 10)] };
    FunctionBuilder::new("stageA")
        .returns(mat())
        .alloc("A", mat())
        .op(grid(dims, vec![store("A", vec![i.clone(), j.clone()], i + j)]))
        .ret("A")
        .build()
}

/// stageB(A) -> B[i,j] = A[i,j] + 1
fn stage_b() -> Module {
    let (i, j) = (Expr::var("i"), Expr::var("j"));
    FunctionBuilder::new("stageB")
        .param("A", mat())
        .returns(mat())
        .alloc("B", mat())
        .op(grid(
            &[("i", 10), ("j", 10)],
            vec![store("B", vec![i.clone(), j.clone()], Expr::load("A", vec![i, j]) + 1)],
        ))
        .ret("B")
        .build()
}

fn top() -> Module {
    FunctionBuilder::new("top")
        .returns(mat())
        .op(call("stageA").result("A", mat()).build())
        .op(call("stageB").arg("A").result("B", mat()).build())
        .ret("B")
        .build()
}

/// stageB(A) -> B[i,j] = (A[i,j] + 1) * 2, as two loop nests over a local T
fn stage_b_two_nests() -> Module {
    let (i, j) = (Expr::var("i"), Expr::var("j"));
    let at = || vec![Expr::var("i"), Expr::var("j")];
    FunctionBuilder::new("stageB")
        .param("A", mat())
        .returns(mat())
        .alloc("T", mat())
        .op(grid(&[("i", 10), ("j", 10)], vec![store("T", at(), Expr::load("A", at()) + 1)]).named("inc"))
        .alloc("B", mat())
        .op(grid(&[("i", 10), ("j", 10)], vec![store("B", vec![i, j], Expr::load("T", at()) * 2)]).named("dbl"))
        .ret("B")
        .build()
}

fn composed(session: &mut Session) -> Schedule {
    let a = session.customize("stageA").unwrap();
    let b = session.customize("stageB").unwrap();
    let mut top = session.customize("top").unwrap();
    top.compose_all([&a, &b], None).unwrap();
    top
}

fn session(column_major: bool) -> Session {
    Session::new(Program::new().with(stage_a(column_major)).with(stage_b()).with(top()))
}

fn storage_of(s: &Schedule, buffer: &str) -> Option<Storage> {
    let mut found = None;
    s.module().walk(&mut |op| {
        if let OpKind::Alloc { buffer: b, storage, .. } = &op.kind {
            if b == buffer {
                found = Some(storage.clone());
            }
        }
    });
    found
}

#[test]
fn test_two_stage_pipeline() {
    let mut session = session(false);
    let top = composed(&mut session);
    let optimized = optimize(&top, Granularity::Graph, None).unwrap();

    assert_eq!(storage_of(&optimized, "A"), Some(Storage::Stream { depth: 2 }));
    assert_eq!(storage_of(&optimized, "B"), Some(Storage::Memory));
    let region = optimized.module().op("top.dataflow0").unwrap();
    let stages: Vec<&str> = region.children().unwrap().iter().map(|op| op.name.as_str()).collect();
    assert_eq!(stages, vec!["stageA", "stageB"]);

    let library = session.library();
    let out = Interpreter::new(&library).run(optimized.module(), vec![]).unwrap();
    let expected: Vec<i64> = (0..10).flat_map(|i| (0..10).map(move |j| i + j + 1)).collect();
    assert_eq!(out.result.unwrap().to_i64_vec(), expected);

    let hls = emit(&optimized, &library).unwrap();
    assert_eq!(hls.pragma_count("dataflow"), 1);
    assert!(hls.code.contains("#pragma HLS stream variable=A depth=2"));
}

#[test]
fn test_disagreeing_order_gets_pingpong() {
    let mut session = session(true);
    let top = composed(&mut session);
    let graphs = stage_graphs(&top, Granularity::Graph).unwrap();
    assert_eq!(graphs.len(), 1);
    assert_eq!(graphs[0].edges.len(), 1);
    assert_eq!(graphs[0].edges[0].kind, EdgeKind::PingPong);

    let optimized = optimize(&top, Granularity::Graph, None).unwrap();
    assert_eq!(storage_of(&optimized, "A"), Some(Storage::PingPong));
    assert!(emit(&optimized, &session.library()).unwrap().code.contains("type=pipo"));
}

#[test]
fn test_optimize_is_idempotent() {
    for kind in [Granularity::Graph, Granularity::Node, Granularity::Combined] {
        let mut session = session(false);
        let top = composed(&mut session);
        let once = optimize(&top, kind, None).unwrap();
        let twice = optimize(&once, kind, None).unwrap();
        assert_eq!(once.module(), twice.module(), "{}", kind);
        assert_eq!(once.log().len(), twice.log().len(), "{}", kind);
    }
}

#[test]
fn test_every_checkpoint_resumes_to_the_full_run() {
    let mut session = session(false);
    let top = composed(&mut session);
    for kind in [Granularity::Graph, Granularity::Combined] {
        let full = optimize(&top, kind, None).unwrap();
        for cp in Checkpoint::ALL {
            let partial = optimize(&top, kind, Some(cp)).unwrap();
            let finished = resume(&partial, kind, cp).unwrap();
            assert_eq!(finished.module(), full.module(), "{} after {}", kind, cp);
        }
    }

    let before_regions = optimize(&top, Granularity::Graph, Some(Checkpoint::InsertChannels)).unwrap();
    assert_eq!(storage_of(&before_regions, "A"), Some(Storage::Stream { depth: 2 }));
    assert!(before_regions.module().op("top.dataflow0").is_none());
}

#[test]
fn test_node_checkpoints_resume_to_the_full_run() {
    let mut session = Session::new(Program::new().with(stage_a(false)).with(stage_b_two_nests()).with(top()));
    let top = composed(&mut session);

    let full = optimize(&top, Granularity::Node, None).unwrap();
    assert_eq!(storage_of(&full, "stageB.T"), Some(Storage::Stream { depth: 2 }));
    // Node regions form inside the inlined body only
    let region = full.module().op("stageB.dataflow0").unwrap();
    let stages: Vec<&str> = region.children().unwrap().iter().map(|op| op.name.as_str()).collect();
    assert_eq!(stages, vec!["stageB.inc", "stageB.dbl"]);
    assert!(full.module().op("top.dataflow0").is_none());

    for cp in Checkpoint::ALL {
        let partial = optimize(&top, Granularity::Node, Some(cp)).unwrap();
        let finished = resume(&partial, Granularity::Node, cp).unwrap();
        assert_eq!(finished.module(), full.module(), "node after {}", cp);
    }

    let library = session.library();
    let out = Interpreter::new(&library).run(full.module(), vec![]).unwrap();
    let expected: Vec<i64> = (0..10).flat_map(|i| (0..10).map(move |j| 2 * (i + j + 1))).collect();
    assert_eq!(out.result.unwrap().to_i64_vec(), expected);
}

#[test]
fn test_fan_in_shares_one_region() {
    let (i, j) = (Expr::var("i"), Expr::var("j"));
    let at = || vec![Expr::var("i"), Expr::var("j")];
    let gen_a = FunctionBuilder::new("genA")
        .returns(mat())
        .alloc("A", mat())
        .op(grid(&[("i", 10), ("j", 10)], vec![store("A", at(), i.clone() + j.clone())]))
        .ret("A")
        .build();
    let gen_b = FunctionBuilder::new("genB")
        .returns(mat())
        .alloc("B", mat())
        .op(grid(&[("i", 10), ("j", 10)], vec![store("B", at(), i * j)]))
        .ret("B")
        .build();
    let add2 = FunctionBuilder::new("add2")
        .param("A", mat())
        .param("B", mat())
        .returns(mat())
        .alloc("C", mat())
        .op(grid(
            &[("i", 10), ("j", 10)],
            vec![store("C", at(), Expr::load("A", at()) + Expr::load("B", at()))],
        ))
        .ret("C")
        .build();
    let top = FunctionBuilder::new("top")
        .returns(mat())
        .op(call("genA").result("A", mat()).build())
        .op(call("genB").result("B", mat()).build())
        .op(call("add2").arg("A").arg("B").result("C", mat()).build())
        .ret("C")
        .build();
    let mut session = Session::new(Program::new().with(gen_a).with(gen_b).with(add2).with(top));
    let parts: Vec<Schedule> = ["genA", "genB", "add2"]
        .into_iter()
        .map(|name| session.customize(name).unwrap())
        .collect();
    let mut top = session.customize("top").unwrap();
    top.compose_all(parts.iter(), None).unwrap();

    let optimized = optimize(&top, Granularity::Graph, None).unwrap();
    assert_eq!(storage_of(&optimized, "A"), Some(Storage::Stream { depth: 2 }));
    assert_eq!(storage_of(&optimized, "B"), Some(Storage::Stream { depth: 2 }));
    let region = optimized.module().op("top.dataflow0").unwrap();
    let stages: Vec<&str> = region.children().unwrap().iter().map(|op| op.name.as_str()).collect();
    assert_eq!(stages, vec!["genA", "genB", "add2"]);

    let library = session.library();
    let out = Interpreter::new(&library).run(optimized.module(), vec![]).unwrap();
    let expected: Vec<i64> = (0..10).flat_map(|i| (0..10).map(move |j| i + j + i * j)).collect();
    assert_eq!(out.result.unwrap().to_i64_vec(), expected);
    assert_eq!(emit(&optimized, &library).unwrap().pragma_count("dataflow"), 1);
}

#[test]
fn test_single_instance_calls_are_atomic_stages() {
    let mut session = session(false);
    let top = session.customize("top").unwrap();
    let optimized = optimize(&top, Granularity::Graph, None).unwrap();
    assert_eq!(optimized.module().call_sites().len(), 2);

    let library = session.library();
    let out = Interpreter::new(&library).run(optimized.module(), vec![]).unwrap();
    let expected: Vec<i64> = (0..10).flat_map(|i| (0..10).map(move |j| i + j + 1)).collect();
    assert_eq!(out.result.unwrap().to_i64_vec(), expected);

    // Half composed: the remaining stageB call is still a single instance
    let a = session.customize("stageA").unwrap();
    let mut partial = session.customize("top").unwrap();
    partial.compose(&a, None).unwrap();
    assert!(optimize(&partial, Granularity::Graph, None).is_ok());
}

#[test]
fn test_call_with_several_instances_is_rejected() {
    let v = TensorType::new(DType::I32, [4]);
    let i = Expr::var("i");
    let bump = FunctionBuilder::new("bump")
        .param("A", v.clone())
        .returns(v.clone())
        .alloc("B", v.clone())
        .op(grid(&[("i", 4)], vec![store("B", vec![i.clone()], Expr::load("A", vec![i]) + Expr::var("N"))]))
        .ret("B")
        .build();
    let twice = FunctionBuilder::new("twice")
        .param("X", v.clone())
        .returns(v.clone())
        .op(call("bump").inst(&[1]).arg("X").result("Y", v.clone()).build())
        .op(call("bump").inst(&[2]).arg("Y").result("Z", v).build())
        .ret("Z")
        .build();
    let mut session = Session::new(Program::new().with_generic(bump, &["N"]).with(twice));
    let s = session.customize("twice").unwrap();
    let err = optimize(&s, Granularity::Graph, None).unwrap_err();
    assert!(matches!(err, CompileError::UnresolvedCall { ref callee, .. } if callee.starts_with("bump")));
}

#[test]
fn test_cycle_inside_region_is_fatal() {
    let v = TensorType::new(DType::I32, [4]);
    let i = Expr::var("i");
    let module = FunctionBuilder::new("loopback")
        .op(alloc("X", v.clone()))
        .op(alloc("Y", v))
        .op(grid(&[("i", 4)], vec![store("X", vec![i.clone()], Expr::load("Y", vec![i.clone()]))]).named("p"))
        .op(grid(&[("i", 4)], vec![store("Y", vec![i.clone()], Expr::load("X", vec![i]) + 1)]).named("q"))
        .build();
    let mut session = Session::new(Program::new().with(module));
    let s = session.customize("loopback").unwrap();
    let err = optimize(&s, Granularity::Graph, None).unwrap_err();
    assert!(matches!(err, CompileError::CyclicDependency { .. }));

    // Stopping before verification is a cancellation point, not a failure
    let partial = optimize(&s, Granularity::Graph, Some(Checkpoint::MarkRegions)).unwrap();
    assert!(matches!(partial.log().last(), Some(LogEntry::Dataflow { .. })));
}
