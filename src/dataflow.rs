//! Dataflow optimization pass
//!
//! Restructures the stage graph of a composed schedule into overlapped
//! dataflow regions. The pass runs a fixed list of [`Checkpoint`]s; each one
//! recomputes what it needs from the IR alone, so a run stopped after any
//! checkpoint can be resumed later with [`resume`] and ends in the same IR as
//! an uninterrupted run.
//!
//! A *scope* is an op list whose direct children are the stages:
//!
//! * `graph`: the top-level body, each composed function an atomic stage;
//! * `node`: the body of every inlined function, each loop nest a stage;
//! * `combined`: the graph scope first, then every node scope.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::analysis::buffer_use;
use crate::error::{CompileError, CompileResult};
use crate::ir::{AccessMode, Block, Expr, Loop, Module, Op, OpKind, Storage, TensorType};
use crate::schedule::{LogEntry, Schedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Graph,
    Node,
    Combined,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Granularity::Graph => "graph",
            Granularity::Node => "node",
            Granularity::Combined => "combined",
        })
    }
}

impl FromStr for Granularity {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "graph" => Ok(Granularity::Graph),
            "node" => Ok(Granularity::Node),
            "combined" => Ok(Granularity::Combined),
            other => Err(CompileError::parse_error(format!("Unknown dataflow granularity: {}", other))),
        }
    }
}

/// Named checkpoints, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Checkpoint {
    BuildGraph,
    ClassifyEdges,
    InsertChannels,
    MarkRegions,
    Verify,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 5] = [
        Checkpoint::BuildGraph,
        Checkpoint::ClassifyEdges,
        Checkpoint::InsertChannels,
        Checkpoint::MarkRegions,
        Checkpoint::Verify,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Checkpoint::BuildGraph => "build_graph",
            Checkpoint::ClassifyEdges => "classify_edges",
            Checkpoint::InsertChannels => "insert_channels",
            Checkpoint::MarkRegions => "mark_regions",
            Checkpoint::Verify => "verify",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Checkpoint {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Checkpoint::ALL
            .into_iter()
            .find(|cp| cp.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Checkpoint::ALL.iter().map(|cp| cp.name()).collect();
                CompileError::parse_error(format!("Unknown checkpoint `{}`; expected one of {}", s, names.join(", ")))
            })
    }
}

/// How a producer/consumer edge is realized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// FIFO: one writer and one reader, both walking the buffer in row-major order
    Stream,
    /// Double buffer: one writer and one reader disagreeing on order
    PingPong,
    /// Materialized intermediate buffer
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub name: String,
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub buffer: String,
    pub producer: usize,
    pub consumer: usize,
    pub kind: EdgeKind,
}

/// Stages of one scope and the buffers flowing between them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageGraph {
    pub scope: String,
    pub stages: Vec<Stage>,
    pub edges: Vec<Edge>,
}

fn is_region(op: &Op) -> bool {
    matches!(&op.kind, OpKind::Block(b) if b.dataflow && b.inlined_from.is_none())
}

fn is_stage(op: &Op) -> bool {
    !matches!(op.kind, OpKind::Alloc { .. } | OpKind::Return { .. })
}

/// Stage ops of a scope, looking through dataflow regions
fn stage_ops(ops: &[Op]) -> Vec<&Op> {
    let mut stages = Vec::new();
    for op in ops {
        match &op.kind {
            OpKind::Block(b) if is_region(op) => stages.extend(b.ops.iter().filter(|op| is_stage(op))),
            _ if is_stage(op) => stages.push(op),
            _ => {}
        }
    }
    stages
}

/// Buffers allocated directly in the scope and not returned from it
fn local_channels(ops: &[Op]) -> BTreeMap<String, TensorType> {
    let returned: BTreeSet<&str> = ops
        .iter()
        .filter_map(|op| match &op.kind {
            OpKind::Return { value } => Some(value.as_str()),
            _ => None,
        })
        .collect();
    let mut locals = BTreeMap::new();
    for op in ops {
        let allocs: Vec<&Op> = match &op.kind {
            OpKind::Block(b) if is_region(op) => b.ops.iter().collect(),
            _ => vec![op],
        };
        for op in allocs {
            if let OpKind::Alloc { buffer, ty, .. } = &op.kind {
                if !returned.contains(buffer.as_str()) {
                    locals.insert(buffer.clone(), ty.clone());
                }
            }
        }
    }
    locals
}

fn collect_chains<'o>(
    op: &'o Op,
    buffer: &str,
    chain: &mut Vec<&'o Loop>,
    out: &mut Vec<(Vec<&'o Loop>, Vec<Expr>, AccessMode)>,
) {
    match &op.kind {
        OpKind::Loop(l) => {
            chain.push(l);
            for child in &l.body {
                collect_chains(child, buffer, chain, out);
            }
            chain.pop();
        }
        OpKind::Block(b) => {
            for child in &b.ops {
                collect_chains(child, buffer, chain, out);
            }
        }
        _ => op.for_each_access(&mut |access, mode| {
            if access.buffer == buffer {
                out.push((chain.clone(), access.indices.clone(), mode));
            }
        }),
    }
}

/// The stage touches `buffer` exactly once per element, in row-major order
fn sequential(stage: &Op, buffer: &str, mode: AccessMode, ty: &TensorType) -> bool {
    let mut out = Vec::new();
    collect_chains(stage, buffer, &mut Vec::new(), &mut out);
    let [(chain, indices, access_mode)] = out.as_slice() else {
        return false;
    };
    *access_mode == mode
        && chain.len() == ty.rank()
        && chain.iter().zip(indices).zip(&ty.shape).all(|((l, index), extent)| {
            l.lower == 0 && l.step == 1 && l.upper == *extent as i64 && *index == Expr::var(l.var.as_str())
        })
}

impl StageGraph {
    pub fn build(scope: &str, ops: &[Op]) -> StageGraph {
        let stage_ops = stage_ops(ops);
        let stages: Vec<Stage> = stage_ops
            .iter()
            .map(|op| {
                let uses = buffer_use(op);
                Stage {
                    name: op.name.clone(),
                    reads: uses.reads,
                    writes: uses.writes,
                }
            })
            .collect();
        let locals = local_channels(ops);

        let buffers: BTreeSet<&String> = stages.iter().flat_map(|s| s.reads.iter().chain(&s.writes)).collect();
        let mut edges = Vec::new();
        for buffer in buffers {
            let writers: Vec<usize> = (0..stages.len()).filter(|k| stages[*k].writes.contains(buffer)).collect();
            let readers: Vec<usize> = (0..stages.len()).filter(|k| stages[*k].reads.contains(buffer)).collect();
            let channel = match (writers.as_slice(), readers.as_slice(), locals.get(buffer)) {
                ([w], [r], Some(ty)) if w < r => {
                    if sequential(stage_ops[*w], buffer, AccessMode::Write, ty)
                        && sequential(stage_ops[*r], buffer, AccessMode::Read, ty)
                    {
                        Some(EdgeKind::Stream)
                    } else {
                        Some(EdgeKind::PingPong)
                    }
                }
                _ => None,
            };
            for w in &writers {
                for r in readers.iter().filter(|r| *r > w) {
                    edges.push(Edge {
                        buffer: buffer.clone(),
                        producer: *w,
                        consumer: *r,
                        kind: channel.unwrap_or(EdgeKind::Memory),
                    });
                }
            }
        }
        StageGraph {
            scope: scope.to_string(),
            stages,
            edges,
        }
    }

    /// Storage each local buffer of the scope should have
    pub fn channel_kind(&self, buffer: &str) -> EdgeKind {
        self.edges
            .iter()
            .find(|e| e.buffer == buffer)
            .map(|e| e.kind)
            .unwrap_or(EdgeKind::Memory)
    }

    /// Stage ranges covering every channel, overlapping spans merged.
    /// A channel's producer and consumer always land in the same range.
    pub fn regions(&self) -> Vec<std::ops::Range<usize>> {
        let mut spans: Vec<std::ops::Range<usize>> = self
            .edges
            .iter()
            .filter(|e| e.kind != EdgeKind::Memory)
            .map(|e| e.producer..e.consumer + 1)
            .collect();
        spans.sort_by_key(|span| span.start);
        let mut regions: Vec<std::ops::Range<usize>> = Vec::new();
        for span in spans {
            match regions.last_mut() {
                Some(last) if span.start < last.end => last.end = last.end.max(span.end),
                _ => regions.push(span),
            }
        }
        regions
    }
}

/// Scope names: `None` is the module body, `Some(block)` an inlined block
fn scopes(module: &Module, granularity: Granularity) -> Vec<Option<String>> {
    let inlined: Vec<Option<String>> = module
        .find_all(&|op| matches!(&op.kind, OpKind::Block(b) if b.inlined_from.is_some()))
        .iter()
        .filter_map(|path| module.op_at(path).map(|op| Some(op.name.clone())))
        .collect();
    match granularity {
        Granularity::Graph => vec![None],
        Granularity::Node if inlined.is_empty() => vec![None],
        Granularity::Node => inlined,
        Granularity::Combined => std::iter::once(None).chain(inlined).collect(),
    }
}

fn scope_ops_mut<'m>(module: &'m mut Module, scope: &Option<String>) -> CompileResult<&'m mut Vec<Op>> {
    match scope {
        None => Ok(&mut module.body),
        Some(name) => {
            let path = module.find_path(name).ok_or_else(|| CompileError::unknown_op(name))?;
            module
                .op_at_mut(&path)
                .and_then(Op::children_mut)
                .ok_or_else(|| CompileError::unknown_op(name))
        }
    }
}

/// Undo earlier regions, move allocations to the front and the return to the end
fn normalize(ops: &mut Vec<Op>) {
    let mut flat = Vec::new();
    for op in ops.drain(..) {
        if is_region(&op) {
            if let OpKind::Block(b) = op.kind {
                flat.extend(b.ops);
            }
        } else {
            flat.push(op);
        }
    }
    let (allocs, rest): (Vec<Op>, Vec<Op>) = flat
        .into_iter()
        .partition(|op| matches!(op.kind, OpKind::Alloc { .. }));
    let (returns, stages): (Vec<Op>, Vec<Op>) = rest
        .into_iter()
        .partition(|op| matches!(op.kind, OpKind::Return { .. }));
    ops.extend(allocs);
    ops.extend(stages);
    ops.extend(returns);
}

fn insert_channels(ops: &mut [Op], graph: &StageGraph, depth: usize) {
    for op in ops.iter_mut() {
        if let OpKind::Alloc { buffer, storage, .. } = &mut op.kind {
            *storage = match graph.channel_kind(buffer) {
                EdgeKind::Stream => Storage::Stream { depth },
                EdgeKind::PingPong => Storage::PingPong,
                EdgeKind::Memory => Storage::Memory,
            };
        }
    }
}

fn mark_regions(ops: &mut Vec<Op>, graph: &StageGraph) {
    let regions = graph.regions();
    if regions.is_empty() {
        return;
    }
    let mut out = Vec::with_capacity(ops.len());
    let mut members = Vec::new();
    let mut stage = 0usize;
    for op in ops.drain(..) {
        if !is_stage(&op) {
            out.push(op);
            continue;
        }
        match regions.iter().position(|r| r.contains(&stage)) {
            Some(n) => {
                members.push(op);
                if regions[n].end == stage + 1 {
                    out.push(Op::new(
                        format!("{}.dataflow{}", graph.scope, n),
                        OpKind::Block(Block {
                            ops: std::mem::take(&mut members),
                            dataflow: true,
                            inlined_from: None,
                        }),
                    ));
                }
            }
            None => out.push(op),
        }
        stage += 1;
    }
    *ops = out;
}

/// Region stages must form a DAG under writer -> reader edges, and every
/// channel must connect one writer to one later reader in the same region
fn verify(scope: &str, ops: &[Op]) -> CompileResult<()> {
    let stages = stage_ops(ops);
    let mut region_of: BTreeMap<&str, &str> = BTreeMap::new();
    for op in ops {
        if let OpKind::Block(b) = &op.kind {
            if is_region(op) {
                check_acyclic(&b.ops)?;
                for member in &b.ops {
                    region_of.insert(member.name.as_str(), op.name.as_str());
                }
            }
        }
    }
    for op in ops.iter().flat_map(|op| match &op.kind {
        OpKind::Block(b) if is_region(op) => b.ops.iter().collect::<Vec<_>>(),
        _ => vec![op],
    }) {
        let OpKind::Alloc { buffer, storage, .. } = &op.kind else {
            continue;
        };
        if *storage == Storage::Memory {
            continue;
        }
        let writers: Vec<&Op> = stages.iter().copied().filter(|s| buffer_use(s).writes.contains(buffer)).collect();
        let readers: Vec<&Op> = stages.iter().copied().filter(|s| buffer_use(s).reads.contains(buffer)).collect();
        let ([writer], [reader]) = (writers.as_slice(), readers.as_slice()) else {
            return Err(CompileError::DataflowViolation {
                region: scope.to_string(),
                message: format!(
                    "channel `{}` has {} producer(s) and {} consumer(s)",
                    buffer,
                    writers.len(),
                    readers.len()
                ),
            });
        };
        let region = region_of.get(writer.name.as_str());
        if region.is_none() || region != region_of.get(reader.name.as_str()) || writer.name == reader.name {
            return Err(CompileError::DataflowViolation {
                region: region.map(|r| r.to_string()).unwrap_or_else(|| scope.to_string()),
                message: format!(
                    "channel `{}` from `{}` to `{}` does not stay inside one region",
                    buffer, writer.name, reader.name
                ),
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm over writer -> reader edges of a region's stages
fn check_acyclic(ops: &[Op]) -> CompileResult<()> {
    let stages: Vec<&Op> = ops.iter().filter(|op| is_stage(op)).collect();
    let uses: Vec<_> = stages.iter().map(|s| buffer_use(s)).collect();
    let mut successors = vec![BTreeSet::new(); stages.len()];
    let mut indegree = vec![0usize; stages.len()];
    for (w, wu) in uses.iter().enumerate() {
        for (r, ru) in uses.iter().enumerate() {
            if w != r && wu.writes.iter().any(|b| ru.reads.contains(b)) && successors[w].insert(r) {
                indegree[r] += 1;
            }
        }
    }
    let mut ready: VecDeque<usize> = (0..stages.len()).filter(|k| indegree[*k] == 0).collect();
    let mut visited = 0;
    while let Some(k) = ready.pop_front() {
        visited += 1;
        for next in &successors[k] {
            indegree[*next] -= 1;
            if indegree[*next] == 0 {
                ready.push_back(*next);
            }
        }
    }
    if visited == stages.len() {
        return Ok(());
    }
    Err(CompileError::CyclicDependency {
        stages: (0..stages.len())
            .filter(|k| indegree[*k] > 0)
            .map(|k| stages[k].name.clone())
            .collect(),
    })
}

fn run_checkpoint(module: &mut Module, scope: &Option<String>, checkpoint: Checkpoint, depth: usize) -> CompileResult<()> {
    let scope_name = scope.clone().unwrap_or_else(|| module.name.clone());
    let ops = scope_ops_mut(module, scope)?;
    match checkpoint {
        Checkpoint::BuildGraph => {
            normalize(ops);
            let graph = StageGraph::build(&scope_name, ops);
            trace!(scope = %scope_name, stages = graph.stages.len(), "stage graph");
        }
        Checkpoint::ClassifyEdges => {
            let graph = StageGraph::build(&scope_name, ops);
            for edge in &graph.edges {
                trace!(
                    scope = %scope_name,
                    buffer = %edge.buffer,
                    producer = %graph.stages[edge.producer].name,
                    consumer = %graph.stages[edge.consumer].name,
                    kind = ?edge.kind,
                    "edge"
                );
            }
        }
        Checkpoint::InsertChannels => {
            let graph = StageGraph::build(&scope_name, ops);
            insert_channels(ops, &graph, depth);
        }
        Checkpoint::MarkRegions => {
            let graph = StageGraph::build(&scope_name, ops);
            mark_regions(ops, &graph);
        }
        Checkpoint::Verify => verify(&scope_name, ops)?,
    }
    Ok(())
}

/// A residual call stays an atomic stage, unless its function is called
/// through more than one instantiation and so has no single body to stand for
fn check_residual_calls(module: &Module) -> CompileResult<()> {
    let sites = module.call_sites();
    let mut targets: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for (_, op) in &sites {
        if let Some(call) = op.as_call() {
            targets.entry(call.callee.as_str()).or_default().insert(call.target());
        }
    }
    for (path, op) in &sites {
        let Some(call) = op.as_call() else {
            continue;
        };
        if targets.get(call.callee.as_str()).is_some_and(|t| t.len() > 1) {
            trace!(?path, "residual call");
            return Err(CompileError::UnresolvedCall {
                callee: call.target(),
                site: op.name.clone(),
            });
        }
        trace!(site = %op.name, callee = %call.target(), "call kept as an atomic stage");
    }
    Ok(())
}

fn run(
    schedule: &Schedule,
    granularity: Granularity,
    after: Option<Checkpoint>,
    until: Option<Checkpoint>,
) -> CompileResult<Schedule> {
    check_residual_calls(&schedule.module)?;
    let mut module = schedule.module.clone();
    let scopes = scopes(&module, granularity);
    let depth = schedule.config.stream_depth;
    for checkpoint in Checkpoint::ALL {
        if after.is_some_and(|after| checkpoint <= after) {
            continue;
        }
        for scope in &scopes {
            run_checkpoint(&mut module, scope, checkpoint, depth)?;
        }
        debug!(module = %module.name, %granularity, %checkpoint, "checkpoint complete");
        if until == Some(checkpoint) {
            break;
        }
    }

    let mut optimized = schedule.clone();
    if module != schedule.module {
        optimized.module = module;
        optimized.log.push(LogEntry::Dataflow { granularity });
    }
    Ok(optimized)
}

/// Run the pass; with `debug_point` set, stop right after that checkpoint
pub fn optimize(schedule: &Schedule, granularity: Granularity, debug_point: Option<Checkpoint>) -> CompileResult<Schedule> {
    run(schedule, granularity, None, debug_point)
}

/// Continue a run that was stopped after `after`
pub fn resume(schedule: &Schedule, granularity: Granularity, after: Checkpoint) -> CompileResult<Schedule> {
    run(schedule, granularity, Some(after), None)
}

/// Stage graphs of every scope the pass would visit, for inspection
pub fn stage_graphs(schedule: &Schedule, granularity: Granularity) -> CompileResult<Vec<StageGraph>> {
    let mut module = schedule.module.clone();
    scopes(&module, granularity)
        .iter()
        .map(|scope| {
            let name = scope.clone().unwrap_or_else(|| module.name.clone());
            let ops = scope_ops_mut(&mut module, scope)?;
            Ok(StageGraph::build(&name, ops))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{alloc, grid, store, FunctionBuilder};
    use crate::config::CompilerConfig;
    use crate::equivalence::EquivalenceTracker;
    use crate::ir::DType;
    use crate::schedule::Origin;

    fn ty() -> TensorType {
        TensorType::new(DType::I32, [4, 4])
    }

    fn schedule(producer_swapped: bool) -> Schedule {
        let (i, j) = (Expr::var("i"), Expr::var("j"));
        let dims: &[(&str, i64)] = if producer_swapped { &[("j", 4), ("i", 4)] } else { &[("i", 4), ("j", 4)] };
        let module = FunctionBuilder::new("top")
            .returns(ty())
            .op(alloc("T", ty()))
            .op(grid(dims, vec![store("T", vec![i.clone(), j.clone()], i.clone() * 4 + j.clone())]).named("produce"))
            .op(alloc("R", ty()))
            .op(grid(
                &[("y", 4), ("x", 4)],
                vec![store(
                    "R",
                    vec![Expr::var("y"), Expr::var("x")],
                    Expr::load("T", vec![Expr::var("y"), Expr::var("x")]) + 1,
                )],
            )
            .named("consume"))
            .ret("R")
            .build();
        let origin = Origin {
            base: "top".into(),
            inst_args: vec![],
            tag: None,
        };
        Schedule::new(module, origin, EquivalenceTracker::shared(), CompilerConfig::default())
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
    fn test_checkpoint_names_round_trip() {
        for cp in Checkpoint::ALL {
            assert_eq!(cp.name().parse::<Checkpoint>().unwrap(), cp);
        }
        assert!("lower".parse::<Checkpoint>().is_err());
    }

    #[test]
    fn test_stream_and_region() {
        let s = optimize(&schedule(false), Granularity::Graph, None).unwrap();
        assert_eq!(storage_of(&s, "T"), Some(Storage::Stream { depth: 2 }));
        assert_eq!(storage_of(&s, "R"), Some(Storage::Memory));
        let region = s.module().op("top.dataflow0").unwrap();
        let names: Vec<&str> = region.children().unwrap().iter().map(|op| op.name.as_str()).collect();
        assert_eq!(names, vec!["produce", "consume"]);
        assert!(matches!(s.log().last(), Some(LogEntry::Dataflow { granularity: Granularity::Graph })));
    }

    #[test]
    fn test_order_mismatch_uses_pingpong() {
        let s = optimize(&schedule(true), Granularity::Graph, None).unwrap();
        assert_eq!(storage_of(&s, "T"), Some(Storage::PingPong));
        let graphs = stage_graphs(&schedule(true), Granularity::Graph).unwrap();
        assert_eq!(graphs[0].edges[0].kind, EdgeKind::PingPong);
    }

    #[test]
    fn test_idempotent() {
        let once = optimize(&schedule(false), Granularity::Combined, None).unwrap();
        let twice = optimize(&once, Granularity::Combined, None).unwrap();
        assert_eq!(once.module(), twice.module());
        assert_eq!(once.log().len(), twice.log().len());
    }

    #[test]
    fn test_truncated_run_resumes() {
        let full = optimize(&schedule(false), Granularity::Graph, None).unwrap();
        for cp in Checkpoint::ALL {
            let partial = optimize(&schedule(false), Granularity::Graph, Some(cp)).unwrap();
            let resumed = resume(&partial, Granularity::Graph, cp).unwrap();
            assert_eq!(resumed.module(), full.module(), "resumed after {}", cp);
        }
        let early = optimize(&schedule(false), Granularity::Graph, Some(Checkpoint::ClassifyEdges)).unwrap();
        assert_eq!(storage_of(&early, "T"), Some(Storage::Memory));
    }

    #[test]
    fn test_regions_span_every_channel() {
        let stage = |name: &str| Stage {
            name: name.to_string(),
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
        };
        let edge = |buffer: &str, producer, consumer, kind| Edge {
            buffer: buffer.to_string(),
            producer,
            consumer,
            kind,
        };
        let mut graph = StageGraph {
            scope: "top".into(),
            stages: ["a", "b", "c", "d", "e"].into_iter().map(stage).collect(),
            edges: vec![
                edge("X", 0, 2, EdgeKind::Stream),
                edge("Y", 1, 2, EdgeKind::PingPong),
                edge("Z", 2, 3, EdgeKind::Memory),
            ],
        };
        assert_eq!(graph.regions(), vec![0..3]);

        // Touching but not overlapping spans stay apart
        graph.edges.push(edge("W", 3, 4, EdgeKind::Stream));
        assert_eq!(graph.regions(), vec![0..3, 3..5]);
    }

    #[test]
    fn test_broken_channel_is_rejected() {
        let mut s = optimize(&schedule(false), Granularity::Graph, None).unwrap();
        // A second consumer outside the region
        s.module.body.insert(
            s.module.body.len() - 1,
            grid(&[("k", 4)], vec![store("R", vec![Expr::Int(0), Expr::var("k")], Expr::load("T", vec![Expr::Int(0), Expr::var("k")]))])
                .named("extra"),
        );
        let err = resume(&s, Granularity::Graph, Checkpoint::MarkRegions).unwrap_err();
        assert!(matches!(err, CompileError::DataflowViolation { .. }));
    }
}
