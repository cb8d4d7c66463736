//! Index analysis for legality checks
//!
//! Indices are decomposed into affine forms over loop variables. Two accesses
//! to the same buffer are compared dimension by dimension to obtain a
//! per-variable dependence distance, which the loop primitives consult before
//! touching the IR.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::ir::{AccessMode, BinOp, Expr, Loop, Op, OpKind};

/// `sum(coeff * var) + constant`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Affine {
    pub terms: BTreeMap<String, i64>,
    pub constant: i64,
}

impl Affine {
    pub fn constant(value: i64) -> Self {
        Self {
            terms: BTreeMap::new(),
            constant: value,
        }
    }

    pub fn var(name: &str) -> Self {
        Self {
            terms: BTreeMap::from([(name.to_string(), 1)]),
            constant: 0,
        }
    }

    /// Affine form of `expr`, or `None` for loads, floats and non-linear terms
    pub fn from_expr(expr: &Expr) -> Option<Affine> {
        match expr {
            Expr::Int(v) => Some(Affine::constant(*v)),
            Expr::Var(name) => Some(Affine::var(name)),
            Expr::Binary(BinOp::Add, l, r) => Some(Affine::from_expr(l)?.add(&Affine::from_expr(r)?, 1)),
            Expr::Binary(BinOp::Sub, l, r) => Some(Affine::from_expr(l)?.add(&Affine::from_expr(r)?, -1)),
            Expr::Binary(BinOp::Mul, l, r) => {
                let (l, r) = (Affine::from_expr(l)?, Affine::from_expr(r)?);
                if l.is_constant() {
                    Some(r.scale(l.constant))
                } else if r.is_constant() {
                    Some(l.scale(r.constant))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn add(mut self, other: &Affine, sign: i64) -> Affine {
        for (var, coeff) in &other.terms {
            *self.terms.entry(var.clone()).or_insert(0) += sign * coeff;
        }
        self.terms.retain(|_, c| *c != 0);
        self.constant += sign * other.constant;
        self
    }

    fn scale(mut self, factor: i64) -> Affine {
        for coeff in self.terms.values_mut() {
            *coeff *= factor;
        }
        self.terms.retain(|_, c| *c != 0);
        self.constant *= factor;
        self
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn coeff(&self, var: &str) -> i64 {
        self.terms.get(var).copied().unwrap_or(0)
    }

    pub fn uses(&self, var: &str) -> bool {
        self.coeff(var) != 0
    }

    /// `self` with the term for `var` removed
    pub fn without(&self, var: &str) -> Affine {
        let mut out = self.clone();
        out.terms.remove(var);
        out
    }
}

/// One memory access found inside an op tree
#[derive(Debug, Clone, PartialEq)]
pub struct AccessInfo {
    /// Name of the op performing the access
    pub op: String,
    pub buffer: String,
    pub indices: Vec<Expr>,
    pub mode: AccessMode,
}

/// All accesses under `ops`, in program order
pub fn collect_accesses(ops: &[Op]) -> Vec<AccessInfo> {
    let mut out = Vec::new();
    for op in ops {
        op.walk(&mut |op| {
            if op.children().is_some() {
                return;
            }
            op.for_each_access(&mut |access, mode| {
                out.push(AccessInfo {
                    op: op.name.clone(),
                    buffer: access.buffer.clone(),
                    indices: access.indices.clone(),
                    mode,
                })
            });
        });
    }
    out
}

/// Induction variables of every loop under `ops`
pub fn loop_vars(ops: &[Op]) -> BTreeSet<String> {
    let mut vars = BTreeSet::new();
    for op in ops {
        op.walk(&mut |op| {
            if let Some(l) = op.as_loop() {
                vars.insert(l.var.clone());
            }
        });
    }
    vars
}

/// Buffers allocated under `ops`
pub fn local_buffers(ops: &[Op]) -> BTreeSet<String> {
    let mut buffers = BTreeSet::new();
    for op in ops {
        op.walk(&mut |op| match &op.kind {
            OpKind::Alloc { buffer, .. } => {
                buffers.insert(buffer.clone());
            }
            OpKind::Call(call) => {
                if let Some(result) = &call.result {
                    buffers.insert(result.name.clone());
                }
            }
            _ => {}
        });
    }
    buffers
}

/// Buffers an op tree reads and writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferUse {
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
}

pub fn buffer_use(op: &Op) -> BufferUse {
    let mut usage = BufferUse::default();
    op.walk(&mut |op| match &op.kind {
        OpKind::Call(call) => {
            // callees may read and write any buffer they receive
            for arg in &call.args {
                usage.reads.insert(arg.clone());
                usage.writes.insert(arg.clone());
            }
            if let Some(result) = &call.result {
                usage.writes.insert(result.name.clone());
            }
        }
        OpKind::Return { value } => {
            usage.reads.insert(value.clone());
        }
        _ => {}
    });
    op.for_each_access(&mut |access, mode| {
        match mode {
            AccessMode::Read => usage.reads.insert(access.buffer.clone()),
            AccessMode::Write => usage.writes.insert(access.buffer.clone()),
        };
    });
    usage
}

/// Dependence distance of one loop variable between two accesses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distance {
    Known(i64),
    Any,
}

/// Whether two accesses can touch the same element, and at which distances
#[derive(Debug, Clone, PartialEq)]
pub enum Alias {
    Never,
    /// Distances per variable; variables absent from the map are unconstrained
    Vector(BTreeMap<String, Distance>),
    /// Some index is not affine
    Unknown,
}

impl Alias {
    pub fn distance(&self, var: &str) -> Distance {
        match self {
            Alias::Vector(map) => map.get(var).copied().unwrap_or(Distance::Any),
            _ => Distance::Any,
        }
    }
}

/// Compare `a` (at iteration I) with `b` (at iteration J); a known distance
/// for variable `x` is `I_x - J_x`
pub fn alias(a: &AccessInfo, b: &AccessInfo) -> Alias {
    if a.buffer != b.buffer || a.indices.len() != b.indices.len() {
        return if a.buffer == b.buffer { Alias::Unknown } else { Alias::Never };
    }
    let mut distances = BTreeMap::new();
    for (ia, ib) in a.indices.iter().zip(&b.indices) {
        let (Some(fa), Some(fb)) = (Affine::from_expr(ia), Affine::from_expr(ib)) else {
            return Alias::Unknown;
        };
        if fa.terms != fb.terms {
            continue;
        }
        let delta = fb.constant - fa.constant;
        match fa.terms.len() {
            0 if delta != 0 => return Alias::Never,
            1 => {
                let (var, coeff) = match fa.terms.iter().next() {
                    Some((var, coeff)) => (var.clone(), *coeff),
                    None => continue,
                };
                if delta % coeff != 0 {
                    return Alias::Never;
                }
                let d = delta / coeff;
                match distances.get(&var) {
                    Some(Distance::Known(prev)) if *prev != d => return Alias::Never,
                    _ => {
                        distances.insert(var, Distance::Known(d));
                    }
                }
            }
            _ => {}
        }
    }
    Alias::Vector(distances)
}

/// `X[idx] = X[idx] (+|*|min|max) e`: returns the accumulated access
pub fn accumulation(op: &Op) -> Option<&crate::ir::Access> {
    let OpKind::Store { access, value } = &op.kind else {
        return None;
    };
    let Expr::Binary(BinOp::Add | BinOp::Mul | BinOp::Min | BinOp::Max, l, r) = value else {
        return None;
    };
    let matches = |e: &Expr| matches!(e, Expr::Load(a) if a.buffer == access.buffer && a.indices == access.indices);
    if matches(l) || matches(r) {
        Some(access)
    } else {
        None
    }
}

/// A dependence between two iterations of a loop
#[derive(Debug, Clone, PartialEq)]
pub struct CarriedDependence {
    pub buffer: String,
    pub writer: String,
    pub other: String,
    pub distance: Option<i64>,
}

/// Dependences carried by `lp` itself: enclosing loop variables are held
/// fixed, nested ones range freely. Buffers allocated inside the body are
/// private to an iteration.
pub fn carried_dependences(lp: &Loop) -> Vec<CarriedDependence> {
    let accesses = collect_accesses(&lp.body);
    let mut inner = loop_vars(&lp.body);
    inner.insert(lp.var.clone());
    let private = local_buffers(&lp.body);

    let mut found: Vec<CarriedDependence> = Vec::new();
    for w in accesses.iter().filter(|a| a.mode == AccessMode::Write) {
        if private.contains(&w.buffer) {
            continue;
        }
        for other in accesses.iter().filter(|a| a.buffer == w.buffer) {
            let relation = alias(w, other);
            let distance = match &relation {
                Alias::Never => continue,
                Alias::Unknown => None,
                Alias::Vector(map) => {
                    let held_apart = map.iter().any(|(var, d)| {
                        !inner.contains(var) && matches!(d, Distance::Known(x) if *x != 0)
                    });
                    if held_apart {
                        continue;
                    }
                    match relation.distance(&lp.var) {
                        Distance::Known(0) => continue,
                        Distance::Known(d) => Some(d),
                        Distance::Any => None,
                    }
                }
            };
            let dep = CarriedDependence {
                buffer: w.buffer.clone(),
                writer: w.op.clone(),
                other: other.op.clone(),
                distance,
            };
            if !found.contains(&dep) {
                trace!(loop_var = %lp.var, buffer = %dep.buffer, writer = %dep.writer, other = %dep.other, "carried dependence");
                found.push(dep);
            }
        }
    }
    found
}

fn directions(d: Distance) -> &'static [i8] {
    match d {
        Distance::Known(0) => &[0],
        Distance::Known(x) if x > 0 => &[1],
        Distance::Known(_) => &[-1],
        Distance::Any => &[-1, 0, 1],
    }
}

fn lex_sign(dirs: &[i8]) -> i8 {
    dirs.iter().copied().find(|d| *d != 0).unwrap_or(0)
}

fn permutation_flips(choices: &[&[i8]], a: usize, b: usize, current: &mut Vec<i8>) -> bool {
    if current.len() == choices.len() {
        let before = lex_sign(current);
        let mut swapped = current.clone();
        swapped.swap(a, b);
        return before != 0 && lex_sign(&swapped) != before;
    }
    for d in choices[current.len()] {
        current.push(*d);
        let flips = permutation_flips(choices, a, b, current);
        current.pop();
        if flips {
            return true;
        }
    }
    false
}

/// Check whether exchanging the loops at positions `a` and `b` of the
/// perfect nest `chain` (outermost first) would reverse a dependence.
/// `body` is the innermost body of the nest. Returns the offending buffer.
pub fn reorder_violation(chain: &[String], body: &[Op], a: usize, b: usize) -> Option<String> {
    let accesses = collect_accesses(body);
    let mut nested: BTreeSet<String> = chain.iter().cloned().collect();
    nested.extend(loop_vars(body));
    let accumulators: BTreeSet<String> = body
        .iter()
        .flat_map(|op| {
            let mut names = Vec::new();
            op.walk(&mut |op| {
                if accumulation(op).is_some() {
                    names.push(op.name.clone());
                }
            });
            names
        })
        .collect();

    for w in accesses.iter().filter(|x| x.mode == AccessMode::Write) {
        for other in accesses.iter().filter(|x| x.buffer == w.buffer) {
            if other.op == w.op && accumulators.contains(&w.op) {
                continue;
            }
            let relation = alias(w, other);
            match &relation {
                Alias::Never => continue,
                Alias::Unknown => return Some(w.buffer.clone()),
                Alias::Vector(map) => {
                    let held_apart = map.iter().any(|(var, d)| {
                        !nested.contains(var) && matches!(d, Distance::Known(x) if *x != 0)
                    });
                    if held_apart {
                        continue;
                    }
                }
            }
            let choices: Vec<&[i8]> = chain.iter().map(|v| directions(relation.distance(v))).collect();
            if permutation_flips(&choices, a, b, &mut Vec::new()) {
                trace!(buffer = %w.buffer, writer = %w.op, other = %other.op, "reorder reverses dependence");
                return Some(w.buffer.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{for_loop, reduction, store};

    fn i() -> Expr {
        Expr::var("i")
    }

    #[test]
    fn test_affine_from_expr() {
        let e = (Expr::var("i") * 2 + Expr::var("j")) - 3;
        let aff = Affine::from_expr(&e).unwrap();
        assert_eq!(aff.coeff("i"), 2);
        assert_eq!(aff.coeff("j"), 1);
        assert_eq!(aff.constant, -3);
        assert!(Affine::from_expr(&(Expr::var("i") * Expr::var("j"))).is_none());
    }

    #[test]
    fn test_shifted_read_is_carried() {
        // A[i] = A[i - 1] + 1
        let op = for_loop("i", 1, 8, vec![store("A", vec![i()], Expr::load("A", vec![i() - 1]) + 1)]);
        let deps = carried_dependences(op.as_loop().unwrap());
        assert!(deps.iter().any(|d| d.distance == Some(-1)));
    }

    #[test]
    fn test_elementwise_not_carried() {
        let op = for_loop("i", 0, 8, vec![store("B", vec![i()], Expr::load("A", vec![i()]) + 1)]);
        assert!(carried_dependences(op.as_loop().unwrap()).is_empty());
    }

    #[test]
    fn test_accumulation_is_carried_by_reduction_loop() {
        let body = store(
            "C",
            vec![Expr::var("i")],
            Expr::load("C", vec![Expr::var("i")]) + Expr::load("A", vec![Expr::var("i"), Expr::var("k")]),
        );
        assert!(accumulation(&body).is_some());
        let op = reduction("k", 0, 4, vec![body]);
        let deps = carried_dependences(op.as_loop().unwrap());
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].distance, None);
    }

    #[test]
    fn test_reorder_violation_on_wavefront() {
        // A[i][j] = A[i - 1][j + 1]: distance (1, -1)
        let body = vec![store(
            "A",
            vec![Expr::var("i"), Expr::var("j")],
            Expr::load("A", vec![Expr::var("i") - 1, Expr::var("j") + 1]),
        )];
        let chain = vec!["i".to_string(), "j".to_string()];
        assert_eq!(reorder_violation(&chain, &body, 0, 1), Some("A".to_string()));
    }

    #[test]
    fn test_reorder_legal_for_matmul() {
        let body = vec![store(
            "C",
            vec![Expr::var("i"), Expr::var("j")],
            Expr::load("C", vec![Expr::var("i"), Expr::var("j")])
                + Expr::load("A", vec![Expr::var("i"), Expr::var("k")]) * Expr::load("B", vec![Expr::var("k"), Expr::var("j")]),
        )];
        let chain: Vec<String> = ["i", "j", "k"].iter().map(|s| s.to_string()).collect();
        assert_eq!(reorder_violation(&chain, &body, 0, 2), None);
        assert_eq!(reorder_violation(&chain, &body, 1, 2), None);
    }

    #[test]
    fn test_constant_indices_never_alias() {
        let a = AccessInfo { op: "s".into(), buffer: "A".into(), indices: vec![Expr::Int(0)], mode: AccessMode::Write };
        let b = AccessInfo { op: "t".into(), buffer: "A".into(), indices: vec![Expr::Int(1)], mode: AccessMode::Read };
        assert_eq!(alias(&a, &b), Alias::Never);
    }
}
