//! Memory primitives: partition, buffer_at and reuse_at
//!
//! Partitions are recorded per buffer on the module; every access to a
//! partitioned buffer carries one bank-select expression per partition,
//! recomputed by [`refresh_banks`] whenever the IR around it changes.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::analysis::{collect_accesses, loop_vars, AccessInfo, Affine};
use crate::error::{CompileError, CompileResult};
use crate::ir::{
    Access, AccessMode, Block, Expr, Loop, LoopKind, Module, Op, OpKind, Partition, PartitionKind, Storage,
    TensorType,
};

/// Split `buffer`'s storage into banks along `dim` (1-based, 0 = every dim)
pub fn partition(module: &mut Module, buffer: &str, dim: usize, factor: usize, kind: PartitionKind) -> CompileResult<()> {
    let ty = module
        .buffer_type(buffer)
        .ok_or_else(|| CompileError::unknown_value(buffer))?;
    if ty.rank() == 0 {
        return Err(CompileError::illegal("partition", format!("`{}` is a scalar", buffer)));
    }
    if dim > ty.rank() {
        return Err(CompileError::illegal(
            "partition",
            format!("dim {} is out of range for `{}` of rank {}", dim, buffer, ty.rank()),
        ));
    }
    let dims: Vec<usize> = if dim == 0 { (1..=ty.rank()).collect() } else { vec![dim] };

    let mut parts = Vec::new();
    for d in dims {
        let extent = ty.shape[d - 1];
        let factor = match kind {
            PartitionKind::Complete if factor == 0 || factor == extent => extent,
            PartitionKind::Complete => {
                return Err(CompileError::illegal(
                    "partition",
                    format!("complete partition of `{}` dim {} needs factor 0 or {}, got {}", buffer, d, extent, factor),
                ))
            }
            PartitionKind::Block | PartitionKind::Cyclic => {
                if factor == 0 || factor > extent || extent % factor != 0 {
                    return Err(CompileError::illegal(
                        "partition",
                        format!("factor {} does not evenly split `{}` dim {} of extent {}", factor, buffer, d, extent),
                    ));
                }
                factor
            }
        };
        parts.push(Partition { dim: d, factor, kind });
    }

    let recorded = module.partitions.entry(buffer.to_string()).or_default();
    for part in parts {
        match recorded.iter_mut().find(|p| p.dim == part.dim) {
            Some(existing) => {
                if *existing != part {
                    warn!(buffer, dim = part.dim, old = %existing.kind, new = %part.kind, "partition overrides an earlier one");
                }
                *existing = part
            }
            None => recorded.push(part),
        }
    }
    refresh_banks(module);
    debug!(module = %module.name, buffer, dim, factor, %kind, "partitioned");
    Ok(())
}

/// Bank-select expression of one partition for a logical index
pub fn bank_expr(part: &Partition, extent: usize, index: &Expr) -> Expr {
    match part.kind {
        PartitionKind::Complete => index.clone(),
        PartitionKind::Cyclic => index.clone() % part.factor as i64,
        PartitionKind::Block => index.clone() / (extent / part.factor.max(1)) as i64,
    }
}

/// Recompute bank selects on every access of the module
pub fn refresh_banks(module: &mut Module) {
    let layouts: BTreeMap<String, (Vec<Partition>, Vec<usize>)> = module
        .partitions
        .iter()
        .filter_map(|(buffer, parts)| {
            module
                .buffer_type(buffer)
                .map(|ty| (buffer.clone(), (parts.clone(), ty.shape)))
        })
        .collect();
    module.for_each_access_mut(&mut |access, _| {
        access.banks.clear();
        if let Some((parts, shape)) = layouts.get(&access.buffer) {
            for part in parts {
                if let (Some(index), Some(extent)) = (access.indices.get(part.dim - 1), shape.get(part.dim - 1)) {
                    access.banks.push(bank_expr(part, *extent, index));
                }
            }
        }
    });
}

/// Loop nest over `extents` with fresh variables `<name>.v<k>`; `make` gets
/// the variables and returns the innermost store
pub(crate) fn copy_nest(name: &str, extents: &[usize], make: impl FnOnce(&[Expr]) -> (Access, Expr)) -> Op {
    let vars: Vec<String> = (0..extents.len()).map(|k| format!("{}.v{}", name, k)).collect();
    let exprs: Vec<Expr> = vars.iter().map(|v| Expr::var(v.as_str())).collect();
    let (access, value) = make(&exprs);
    let mut op = Op::new(name, OpKind::Store { access, value });
    for (var, extent) in vars.iter().zip(extents).rev() {
        op = Op::new(
            var.clone(),
            OpKind::Loop(Loop {
                var: var.clone(),
                lower: 0,
                upper: *extent as i64,
                step: 1,
                kind: LoopKind::Spatial,
                pipeline: None,
                body: vec![op],
            }),
        );
    }
    op
}

pub(crate) fn alloc_op(buffer: &str, ty: TensorType) -> Op {
    Op::new(
        buffer,
        OpKind::Alloc {
            buffer: buffer.to_string(),
            ty,
            init: None,
            storage: Storage::Memory,
        },
    )
}

/// Every access must index each dimension of `buffer` exactly once
fn check_access_rank(primitive: &str, buffer: &str, rank: usize, accesses: &[AccessInfo]) -> CompileResult<()> {
    match accesses.iter().find(|a| a.indices.len() != rank) {
        Some(bad) => Err(CompileError::illegal(
            primitive,
            format!(
                "access to `{}` in `{}` has {} indices, expected {}",
                buffer,
                bad.op,
                bad.indices.len(),
                rank
            ),
        )),
        None => Ok(()),
    }
}

fn uses_outside_accesses(module: &Module, buffer: &str) -> bool {
    let mut found = false;
    module.walk(&mut |op| {
        if let OpKind::Call(call) = &op.kind {
            if call.args.iter().any(|a| a == buffer) {
                found = true;
            }
        }
    });
    found
}

/// Stage the part of `buffer` used by one iteration of `axis` in a local
/// buffer, filled at the start and flushed at the end of each iteration
pub fn buffer_at(module: &mut Module, buffer: &str, axis: &str) -> CompileResult<String> {
    let ty = module
        .buffer_type(buffer)
        .ok_or_else(|| CompileError::unknown_value(buffer))?;
    if ty.rank() == 0 {
        return Err(CompileError::illegal("buffer_at", format!("`{}` is a scalar", buffer)));
    }
    let path = module.resolve(axis)?;
    let l = module
        .op_at(&path)
        .and_then(Op::as_loop)
        .ok_or_else(|| CompileError::illegal("buffer_at", format!("`{}` is not a loop", axis)))?;
    if uses_outside_accesses(module, buffer) {
        return Err(CompileError::illegal(
            "buffer_at",
            format!("`{}` is passed to a call and cannot be staged", buffer),
        ));
    }
    let total = collect_accesses(&module.body).into_iter().filter(|a| a.buffer == buffer).count();
    let inside: Vec<_> = collect_accesses(&l.body).into_iter().filter(|a| a.buffer == buffer).collect();
    if inside.is_empty() || inside.len() != total {
        return Err(CompileError::illegal(
            "buffer_at",
            format!("axis `{}` does not dominate all uses of `{}`", axis, buffer),
        ));
    }

    check_access_rank("buffer_at", buffer, ty.rank(), &inside)?;

    let inner = loop_vars(&l.body);
    let fixed: Vec<Option<Expr>> = (0..ty.rank())
        .map(|d| {
            let first = &inside[0].indices[d];
            let same = inside.iter().all(|a| a.indices.get(d) == Some(first));
            let invariant = inner.iter().all(|v| !first.uses_var(v));
            (same && invariant).then(|| first.clone())
        })
        .collect();
    if fixed.iter().all(Option::is_none) {
        return Err(CompileError::illegal(
            "buffer_at",
            format!("no dimension of `{}` is fixed within one iteration of `{}`", buffer, axis),
        ));
    }
    let staged: Vec<usize> = (0..ty.rank()).filter(|d| fixed[*d].is_none()).collect();
    let written = inside.iter().any(|a| a.mode == AccessMode::Write);

    let name = module.fresh_buffer_name(&format!("{}_buf", buffer));
    let extents: Vec<usize> = staged.iter().map(|d| ty.shape[*d]).collect();
    let full_index = |vars: &[Expr]| -> Vec<Expr> {
        let mut staged_vars = vars.iter();
        fixed
            .iter()
            .map(|f| match f {
                Some(e) => e.clone(),
                None => staged_vars.next().cloned().unwrap_or(Expr::Int(0)),
            })
            .collect()
    };
    let fill = copy_nest(&format!("{}.fill", name), &extents, |vars| {
        (Access::new(name.clone(), vars.to_vec()), Expr::Load(Access::new(buffer, full_index(vars))))
    });
    let flush = copy_nest(&format!("{}.flush", name), &extents, |vars| {
        (Access::new(buffer, full_index(vars)), Expr::load(name.clone(), vars.to_vec()))
    });

    let axis_op = module
        .op_at_mut(&path)
        .ok_or_else(|| CompileError::unknown_op(axis))?;
    let Some(l) = axis_op.as_loop_mut() else {
        return Err(CompileError::unknown_op(axis));
    };
    for op in &mut l.body {
        op.for_each_access_mut(&mut |access, _| {
            if access.buffer == buffer {
                access.buffer = name.clone();
                access.indices = staged.iter().map(|d| access.indices[*d].clone()).collect();
                access.banks.clear();
            }
        });
    }
    let mut body = vec![alloc_op(&name, TensorType::new(ty.dtype, extents.clone())), fill];
    body.append(&mut l.body);
    if written {
        body.push(flush);
    }
    l.body = body;
    refresh_banks(module);
    debug!(module = %module.name, buffer, axis, staging = %name, "buffer_at");
    Ok(name)
}

/// Sliding window over `buffer` along `axis`: successive iterations read
/// `buffer[.., v + c, ..]` for a fixed set of offsets `c`; the window keeps the
/// `cmax - cmin + 1` most recent slices so each iteration loads one new slice
pub fn reuse_at(module: &mut Module, buffer: &str, axis: &str) -> CompileResult<String> {
    let ty = module
        .buffer_type(buffer)
        .ok_or_else(|| CompileError::unknown_value(buffer))?;
    let path = module.resolve(axis)?;
    let axis_op = module
        .op_at(&path)
        .ok_or_else(|| CompileError::unknown_op(axis))?;
    let axis_name = axis_op.name.clone();
    let l = axis_op
        .as_loop()
        .ok_or_else(|| CompileError::illegal("reuse_at", format!("`{}` is not a loop", axis)))?;
    if l.step != 1 {
        return Err(CompileError::illegal("reuse_at", format!("`{}` does not have unit stride", axis)));
    }
    let var = l.var.clone();
    let accesses: Vec<_> = collect_accesses(&l.body).into_iter().filter(|a| a.buffer == buffer).collect();
    if accesses.is_empty() {
        return Err(CompileError::illegal("reuse_at", format!("`{}` is not read inside `{}`", buffer, axis)));
    }
    if accesses.iter().any(|a| a.mode == AccessMode::Write) {
        return Err(CompileError::illegal("reuse_at", format!("`{}` is written inside `{}`", buffer, axis)));
    }
    check_access_rank("reuse_at", buffer, ty.rank(), &accesses)?;

    let mut reuse_dim = None;
    let mut offsets = Vec::new();
    for access in &accesses {
        let mut hit = None;
        for (d, index) in access.indices.iter().enumerate() {
            if !index.uses_var(&var) {
                continue;
            }
            let affine = Affine::from_expr(index).filter(|a| a.coeff(&var) == 1 && a.without(&var).is_constant());
            match (affine, hit) {
                (Some(a), None) => hit = Some((d, a.constant)),
                _ => {
                    return Err(CompileError::illegal(
                        "reuse_at",
                        format!("access {}[..] is not a shifted window along `{}`", buffer, var),
                    ))
                }
            }
        }
        let Some((d, offset)) = hit else {
            return Err(CompileError::illegal(
                "reuse_at",
                format!("an access to `{}` does not move with `{}`", buffer, var),
            ));
        };
        if reuse_dim.is_some_and(|prev| prev != d) {
            return Err(CompileError::illegal(
                "reuse_at",
                format!("accesses to `{}` slide along different dimensions", buffer),
            ));
        }
        reuse_dim = Some(d);
        offsets.push(offset);
    }
    let d = reuse_dim.unwrap_or(0);
    let (cmin, cmax) = (
        offsets.iter().copied().min().unwrap_or(0),
        offsets.iter().copied().max().unwrap_or(0),
    );
    let window = (cmax - cmin + 1) as usize;
    if window < 2 {
        return Err(CompileError::illegal(
            "reuse_at",
            format!("successive iterations of `{}` do not overlap on `{}`", axis, buffer),
        ));
    }
    let lower = l.lower;

    let name = module.fresh_buffer_name(&format!("{}_reuse_{}", buffer, var));
    let mut shape = ty.shape.clone();
    shape[d] = window;
    let others: Vec<usize> = (0..ty.rank()).filter(|k| *k != d).collect();
    let extents: Vec<usize> = others.iter().map(|k| ty.shape[*k]).collect();
    let place = |slot: Expr, vars: &[Expr]| -> Vec<Expr> {
        let mut rest = vars.iter();
        (0..ty.rank())
            .map(|k| if k == d { slot.clone() } else { rest.next().cloned().unwrap_or(Expr::Int(0)) })
            .collect()
    };

    let mut prologue = vec![alloc_op(&name, TensorType::new(ty.dtype, shape))];
    for t in 0..window - 1 {
        prologue.push(copy_nest(&format!("{}.init{}", name, t), &extents, |vars| {
            (
                Access::new(name.clone(), place(Expr::Int(t as i64 + 1), vars)),
                Expr::load(buffer, place(Expr::Int(lower + cmin + t as i64), vars)),
            )
        }));
    }
    let mut step_ops = Vec::new();
    for t in 0..window - 1 {
        step_ops.push(copy_nest(&format!("{}.shift{}", name, t), &extents, |vars| {
            (
                Access::new(name.clone(), place(Expr::Int(t as i64), vars)),
                Expr::load(name.clone(), place(Expr::Int(t as i64 + 1), vars)),
            )
        }));
    }
    step_ops.push(copy_nest(&format!("{}.load", name), &extents, |vars| {
        (
            Access::new(name.clone(), place(Expr::Int(window as i64 - 1), vars)),
            Expr::load(buffer, place(Expr::var(var.as_str()) + cmax, vars)),
        )
    }));

    let block_name = module.fresh_op_name(&format!("{}.window", name));
    let mut loop_op = module
        .op_at(&path)
        .cloned()
        .ok_or_else(|| CompileError::unknown_op(axis))?;
    if let Some(l) = loop_op.as_loop_mut() {
        for op in &mut l.body {
            op.for_each_access_mut(&mut |access, _| {
                if access.buffer == buffer {
                    if let Some(offset) = Affine::from_expr(&access.indices[d]).map(|a| a.constant) {
                        access.buffer = name.clone();
                        access.indices[d] = Expr::Int(offset - cmin);
                        access.banks.clear();
                    }
                }
            });
        }
        step_ops.append(&mut l.body);
        l.body = step_ops;
    }
    trace!(axis = %axis_name, window, dim = d + 1, "reuse window");
    let mut ops = prologue;
    ops.push(loop_op);
    if let Some(slot) = module.op_at_mut(&path) {
        *slot = Op::new(
            block_name,
            OpKind::Block(Block {
                ops,
                ..Block::default()
            }),
        );
    }
    refresh_banks(module);
    debug!(module = %module.name, buffer, axis, reuse = %name, window, "reuse_at");
    Ok(name)
}
