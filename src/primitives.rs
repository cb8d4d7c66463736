//! Loop primitives: reorder, split and pipeline
//!
//! Each function mutates the module it is handed; callers pass a scratch copy
//! and discard it when an `IllegalTransformation` comes back.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::analysis::{accumulation, carried_dependences, loop_vars, reorder_violation};
use crate::error::{CompileError, CompileResult};
use crate::ir::{
    list_at_mut, Access, Block, Expr, Loop, Module, Op, OpKind, Storage, TensorType,
};
use crate::memory::refresh_banks;

fn loop_at<'a>(module: &'a Module, path: &[usize], primitive: &str, name: &str) -> CompileResult<&'a Loop> {
    module
        .op_at(path)
        .and_then(Op::as_loop)
        .ok_or_else(|| CompileError::illegal(primitive, format!("`{}` is not a loop", name)))
}

/// Exchange the nesting positions of two loops of one perfect nest
pub fn reorder(module: &mut Module, first: &str, second: &str) -> CompileResult<()> {
    let (pa, pb) = (module.resolve(first)?, module.resolve(second)?);
    loop_at(module, &pa, "reorder", first)?;
    loop_at(module, &pb, "reorder", second)?;
    if pa == pb {
        return Err(CompileError::illegal("reorder", format!("`{}` and `{}` are the same loop", first, second)));
    }
    let (outer, inner) = if pb.starts_with(&pa) {
        (pa, pb)
    } else if pa.starts_with(&pb) {
        (pb, pa)
    } else {
        return Err(CompileError::illegal(
            "reorder",
            format!("`{}` and `{}` are not in the same loop nest", first, second),
        ));
    };

    let mut chain = Vec::new();
    for depth in outer.len()..=inner.len() {
        let l = loop_at(module, &inner[..depth], "reorder", first)?;
        chain.push(l.var.clone());
        if depth < inner.len() && (l.body.len() != 1 || inner[depth] != 0) {
            return Err(CompileError::illegal(
                "reorder",
                format!("`{}` and `{}` are not perfectly nested", first, second),
            ));
        }
    }
    let inner_body = &loop_at(module, &inner, "reorder", second)?.body;
    if let Some(buffer) = reorder_violation(&chain, inner_body, 0, chain.len() - 1) {
        return Err(CompileError::illegal(
            "reorder",
            format!("exchanging `{}` and `{}` reverses a dependence on `{}`", first, second, buffer),
        ));
    }

    let outer_header = module.op_at(&outer).and_then(Op::loop_header);
    let inner_header = module.op_at(&inner).and_then(Op::loop_header);
    if let (Some(oh), Some(ih)) = (outer_header, inner_header) {
        if let Some(op) = module.op_at_mut(&outer) {
            op.set_loop_header(ih);
        }
        if let Some(op) = module.op_at_mut(&inner) {
            op.set_loop_header(oh);
        }
    }
    debug!(module = %module.name, first, second, "reordered");
    Ok(())
}

fn rename_suffix(ops: &mut [Op], suffix: &str) {
    for op in ops {
        op.walk_mut(&mut |op| op.name = format!("{}.{}", op.name, suffix));
    }
}

/// Split a loop into `<loop>.outer` / `<loop>.inner`. A factor that does not
/// divide the trip count leaves a remainder loop `<loop>.tail` after the pair.
pub fn split(module: &mut Module, target: &str, factor: i64) -> CompileResult<()> {
    let path = module.resolve(target)?;
    let op = module
        .op_at(&path)
        .ok_or_else(|| CompileError::unknown_op(target))?;
    let name = op.name.clone();
    let l = op
        .as_loop()
        .ok_or_else(|| CompileError::illegal("split", format!("`{}` is not a loop", target)))?
        .clone();
    if l.step != 1 {
        return Err(CompileError::illegal("split", format!("`{}` does not have unit stride", name)));
    }
    let trips = l.trip_count();
    if factor < 1 || factor > trips {
        return Err(CompileError::illegal(
            "split",
            format!("factor {} is outside 1..={} for `{}`", factor, trips, name),
        ));
    }

    let outer_var = format!("{}.outer", l.var);
    let inner_var = format!("{}.inner", l.var);
    let index = Expr::var(outer_var.as_str()) * factor + Expr::var(inner_var.as_str()) + l.lower;
    let mut body = l.body.clone();
    for op in &mut body {
        op.for_each_expr_mut(&mut |e| e.substitute(&l.var, &index));
    }
    let inner = Op::new(
        format!("{}.inner", name),
        OpKind::Loop(Loop {
            var: inner_var,
            lower: 0,
            upper: factor,
            step: 1,
            kind: l.kind,
            pipeline: l.pipeline,
            body,
        }),
    );
    let main_trips = trips / factor;
    let outer = Op::new(
        format!("{}.outer", name),
        OpKind::Loop(Loop {
            var: outer_var,
            lower: 0,
            upper: main_trips,
            step: 1,
            kind: l.kind,
            pipeline: None,
            body: vec![inner],
        }),
    );

    let replacement = if trips % factor == 0 {
        outer
    } else {
        let mut tail_body = l.body.clone();
        rename_suffix(&mut tail_body, "tail");
        let tail = Op::new(
            format!("{}.tail", name),
            OpKind::Loop(Loop {
                lower: l.lower + main_trips * factor,
                body: tail_body,
                ..l.clone()
            }),
        );
        Op::new(
            module.fresh_op_name(&format!("{}.split", name)),
            OpKind::Block(Block {
                ops: vec![outer, tail],
                ..Block::default()
            }),
        )
    };
    if let Some(slot) = module.op_at_mut(&path) {
        *slot = replacement;
    }
    debug!(module = %module.name, loop_name = %name, factor, remainder = trips % factor, "split");
    Ok(())
}

/// Mark a loop for overlapped execution at initiation interval `ii`.
/// Reduction loops whose only carried dependences are accumulations into a
/// fixed location get that update serialized through a scalar register.
pub fn pipeline(module: &mut Module, target: &str, ii: u32) -> CompileResult<()> {
    if ii == 0 {
        return Err(CompileError::illegal("pipeline", "initiation interval must be at least 1"));
    }
    let path = module.resolve(target)?;
    let op = module
        .op_at(&path)
        .ok_or_else(|| CompileError::unknown_op(target))?;
    let name = op.name.clone();
    let l = op
        .as_loop()
        .ok_or_else(|| CompileError::illegal("pipeline", format!("`{}` is not a loop", target)))?;
    if l.pipeline.is_some() {
        set_pipeline(module, &path, ii);
        return Ok(());
    }

    let deps = carried_dependences(l);
    if deps.is_empty() {
        set_pipeline(module, &path, ii);
        debug!(module = %module.name, loop_name = %name, ii, "pipelined");
        return Ok(());
    }
    if !l.is_reduction() {
        let dep = &deps[0];
        return Err(CompileError::illegal(
            "pipeline",
            format!(
                "loop `{}` carries a dependence on `{}` between `{}` and `{}`",
                name, dep.buffer, dep.writer, dep.other
            ),
        ));
    }

    let updates = accumulations(l);
    if let Some(dep) = deps.iter().find(|d| !updates.contains_key(&d.buffer)) {
        return Err(CompileError::illegal(
            "pipeline",
            format!("reduction `{}` carries a non-accumulating dependence on `{}`", name, dep.buffer),
        ));
    }
    serialize_reduction(module, &path, &name, updates, ii)
}

fn set_pipeline(module: &mut Module, path: &[usize], ii: u32) {
    if let Some(l) = module.op_at_mut(path).and_then(Op::as_loop_mut) {
        l.pipeline = Some(ii);
    }
}

/// Accumulated location per buffer, when every access to that buffer in the
/// loop is the same loop-invariant element
fn accumulations(l: &Loop) -> BTreeMap<String, Access> {
    let mut inner = loop_vars(&l.body);
    inner.insert(l.var.clone());
    let mut found: BTreeMap<String, Access> = BTreeMap::new();
    for op in &l.body {
        op.walk(&mut |op| {
            if let Some(access) = accumulation(op) {
                let invariant = access.indices.iter().all(|i| inner.iter().all(|v| !i.uses_var(v)));
                if invariant {
                    found.entry(access.buffer.clone()).or_insert_with(|| access.clone());
                }
            }
        });
    }
    found.retain(|buffer, location| {
        let mut uniform = true;
        for op in &l.body {
            op.for_each_access(&mut |a, _| {
                if &a.buffer == buffer && a.indices != location.indices {
                    uniform = false;
                }
            });
        }
        uniform
    });
    found
}

fn serialize_reduction(
    module: &mut Module,
    path: &[usize],
    name: &str,
    updates: BTreeMap<String, Access>,
    ii: u32,
) -> CompileResult<()> {
    let mut prologue = Vec::new();
    let mut epilogue = Vec::new();
    let mut registers = BTreeMap::new();
    for (buffer, location) in &updates {
        let ty = module
            .buffer_type(buffer)
            .ok_or_else(|| CompileError::unknown_value(buffer))?;
        let register = module.fresh_buffer_name(&format!("{}_acc", buffer));
        trace!(%buffer, %register, "serializing accumulation");
        prologue.push(Op::new(
            register.clone(),
            OpKind::Alloc {
                buffer: register.clone(),
                ty: TensorType::scalar(ty.dtype),
                init: None,
                storage: Storage::Memory,
            },
        ));
        prologue.push(Op::new(
            format!("{}.init", register),
            OpKind::Store {
                access: Access::new(register.clone(), Vec::new()),
                value: Expr::Load(Access::new(buffer.clone(), location.indices.clone())),
            },
        ));
        epilogue.push(Op::new(
            format!("{}.flush", register),
            OpKind::Store {
                access: Access::new(buffer.clone(), location.indices.clone()),
                value: Expr::load(register.clone(), Vec::new()),
            },
        ));
        registers.insert(buffer.clone(), (register, location.indices.clone()));
    }

    let block_name = module.fresh_op_name(&format!("{}.serial", name));
    let (last, prefix) = path
        .split_last()
        .ok_or_else(|| CompileError::unknown_op(name))?;
    let list = list_at_mut(&mut module.body, prefix).ok_or_else(|| CompileError::unknown_op(name))?;
    let mut loop_op = list.remove(*last);
    loop_op.for_each_access_mut(&mut |access, _| {
        if let Some((register, indices)) = registers.get(&access.buffer) {
            if &access.indices == indices {
                access.buffer = register.clone();
                access.indices.clear();
                access.banks.clear();
            }
        }
    });
    if let Some(l) = loop_op.as_loop_mut() {
        l.pipeline = Some(ii);
    }
    let mut ops = prologue;
    ops.push(loop_op);
    ops.extend(epilogue);
    list.insert(
        *last,
        Op::new(
            block_name,
            OpKind::Block(Block {
                ops,
                ..Block::default()
            }),
        ),
    );
    refresh_banks(module);
    debug!(module = %module.name, loop_name = %name, ii, registers = updates.len(), "pipelined reduction");
    Ok(())
}
