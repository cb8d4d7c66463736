//! Composition: inline independently scheduled children at their call sites
//!
//! The child's transformed body is deep-copied into a [`Block`] that replaces
//! the selected `Call`. Formals become actuals, the returned value becomes
//! the call's result binding, every other child local and op is prefixed with
//! the site name, and the child's log is inherited entry by entry.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::equivalence::qualified;
use crate::error::{CompileError, CompileResult};
use crate::ir::{list_at_mut, Access, Block, Call, Expr, Module, Op, OpKind, Partition};
use crate::memory::{alloc_op, copy_nest, refresh_banks};
use crate::schedule::{LogEntry, Schedule};
use crate::session::retag_call_sites;

/// Changes staged by one `compose` call, committed together
struct Staged {
    module: Module,
    log: Vec<LogEntry>,
    relations: Vec<(String, String)>,
}

impl Schedule {
    /// Inline `child` at the matching call site; `id` selects among several
    /// candidates by call tag or op name
    pub fn compose(&mut self, child: &Schedule, id: Option<&str>) -> CompileResult<()> {
        self.compose_all([child], id)
    }

    /// Inline several children in order; all of them or none are applied
    pub fn compose_all<'a>(
        &mut self,
        children: impl IntoIterator<Item = &'a Schedule>,
        id: Option<&str>,
    ) -> CompileResult<()> {
        let mut staged = Staged {
            module: self.module.clone(),
            log: Vec::new(),
            relations: Vec::new(),
        };
        for child in children {
            inline_child(&mut staged, child, id)?;
        }
        self.module = staged.module;
        self.log.append(&mut staged.log);
        let mut tracker = self.tracker.borrow_mut();
        for (a, b) in &staged.relations {
            tracker.relate(a, b);
        }
        Ok(())
    }
}

fn site_matches(op: &Op, call: &Call, id: &str) -> bool {
    call.tag.as_deref() == Some(id) || op.name == id || op.name.ends_with(&format!(".{}", id))
}

/// Path of the call site `child` is composed at
fn select_site(module: &Module, child: &Schedule, id: Option<&str>) -> CompileResult<Vec<usize>> {
    let base = &child.origin.base;
    let candidates: Vec<(Vec<usize>, &Op)> = module
        .call_sites()
        .into_iter()
        .filter(|(_, op)| op.as_call().is_some_and(|c| &c.callee == base))
        .collect();
    let mut selected: Vec<&(Vec<usize>, &Op)> = match id {
        Some(id) => candidates
            .iter()
            .filter(|(_, op)| op.as_call().is_some_and(|c| site_matches(op, c, id)))
            .collect(),
        None => candidates.iter().collect(),
    };
    match selected.len() {
        1 => Ok(selected.remove(0).0.clone()),
        0 => Err(CompileError::UnknownCallSite {
            callee: base.clone(),
            id: id.map(str::to_string),
        }),
        _ => Err(CompileError::AmbiguousCallSite {
            callee: base.clone(),
            candidates: selected.iter().map(|(_, op)| op.name.clone()).collect(),
        }),
    }
}

fn check_signature(parent: &Module, call: &Call, child: &Schedule) -> CompileResult<()> {
    let callee = &child.module;
    if call.inst_args != child.origin.inst_args {
        return Err(CompileError::type_mismatch(
            format!("{}{:?}", child.origin.base, call.inst_args),
            format!("{}{:?}", child.origin.base, child.origin.inst_args),
        ));
    }
    if call.args.len() != callee.params.len() {
        return Err(CompileError::type_mismatch(
            format!("{} argument(s) for `{}`", callee.params.len(), callee.name),
            call.args.len().to_string(),
        ));
    }
    for (actual, formal) in call.args.iter().zip(&callee.params) {
        let ty = parent
            .buffer_type(actual)
            .ok_or_else(|| CompileError::unknown_value(actual))?;
        if ty != formal.ty {
            return Err(CompileError::type_mismatch(
                format!("{}: {}", formal.name, formal.ty),
                format!("{}: {}", actual, ty),
            ));
        }
    }
    match (&call.result, &callee.ret) {
        (Some(result), Some(ret)) if result.ty != *ret => Err(CompileError::type_mismatch(
            format!("{} returning {}", callee.name, ret),
            format!("{}: {}", result.name, result.ty),
        )),
        (Some(result), None) => Err(CompileError::type_mismatch(
            format!("{} returning a value", callee.name),
            format!("{}: {}", result.name, result.ty),
        )),
        _ => Ok(()),
    }
}

fn merge_partitions(
    parent: &mut Module,
    child: &Module,
    renames: &BTreeMap<String, String>,
) -> CompileResult<()> {
    for (buffer, parts) in &child.partitions {
        let target = renames.get(buffer).cloned().unwrap_or_else(|| buffer.clone());
        let recorded: &mut Vec<Partition> = parent.partitions.entry(target.clone()).or_default();
        for part in parts {
            match recorded.iter().find(|p| p.dim == part.dim) {
                Some(existing) if existing != part => {
                    return Err(CompileError::illegal(
                        "compose",
                        format!(
                            "`{}` dim {} is already partitioned {} factor {}, child wants {} factor {}",
                            target, part.dim, existing.kind, existing.factor, part.kind, part.factor
                        ),
                    ))
                }
                Some(_) => {}
                None => recorded.push(*part),
            }
        }
    }
    Ok(())
}

fn inline_child(staged: &mut Staged, child: &Schedule, id: Option<&str>) -> CompileResult<()> {
    let path = select_site(&staged.module, child, id)?;
    let site_op = staged
        .module
        .op_at(&path)
        .ok_or_else(|| CompileError::unknown_op(id.unwrap_or(&child.origin.base)))?;
    let site = site_op.name.clone();
    let call = site_op
        .as_call()
        .cloned()
        .ok_or_else(|| CompileError::unknown_op(&site))?;
    check_signature(&staged.module, &call, child)?;

    let callee = &child.module;
    let returned = callee.returned_value().map(str::to_string);
    let result = call.result.as_ref().map(|r| r.name.clone());

    let mut renames = BTreeMap::new();
    for (formal, actual) in callee.params.iter().zip(&call.args) {
        renames.insert(formal.name.clone(), actual.clone());
    }
    let locals: BTreeSet<String> = callee
        .buffer_names()
        .into_iter()
        .filter(|b| !callee.is_param(b))
        .collect();
    for local in &locals {
        let renamed = match (&returned, &result) {
            (Some(r), Some(result)) if r == local => result.clone(),
            _ => format!("{}.{}", site, local),
        };
        renames.insert(local.clone(), renamed);
    }

    // Deep copy: nothing in the inlined body is shared with the child.
    let mut body = callee.deep_copy_body();
    if let Some(tag) = &call.tag {
        retag_call_sites(&mut body, tag);
    }
    body.retain(|op| !matches!(op.kind, OpKind::Return { .. }));
    let mut hoisted = Vec::new();
    for op in &mut body {
        op.rename_buffers(&renames);
        op.prefix_names(&site);
    }
    if let Some(result) = &call.result {
        if let Some(pos) = body.iter().position(
            |op| matches!(&op.kind, OpKind::Alloc { buffer, .. } if *buffer == result.name),
        ) {
            hoisted.push(body.remove(pos));
        } else if let Some(param) = returned.as_deref().and_then(|r| renames.get(r).filter(|_| callee.is_param(r))) {
            hoisted.push(alloc_op(&result.name, result.ty.clone()));
            let source = param.clone();
            body.push(copy_nest(&format!("{}.ret", site), &result.ty.shape, |vars| {
                (
                    Access::new(result.name.clone(), vars.to_vec()),
                    Expr::load(source, vars.to_vec()),
                )
            }));
        }
    }

    let block = Op::new(
        site.clone(),
        OpKind::Block(Block {
            ops: body,
            dataflow: false,
            inlined_from: Some(callee.name.clone()),
        }),
    );
    let (last, prefix) = path
        .split_last()
        .ok_or_else(|| CompileError::unknown_op(&site))?;
    let list = list_at_mut(&mut staged.module.body, prefix).ok_or_else(|| CompileError::unknown_op(&site))?;
    let mut replacement = hoisted;
    replacement.push(block);
    list.splice(*last..=*last, replacement);

    merge_partitions(&mut staged.module, callee, &renames)?;
    refresh_banks(&mut staged.module);

    let op_name = |n: &str| format!("{}.{}", site, n);
    let buffer_name = |b: &str| renames.get(b).cloned().unwrap_or_else(|| b.to_string());
    for entry in &child.log {
        staged.log.push(entry.inherited(&site, &op_name, &buffer_name));
    }
    staged.log.push(LogEntry::Compose {
        child: callee.name.clone(),
        site: site.clone(),
    });

    let parent = staged.module.name.clone();
    for (formal, actual) in callee.params.iter().zip(&call.args) {
        staged
            .relations
            .push((qualified(&parent, actual), qualified(&callee.name, &formal.name)));
    }
    for local in &locals {
        if let Some(renamed) = renames.get(local) {
            staged
                .relations
                .push((qualified(&parent, renamed), qualified(&callee.name, local)));
        }
    }
    if let (Some(result), Some(returned)) = (&result, &returned) {
        staged
            .relations
            .push((qualified(&parent, result), qualified(&callee.name, returned)));
    }
    debug!(parent = %parent, child = %callee.name, site = %site, "composed");
    Ok(())
}
