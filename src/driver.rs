//! Schedule-script driver
//!
//! Runs parsed scripts against a [`Session`]. Script variables name either
//! schedules (`s = customize(gemm)`) or buffers created by a primitive
//! (`rb = s.reuse_at(A, axis=y)`); buffer handles can be passed wherever a
//! buffer name is expected.

use std::collections::BTreeMap;

use tracing::debug;

use crate::ast::{Invocation, Script, Statement, Value};
use crate::dataflow::{self, Checkpoint, Granularity};
use crate::error::{CompileError, CompileResult};
use crate::hls::{self, HlsProgram};
use crate::ir::PartitionKind;
use crate::parser::parse_script;
use crate::schedule::Schedule;
use crate::session::Session;

/// Keyword argument `name`, else the positional argument at `index`
fn arg<'c>(call: &'c Invocation, index: usize, name: &str) -> Option<&'c Value> {
    call.keyword(name).or_else(|| call.positional().nth(index))
}

fn required<'c>(call: &'c Invocation, index: usize, name: &str) -> CompileResult<&'c Value> {
    arg(call, index, name).ok_or_else(|| {
        CompileError::script(format!("`{}` is missing argument `{}`", call.method, name))
    })
}

fn int_arg(call: &Invocation, index: usize, name: &str) -> CompileResult<Option<i64>> {
    match arg(call, index, name) {
        None => Ok(None),
        Some(value) => value.as_int().map(Some).ok_or_else(|| {
            CompileError::script(format!("`{}` expects an integer for `{}`, got {}", call.method, name, value))
        }),
    }
}

fn name_arg(call: &Invocation, index: usize, name: &str) -> CompileResult<String> {
    let value = required(call, index, name)?;
    value.as_name().ok_or_else(|| {
        CompileError::script(format!("`{}` expects a name for `{}`, got {}", call.method, name, value))
    })
}

fn unsigned(call: &Invocation, name: &str, value: i64) -> CompileResult<usize> {
    usize::try_from(value)
        .map_err(|_| CompileError::script(format!("`{}` expects a non-negative `{}`, got {}", call.method, name, value)))
}

/// Executes schedule scripts
pub struct ScriptRunner<'s> {
    session: &'s mut Session,
    schedules: BTreeMap<String, Schedule>,
    buffers: BTreeMap<String, String>,
    emitted: Vec<HlsProgram>,
}

impl<'s> ScriptRunner<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        Self {
            session,
            schedules: BTreeMap::new(),
            buffers: BTreeMap::new(),
            emitted: Vec::new(),
        }
    }

    pub fn run_source(&mut self, source: &str) -> CompileResult<()> {
        let script = parse_script(source)?;
        self.run(&script)
    }

    pub fn run(&mut self, script: &Script) -> CompileResult<()> {
        for statement in &script.statements {
            self.execute(statement)?;
        }
        Ok(())
    }

    /// Schedules bound to script variables
    pub fn schedules(&self) -> &BTreeMap<String, Schedule> {
        &self.schedules
    }

    pub fn schedule(&self, name: &str) -> Option<&Schedule> {
        self.schedules.get(name)
    }

    /// Output of every `emit(..)` statement, in order
    pub fn emitted(&self) -> &[HlsProgram] {
        &self.emitted
    }

    pub fn session(&self) -> &Session {
        &*self.session
    }

    fn buffer(&self, name: String) -> String {
        self.buffers.get(&name).cloned().unwrap_or(name)
    }

    fn lookup(&self, name: &str) -> CompileResult<&Schedule> {
        self.schedules
            .get(name)
            .ok_or_else(|| CompileError::script(format!("`{}` is not a schedule", name)))
    }

    fn execute(&mut self, statement: &Statement) -> CompileResult<()> {
        let call = &statement.call;
        debug!(method = %call.method, receiver = ?call.receiver, "script statement");
        match &call.receiver {
            None => self.execute_function(statement.target.as_deref(), call),
            Some(receiver) => {
                let mut schedule = self
                    .schedules
                    .remove(receiver)
                    .ok_or_else(|| CompileError::script(format!("`{}` is not a schedule", receiver)))?;
                let outcome = self.execute_method(&mut schedule, call);
                self.schedules.insert(receiver.clone(), schedule);
                if let (Some(created), Some(target)) = (outcome?, &statement.target) {
                    self.buffers.insert(target.clone(), created);
                }
                Ok(())
            }
        }
    }

    fn execute_function(&mut self, target: Option<&str>, call: &Invocation) -> CompileResult<()> {
        match call.method.as_str() {
            "customize" => {
                let target = target.ok_or_else(|| CompileError::script("`customize` result must be assigned"))?;
                let function = name_arg(call, 0, "function")?;
                let args = match arg(call, 1, "args") {
                    None => Vec::new(),
                    Some(Value::List(items)) => items
                        .iter()
                        .map(|v| v.as_int().ok_or_else(|| CompileError::script(format!("instantiation argument {} is not an integer", v))))
                        .collect::<CompileResult<Vec<_>>>()?,
                    Some(Value::Int(v)) => vec![*v],
                    Some(other) => {
                        return Err(CompileError::script(format!("instantiation arguments must be a list, got {}", other)))
                    }
                };
                let tag = arg(call, 2, "tag").and_then(Value::as_name);
                let schedule = self.session.customize_instance(&function, &args, tag.as_deref())?;
                self.schedules.insert(target.to_string(), schedule);
                Ok(())
            }
            "optimize" | "resume" => {
                let source = name_arg(call, 0, "schedule")?;
                let kind: Granularity = match arg(call, 1, "kind") {
                    Some(value) => value
                        .as_name()
                        .ok_or_else(|| CompileError::script(format!("invalid dataflow kind {}", value)))?
                        .parse()?,
                    None => Granularity::Graph,
                };
                let checkpoint = |key: &str| -> CompileResult<Option<Checkpoint>> {
                    arg(call, 2, key)
                        .and_then(Value::as_name)
                        .map(|name| name.parse::<Checkpoint>())
                        .transpose()
                };
                let optimized = {
                    let schedule = self.lookup(&source)?;
                    if call.method == "optimize" {
                        dataflow::optimize(schedule, kind, checkpoint("debug_point")?)?
                    } else {
                        let after = checkpoint("after")?
                            .ok_or_else(|| CompileError::script("`resume` needs `after=<checkpoint>`"))?;
                        dataflow::resume(schedule, kind, after)?
                    }
                };
                let target = target.unwrap_or(&source).to_string();
                self.schedules.insert(target, optimized);
                Ok(())
            }
            "emit" => {
                let source = name_arg(call, 0, "schedule")?;
                let library = self.session.library();
                let program = hls::emit(self.lookup(&source)?, &library)?;
                self.emitted.push(program);
                Ok(())
            }
            other => Err(CompileError::script(format!("unknown function `{}`", other))),
        }
    }

    /// Apply one method; returns the buffer it created, if any
    fn execute_method(&self, schedule: &mut Schedule, call: &Invocation) -> CompileResult<Option<String>> {
        match call.method.as_str() {
            "reorder" => {
                schedule.reorder(&name_arg(call, 0, "outer")?, &name_arg(call, 1, "inner")?)?;
                Ok(None)
            }
            "split" => {
                let factor = int_arg(call, 1, "factor")?
                    .ok_or_else(|| CompileError::script("`split` is missing argument `factor`"))?;
                schedule.split(&name_arg(call, 0, "target")?, factor)?;
                Ok(None)
            }
            "pipeline" => {
                let target = name_arg(call, 0, "target")?;
                match int_arg(call, 1, "ii")? {
                    Some(ii) => {
                        let ii = u32::try_from(ii)
                            .map_err(|_| CompileError::script(format!("invalid initiation interval {}", ii)))?;
                        schedule.pipeline_ii(&target, ii)?
                    }
                    None => schedule.pipeline(&target)?,
                }
                Ok(None)
            }
            "partition" => {
                let buffer = self.buffer(name_arg(call, 0, "buffer")?);
                let dim = unsigned(call, "dim", int_arg(call, 1, "dim")?.unwrap_or(0))?;
                let factor = unsigned(call, "factor", int_arg(call, 2, "factor")?.unwrap_or(0))?;
                let kind: PartitionKind = match arg(call, 3, "kind") {
                    Some(value) => value
                        .as_name()
                        .ok_or_else(|| CompileError::script(format!("invalid partition kind {}", value)))?
                        .parse()?,
                    None => schedule.config().default_partition_kind,
                };
                schedule.partition(&buffer, dim, factor, kind)?;
                Ok(None)
            }
            "buffer_at" => {
                let buffer = self.buffer(name_arg(call, 0, "buffer")?);
                Ok(Some(schedule.buffer_at(&buffer, &name_arg(call, 1, "axis")?)?))
            }
            "reuse_at" => {
                let buffer = self.buffer(name_arg(call, 0, "buffer")?);
                Ok(Some(schedule.reuse_at(&buffer, &name_arg(call, 1, "axis")?)?))
            }
            "compose" => {
                let children = match required(call, 0, "child")? {
                    Value::List(items) => items.clone(),
                    single => vec![single.clone()],
                };
                let children = children
                    .iter()
                    .map(|child| {
                        let name = child
                            .as_name()
                            .ok_or_else(|| CompileError::script(format!("invalid child schedule {}", child)))?;
                        self.lookup(&name)
                    })
                    .collect::<CompileResult<Vec<&Schedule>>>()?;
                let id = arg(call, 1, "id").and_then(Value::as_name);
                schedule.compose_all(children, id.as_deref())?;
                Ok(None)
            }
            other => Err(CompileError::script(format!("unknown schedule method `{}`", other))),
        }
    }
}
