//! Schedules: one module, its transformation log and a tracker handle
//!
//! Every primitive is a variant of the closed [`Primitive`] enum. Applying one
//! works on a copy of the module and commits only on success, so a failed
//! primitive leaves both the IR and the log untouched.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CompilerConfig;
use crate::dataflow::Granularity;
use crate::equivalence::SharedTracker;
use crate::error::CompileResult;
use crate::ir::{Module, PartitionKind};
use crate::{memory, primitives};

/// Rewrite primitives with their fixed parameter lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "primitive", rename_all = "snake_case")]
pub enum Primitive {
    Reorder { outer: String, inner: String },
    Split { target: String, factor: i64 },
    Pipeline { target: String, ii: u32 },
    Partition { buffer: String, dim: usize, factor: usize, kind: PartitionKind },
    BufferAt { buffer: String, axis: String },
    ReuseAt { buffer: String, axis: String },
}

impl Primitive {
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Reorder { .. } => "reorder",
            Primitive::Split { .. } => "split",
            Primitive::Pipeline { .. } => "pipeline",
            Primitive::Partition { .. } => "partition",
            Primitive::BufferAt { .. } => "buffer_at",
            Primitive::ReuseAt { .. } => "reuse_at",
        }
    }

    /// The op or buffer this primitive acts on
    pub fn target(&self) -> &str {
        match self {
            Primitive::Reorder { outer, .. } => outer,
            Primitive::Split { target, .. } | Primitive::Pipeline { target, .. } => target,
            Primitive::Partition { buffer, .. }
            | Primitive::BufferAt { buffer, .. }
            | Primitive::ReuseAt { buffer, .. } => buffer,
        }
    }

    /// The same primitive with op and buffer references renamed
    pub fn retarget(&self, op: &dyn Fn(&str) -> String, buffer: &dyn Fn(&str) -> String) -> Primitive {
        match self {
            Primitive::Reorder { outer, inner } => Primitive::Reorder {
                outer: op(outer),
                inner: op(inner),
            },
            Primitive::Split { target, factor } => Primitive::Split {
                target: op(target),
                factor: *factor,
            },
            Primitive::Pipeline { target, ii } => Primitive::Pipeline {
                target: op(target),
                ii: *ii,
            },
            Primitive::Partition { buffer: b, dim, factor, kind } => Primitive::Partition {
                buffer: buffer(b),
                dim: *dim,
                factor: *factor,
                kind: *kind,
            },
            Primitive::BufferAt { buffer: b, axis } => Primitive::BufferAt {
                buffer: buffer(b),
                axis: op(axis),
            },
            Primitive::ReuseAt { buffer: b, axis } => Primitive::ReuseAt {
                buffer: buffer(b),
                axis: op(axis),
            },
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::Reorder { outer, inner } => write!(f, "reorder({}, {})", outer, inner),
            Primitive::Split { target, factor } => write!(f, "split({}, factor={})", target, factor),
            Primitive::Pipeline { target, ii } => write!(f, "pipeline({}, ii={})", target, ii),
            Primitive::Partition { buffer, dim, factor, kind } => {
                write!(f, "partition({}, dim={}, factor={}, kind={})", buffer, dim, factor, kind)
            }
            Primitive::BufferAt { buffer, axis } => write!(f, "buffer_at({}, axis={})", buffer, axis),
            Primitive::ReuseAt { buffer, axis } => write!(f, "reuse_at({}, axis={})", buffer, axis),
        }
    }
}

/// One entry of a schedule's transformation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum LogEntry {
    /// `site` is the dotted call-site path the entry was inherited through,
    /// `None` when applied to this schedule directly
    Primitive { primitive: Primitive, site: Option<String> },
    Compose { child: String, site: String },
    Dataflow { granularity: Granularity },
}

impl LogEntry {
    pub fn primitive(&self) -> Option<&Primitive> {
        match self {
            LogEntry::Primitive { primitive, .. } => Some(primitive),
            _ => None,
        }
    }

    /// The entry as seen from a parent that inlined this schedule at `site`
    pub fn inherited(&self, site: &str, op: &dyn Fn(&str) -> String, buffer: &dyn Fn(&str) -> String) -> LogEntry {
        let nest = |inner: &str| format!("{}.{}", site, inner);
        match self {
            LogEntry::Primitive { primitive, site: inner } => LogEntry::Primitive {
                primitive: primitive.retarget(op, buffer),
                site: Some(inner.as_deref().map(nest).unwrap_or_else(|| site.to_string())),
            },
            LogEntry::Compose { child, site: inner } => LogEntry::Compose {
                child: child.clone(),
                site: nest(inner),
            },
            LogEntry::Dataflow { granularity } => LogEntry::Dataflow {
                granularity: *granularity,
            },
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntry::Primitive { primitive, site: None } => write!(f, "{}", primitive),
            LogEntry::Primitive { primitive, site: Some(site) } => write!(f, "{} [via {}]", primitive, site),
            LogEntry::Compose { child, site } => write!(f, "compose({}) at {}", child, site),
            LogEntry::Dataflow { granularity } => write!(f, "dataflow({})", granularity),
        }
    }
}

/// The function (and instantiation) a schedule was customized from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub base: String,
    #[serde(default)]
    pub inst_args: Vec<i64>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Transformation state of one function
#[derive(Debug, Clone)]
pub struct Schedule {
    pub(crate) module: Module,
    pub(crate) origin: Origin,
    pub(crate) log: Vec<LogEntry>,
    pub(crate) tracker: SharedTracker,
    pub(crate) config: CompilerConfig,
}

#[derive(Serialize)]
struct ScheduleView<'a> {
    origin: &'a Origin,
    module: &'a Module,
    log: &'a [LogEntry],
}

impl Schedule {
    pub fn new(module: Module, origin: Origin, tracker: SharedTracker, config: CompilerConfig) -> Self {
        Self {
            module,
            origin,
            log: Vec::new(),
            tracker,
            config,
        }
    }

    /// Read-only view of the current IR
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.module.name
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn tracker(&self) -> SharedTracker {
        SharedTracker::clone(&self.tracker)
    }

    /// Apply one primitive atomically. Returns the buffer it created, if any.
    pub fn apply(&mut self, primitive: Primitive) -> CompileResult<Option<String>> {
        let mut module = self.module.clone();
        let created = match &primitive {
            Primitive::Reorder { outer, inner } => {
                primitives::reorder(&mut module, outer, inner)?;
                None
            }
            Primitive::Split { target, factor } => {
                primitives::split(&mut module, target, *factor)?;
                None
            }
            Primitive::Pipeline { target, ii } => {
                primitives::pipeline(&mut module, target, *ii)?;
                None
            }
            Primitive::Partition { buffer, dim, factor, kind } => {
                memory::partition(&mut module, buffer, *dim, *factor, *kind)?;
                None
            }
            Primitive::BufferAt { buffer, axis } => Some(memory::buffer_at(&mut module, buffer, axis)?),
            Primitive::ReuseAt { buffer, axis } => Some(memory::reuse_at(&mut module, buffer, axis)?),
        };
        debug!(schedule = %self.module.name, %primitive, "applied primitive");
        self.module = module;
        self.log.push(LogEntry::Primitive { primitive, site: None });
        Ok(created)
    }

    pub fn reorder(&mut self, outer: &str, inner: &str) -> CompileResult<()> {
        self.apply(Primitive::Reorder {
            outer: outer.to_string(),
            inner: inner.to_string(),
        })
        .map(|_| ())
    }

    pub fn split(&mut self, target: &str, factor: i64) -> CompileResult<()> {
        self.apply(Primitive::Split {
            target: target.to_string(),
            factor,
        })
        .map(|_| ())
    }

    /// Pipeline at the configured default initiation interval
    pub fn pipeline(&mut self, target: &str) -> CompileResult<()> {
        let ii = self.config.pipeline_ii;
        self.pipeline_ii(target, ii)
    }

    pub fn pipeline_ii(&mut self, target: &str, ii: u32) -> CompileResult<()> {
        self.apply(Primitive::Pipeline {
            target: target.to_string(),
            ii,
        })
        .map(|_| ())
    }

    pub fn partition(&mut self, buffer: &str, dim: usize, factor: usize, kind: PartitionKind) -> CompileResult<()> {
        self.apply(Primitive::Partition {
            buffer: buffer.to_string(),
            dim,
            factor,
            kind,
        })
        .map(|_| ())
    }

    /// Returns the staging buffer's name
    pub fn buffer_at(&mut self, buffer: &str, axis: &str) -> CompileResult<String> {
        let created = self.apply(Primitive::BufferAt {
            buffer: buffer.to_string(),
            axis: axis.to_string(),
        })?;
        Ok(created.unwrap_or_default())
    }

    /// Returns the reuse buffer's name, usable as the target of a later `reuse_at`
    pub fn reuse_at(&mut self, buffer: &str, axis: &str) -> CompileResult<String> {
        let created = self.apply(Primitive::ReuseAt {
            buffer: buffer.to_string(),
            axis: axis.to_string(),
        })?;
        Ok(created.unwrap_or_default())
    }

    /// Equivalence class of a qualified `function:value` name
    pub fn equivalent_values(&self, value: &str) -> BTreeSet<String> {
        self.tracker.borrow().class_of(value)
    }

    /// Primitives recorded in the log, inherited ones included
    pub fn primitives(&self) -> impl Iterator<Item = &Primitive> {
        self.log.iter().filter_map(LogEntry::primitive)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&ScheduleView {
            origin: &self.origin,
            module: &self.module,
            log: &self.log,
        })
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.module)?;
        for (i, entry) in self.log.iter().enumerate() {
            writeln!(f, "  [{}] {}", i, entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{for_loop, store, FunctionBuilder};
    use crate::equivalence::EquivalenceTracker;
    use crate::ir::{DType, Expr, TensorType};

    fn schedule() -> Schedule {
        let module = FunctionBuilder::new("kernel")
            .param("A", TensorType::new(DType::I32, [32]))
            .op(for_loop("i", 0, 32, vec![store("A", vec![Expr::var("i")], Expr::var("i"))]))
            .build();
        let origin = Origin {
            base: "kernel".into(),
            inst_args: vec![],
            tag: None,
        };
        Schedule::new(module, origin, EquivalenceTracker::shared(), CompilerConfig::default())
    }

    #[test]
    fn test_failed_primitive_leaves_schedule_untouched() {
        let mut s = schedule();
        let before = s.module().clone();
        assert!(s.split("i", 0).is_err());
        assert!(s.partition("A", 2, 2, PartitionKind::Block).is_err());
        assert!(s.pipeline("nope").is_err());
        assert_eq!(s.module(), &before);
        assert!(s.log().is_empty());
    }

    #[test]
    fn test_dependent_primitives() {
        let mut s = schedule();
        s.split("i", 2).unwrap();
        s.pipeline("i.inner").unwrap();
        let names: Vec<&str> = s.primitives().map(Primitive::name).collect();
        assert_eq!(names, vec!["split", "pipeline"]);
        let inner = s.module().op("i.inner").unwrap().as_loop().unwrap();
        assert_eq!(inner.pipeline, Some(1));
    }

    #[test]
    fn test_inherited_entry() {
        let entry = LogEntry::Primitive {
            primitive: Primitive::Pipeline {
                target: "j".into(),
                ii: 1,
            },
            site: Some("add".into()),
        };
        let inherited = entry.inherited("top_site", &|n| format!("top_site.{}", n), &|b| b.to_string());
        assert_eq!(
            inherited,
            LogEntry::Primitive {
                primitive: Primitive::Pipeline {
                    target: "top_site.j".into(),
                    ii: 1
                },
                site: Some("top_site.add".into()),
            }
        );
    }
}
