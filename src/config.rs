//! Compiler configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};
use crate::ir::PartitionKind;

/// Knobs shared by a session and every schedule it customizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Initiation interval used by `pipeline` when none is given
    pub pipeline_ii: u32,
    /// FIFO depth of streaming channels inserted by the dataflow pass
    pub stream_depth: usize,
    /// Partition kind used by schedule scripts when `kind=` is omitted
    pub default_partition_kind: PartitionKind,
    /// Recursion guard for the evaluator and call-graph walks
    pub max_call_depth: usize,
}

impl CompilerConfig {
    pub fn new(pipeline_ii: u32, stream_depth: usize) -> Self {
        Self {
            pipeline_ii,
            stream_depth,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> CompileResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| CompileError::config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> CompileResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CompileError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> CompileResult<()> {
        if self.pipeline_ii == 0 {
            return Err(CompileError::config("pipeline_ii must be at least 1"));
        }
        if self.stream_depth == 0 {
            return Err(CompileError::config("stream_depth must be at least 1"));
        }
        if self.max_call_depth == 0 {
            return Err(CompileError::config("max_call_depth must be at least 1"));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            pipeline_ii: 1,
            stream_depth: 2,
            default_partition_kind: PartitionKind::Complete,
            max_call_depth: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert_eq!(config.pipeline_ii, 1);
        assert_eq!(config.stream_depth, 2);
        assert_eq!(config.default_partition_kind, PartitionKind::Complete);
    }

    #[test]
    fn test_partial_json() {
        let config = CompilerConfig::from_json(r#"{"stream_depth": 8, "default_partition_kind": "cyclic"}"#).unwrap();
        assert_eq!(config.stream_depth, 8);
        assert_eq!(config.pipeline_ii, 1);
        assert_eq!(config.default_partition_kind, PartitionKind::Cyclic);
    }

    #[test]
    fn test_rejects_zero_depth() {
        assert!(CompilerConfig::from_json(r#"{"stream_depth": 0}"#).is_err());
    }
}
