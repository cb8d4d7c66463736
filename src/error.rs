//! Error types for the schedule compiler

use thiserror::Error;

/// Result type for scheduling operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Scheduling, composition and dataflow errors
///
/// Every error is local to the operation that raised it: a failing primitive,
/// composition or pass run leaves the schedule it was applied to untouched.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Lexer error at position {position}: {message}")]
    LexerError { position: usize, message: String },

    #[error("Parser error: {message}")]
    ParseError { message: String },

    #[error("Illegal transformation `{primitive}`: {message}")]
    IllegalTransformation { primitive: String, message: String },

    #[error("Ambiguous call site for `{callee}`: candidates are {}", .candidates.join(", "))]
    AmbiguousCallSite { callee: String, candidates: Vec<String> },

    #[error("Unknown call site for `{callee}`{}", .id.as_ref().map(|id| format!(" with id `{}`", id)).unwrap_or_default())]
    UnknownCallSite { callee: String, id: Option<String> },

    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Cyclic dependency between stages: {}", .stages.join(" -> "))]
    CyclicDependency { stages: Vec<String> },

    #[error("Unresolved call to `{callee}` at `{site}`; compose it before running the dataflow pass")]
    UnresolvedCall { callee: String, site: String },

    #[error("Dataflow region `{region}` is not streamable: {message}")]
    DataflowViolation { region: String, message: String },

    #[error("Unknown operation: {name}")]
    UnknownOperation { name: String },

    #[error("Unknown value: {name}")]
    UnknownValue { name: String },

    #[error("Unknown function: {name}")]
    UnknownFunction { name: String },

    #[error("Evaluation error: {message}")]
    Evaluation { message: String },

    #[error("Script error: {message}")]
    Script { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CompileError {
    pub fn parse_error(msg: impl Into<String>) -> Self {
        CompileError::ParseError { message: msg.into() }
    }

    pub fn illegal(primitive: impl Into<String>, msg: impl Into<String>) -> Self {
        CompileError::IllegalTransformation {
            primitive: primitive.into(),
            message: msg.into(),
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        CompileError::TypeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub fn unknown_op(name: impl Into<String>) -> Self {
        CompileError::UnknownOperation { name: name.into() }
    }

    pub fn unknown_value(name: impl Into<String>) -> Self {
        CompileError::UnknownValue { name: name.into() }
    }

    pub fn unknown_function(name: impl Into<String>) -> Self {
        CompileError::UnknownFunction { name: name.into() }
    }

    pub fn eval(msg: impl Into<String>) -> Self {
        CompileError::Evaluation { message: msg.into() }
    }

    pub fn script(msg: impl Into<String>) -> Self {
        CompileError::Script { message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CompileError::Config { message: msg.into() }
    }
}
