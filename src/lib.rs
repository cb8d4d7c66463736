//! Accelerator schedule composition
//!
//! This library customizes the loop nests of accelerator kernels with
//! schedule primitives, composes independently scheduled functions into
//! their callers and restructures the result into dataflow regions before
//! emitting HLS C++.
//!
//! # Example
//!
//! ```rust
//! use accel_schedule::builder::{grid, store, FunctionBuilder};
//! use accel_schedule::{emit, DType, Expr, Program, Session, TensorType};
//!
//! let ty = TensorType::new(DType::I32, [8]);
//! let add = FunctionBuilder::new("add")
//!     .param("A", ty.clone())
//!     .returns(ty.clone())
//!     .alloc("B", ty)
//!     .op(grid(&[("i", 8)], vec![
//!         store("B", vec![Expr::var("i")], Expr::load("A", vec![Expr::var("i")]) + 1),
//!     ]))
//!     .ret("B")
//!     .build();
//!
//! let mut session = Session::new(Program::new().with(add));
//! let mut s = session.customize("add").unwrap();
//! s.split("i", 4).unwrap();
//! s.pipeline("i.inner").unwrap();
//! let hls = emit(&s, &session.library()).unwrap();
//! assert_eq!(hls.pragma_count("pipeline"), 1);
//! ```

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod driver;
pub mod error;
pub mod ir;
pub mod builder;
pub mod analysis;
pub mod equivalence;
pub mod config;
pub mod session;
pub mod schedule;
pub mod primitives;
pub mod memory;
pub mod compose;
pub mod dataflow;
pub mod interp;
pub mod hls;

pub use config::CompilerConfig;
pub use dataflow::{optimize, resume, Checkpoint, Granularity};
pub use driver::ScriptRunner;
pub use error::{CompileError, CompileResult};
pub use hls::{emit, HlsProgram};
pub use interp::{Execution, Interpreter, Tensor};
pub use ir::{DType, Expr, Module, Op, OpKind, PartitionKind, Storage, TensorType};
pub use parser::{parse_script, Parser};
pub use schedule::{LogEntry, Primitive, Schedule};
pub use session::{Program, Session};

/// Run a schedule script against a fresh session over `program`
///
/// Returns the HLS output of every `emit(..)` statement in the script.
pub fn run_script(program: Program, config: CompilerConfig, source: &str) -> CompileResult<Vec<HlsProgram>> {
    config.validate()?;
    let mut session = Session::with_config(program, config);
    let mut runner = ScriptRunner::new(&mut session);
    runner.run_source(source)?;
    Ok(runner.emitted().to_vec())
}
