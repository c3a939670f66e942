//! pyaot - ahead-of-time compiler for a statically typeable Python subset
//!
//! Source is parsed, type-inferred into a typed AST, rendered as C, Fortran
//! or Python, built into a shared library and loaded back through a small
//! calling convention.

pub mod build;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod index_vec;
pub mod lexer;
pub mod parser;
pub mod semantic;
pub mod wrapper;

// Re-export commonly used types
pub use codegen::Language;
pub use config::{Accelerators, CompileRequest, StopPoint};
pub use diagnostics::{Diagnostic, DiagnosticLevel, ErrorMode, SourceLocation};
pub use driver::{Compilation, Driver, PipelineState};
pub use error::{BuildError, CompileError, ConfigError, WrapError};
pub use wrapper::{Module, NdArray, Scalar, Value};
