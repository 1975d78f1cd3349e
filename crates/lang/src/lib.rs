//! Restricted function language for Monte Carlo models.
//!
//! A model carries one function in one of two forms: a single-line arithmetic
//! expression, or a small imperative code block that must assign the
//! distinguished variable `resultado`. Both forms are compiled (parsed and
//! security-validated) once per worker, then evaluated many times against
//! per-scenario variable bindings under a wall-clock timeout.
//!
//! The pipeline is lexer → parser → validator → interpreter. Nothing is ever
//! executed before validation accepts the full syntax tree.

pub mod ast;
mod builtins;
pub mod error;
mod eval;
mod interp;
mod lexer;
mod parser;
mod stream;
mod token;
mod validate;
mod value;

pub use builtins::Builtin;
pub use error::{LangError, Result};
pub use eval::{compile_code, compile_expression, CompiledFunction, FunctionKind, SafeEvaluator};
pub use value::{Module, UserFn, Value};

/// Name of the variable a code block must assign.
pub const RESULT_NAME: &str = "resultado";

/// Default per-evaluation wall-clock timeout in seconds.
pub const DEFAULT_EVAL_TIMEOUT_SECS: u64 = 30;
