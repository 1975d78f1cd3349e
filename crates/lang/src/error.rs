//! Language errors.
//!
//! Every failure mode of compiling or evaluating a model function maps onto
//! one variant here. The consumer worker routes scenarios by `kind_name`:
//! only `EvaluationError` is retried, everything else dead-letters.

use std::time::Duration;

use thiserror::Error;

/// Language result type
pub type Result<T> = std::result::Result<T, LangError>;

/// Errors produced while compiling or evaluating a model function.
#[derive(Debug, Clone, Error)]
pub enum LangError {
    #[error("syntax error at line {line}: {message}")]
    Parse { line: u32, message: String },

    #[error("invalid function at line {line}: {message}")]
    Validation { line: u32, message: String },

    #[error("security violation at line {line}: {message}")]
    Security { line: u32, message: String },

    #[error("evaluation failed at line {line}: {message}")]
    Eval { line: u32, message: String },

    #[error("evaluation exceeded the {}s timeout", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("variable '{0}' was not assigned by the code block")]
    ResultMissing(String),

    #[error("result is not a finite number: {0}")]
    ResultType(String),
}

impl LangError {
    pub(crate) fn parse(line: u32, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn validation(line: u32, message: impl Into<String>) -> Self {
        Self::Validation {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn security(line: u32, message: impl Into<String>) -> Self {
        Self::Security {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn eval(line: u32, message: impl Into<String>) -> Self {
        Self::Eval {
            line,
            message: message.into(),
        }
    }

    /// Stable error-kind label, used for per-worker `errors_by_kind` counters.
    pub fn kind_name(&self) -> &'static str {
        match self {
            LangError::Parse { .. } => "ParseError",
            LangError::Validation { .. } => "ValidationError",
            LangError::Security { .. } => "SecurityError",
            LangError::Eval { .. } => "EvaluationError",
            LangError::Timeout(_) => "TimeoutError",
            LangError::ResultMissing(_) => "ResultMissingError",
            LangError::ResultType(_) => "ResultTypeError",
        }
    }

    /// Whether a worker may retry the scenario after this failure.
    ///
    /// Timeouts, security refusals and malformed results are deterministic:
    /// redelivery would fail the same way.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LangError::Eval { .. })
    }
}
