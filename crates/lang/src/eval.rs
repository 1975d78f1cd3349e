//! Compilation and timeout-bounded evaluation.
//!
//! `compile_*` runs parse + validation once; the resulting
//! `CompiledFunction` is immutable and shared across evaluations. Every
//! `evaluate` call runs on a dedicated thread; the caller waits at most the
//! configured timeout, then flags cancellation and abandons the thread. The
//! interpreter polls the flag at loop and call boundaries, so a runaway
//! evaluation terminates shortly after abandonment rather than pinning a
//! core forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;

use crate::ast::{Expr, Stmt};
use crate::builtins;
use crate::error::{LangError, Result};
use crate::interp::{Env, Interpreter};
use crate::value::Value;
use crate::{parser, validate, DEFAULT_EVAL_TIMEOUT_SECS, RESULT_NAME};

/// Which function form was compiled.
#[derive(Debug, Clone)]
pub enum FunctionKind {
    Expression(Expr),
    Code(Vec<Stmt>),
}

/// A parsed and security-validated model function.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    kind: FunctionKind,
    source: String,
}

impl CompiledFunction {
    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_expression(&self) -> bool {
        matches!(self.kind, FunctionKind::Expression(_))
    }
}

/// Compile the single-line expression form.
pub fn compile_expression(source: &str) -> Result<CompiledFunction> {
    let expr = parser::parse_expression(source)?;
    validate::validate_expression(&expr)?;
    Ok(CompiledFunction {
        kind: FunctionKind::Expression(expr),
        source: source.to_string(),
    })
}

/// Compile the imperative code form.
pub fn compile_code(source: &str) -> Result<CompiledFunction> {
    let stmts = parser::parse_module(source)?;
    validate::validate_code(&stmts)?;
    Ok(CompiledFunction {
        kind: FunctionKind::Code(stmts),
        source: source.to_string(),
    })
}

/// Evaluates a compiled function against per-scenario variable bindings,
/// bounded by a wall-clock timeout.
#[derive(Clone)]
pub struct SafeEvaluator {
    function: Arc<CompiledFunction>,
    timeout: Duration,
}

impl SafeEvaluator {
    pub fn new(function: CompiledFunction, timeout: Duration) -> Self {
        Self {
            function: Arc::new(function),
            timeout,
        }
    }

    pub fn with_default_timeout(function: CompiledFunction) -> Self {
        Self::new(function, Duration::from_secs(DEFAULT_EVAL_TIMEOUT_SECS))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn function(&self) -> &CompiledFunction {
        &self.function
    }

    /// Evaluate with the given variable bindings, returning the scalar result.
    ///
    /// The caller never waits past the timeout. On expiry the evaluation
    /// thread is flagged for cancellation and abandoned.
    pub fn evaluate(&self, bindings: &IndexMap<String, f64>) -> Result<f64> {
        let function = Arc::clone(&self.function);
        let vars: Vec<(String, f64)> = bindings.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("azar-eval".to_string())
            .spawn(move || {
                let outcome = run(&function, &vars, &flag);
                let _ = tx.send(outcome);
            })
            .map_err(|e| LangError::eval(0, format!("failed to spawn evaluation thread: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                cancel.store(true, Ordering::Relaxed);
                Err(LangError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(LangError::eval(
                0,
                "evaluation thread terminated unexpectedly",
            )),
        }
    }
}

fn run(function: &CompiledFunction, vars: &[(String, f64)], cancel: &AtomicBool) -> Result<f64> {
    let mut interp = Interpreter::new(cancel);
    match &function.kind {
        FunctionKind::Expression(expr) => {
            let mut globals = builtins::expression_globals();
            globals.extend(
                vars.iter()
                    .map(|(name, v)| (name.clone(), Value::Float(*v))),
            );
            let mut env = Env::new(globals);
            let value = interp.eval(expr, &mut env, 1)?;
            to_result_number(&value)
        }
        FunctionKind::Code(stmts) => {
            let mut globals = builtins::code_globals();
            globals.extend(
                vars.iter()
                    .map(|(name, v)| (name.clone(), Value::Float(*v))),
            );
            let mut env = Env::new(globals);
            interp.exec_module(stmts, &mut env)?;
            match env.global(RESULT_NAME) {
                Some(value) => to_result_number(value),
                None => Err(LangError::ResultMissing(RESULT_NAME.to_string())),
            }
        }
    }
}

/// The published result must be a finite scalar. Booleans coerce the way
/// Python integers do.
fn to_result_number(value: &Value) -> Result<f64> {
    match value {
        Value::Int(v) => Ok(*v as f64),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Float(v) if v.is_finite() => Ok(*v),
        Value::Float(v) => Err(LangError::ResultType(format!("non-finite float {v}"))),
        other => Err(LangError::ResultType(other.type_name().to_string())),
    }
}
