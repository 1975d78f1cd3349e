//! Security validation.
//!
//! Both function forms are validated before anything executes. The
//! expression form accepts a closed node and call set; the code form walks
//! the full tree rejecting forbidden imports, underscore attributes and
//! dangerous call targets, and statically requires an assignment to
//! `resultado` at module scope.

use crate::ast::{BoolOpKind, Comprehension, Expr, Stmt, Target, UnOp};
use crate::builtins;
use crate::error::LangError;
use crate::RESULT_NAME;

/// Names that may never be referenced in a code block. Everything on this
/// list reaches process state, the filesystem or the interpreter itself.
const BANNED_NAMES: &[&str] = &[
    "open",
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "vars",
    "dir",
    "getattr",
    "setattr",
    "delattr",
    "input",
    "exit",
    "quit",
    "breakpoint",
];

/// Modules a code block may import.
const ALLOWED_MODULES: &[&str] = &["math", "numpy", "np"];

// =============================================================================
// Expression form
// =============================================================================

/// Validate the closed construct set of the single-line expression form.
pub fn validate_expression(expr: &Expr) -> Result<(), LangError> {
    walk_expression(expr, 1)
}

fn walk_expression(expr: &Expr, line: u32) -> Result<(), LangError> {
    match expr {
        Expr::Int(_) | Expr::Float(_) => Ok(()),
        Expr::Name(_) => Ok(()),
        Expr::Binary { left, right, .. } => {
            walk_expression(left, line)?;
            walk_expression(right, line)
        }
        Expr::Unary { op, operand } => match op {
            UnOp::Pos | UnOp::Neg => walk_expression(operand, line),
            UnOp::Not => Err(LangError::security(
                line,
                "operator 'not' is not allowed in expressions",
            )),
        },
        Expr::Compare { first, rest } => {
            walk_expression(first, line)?;
            for (_, operand) in rest {
                walk_expression(operand, line)?;
            }
            Ok(())
        }
        Expr::Ternary { cond, then, orelse } => {
            walk_expression(cond, line)?;
            walk_expression(then, line)?;
            walk_expression(orelse, line)
        }
        Expr::Call { func, args, line } => {
            let name = match func.as_ref() {
                Expr::Name(name) => name,
                _ => {
                    return Err(LangError::security(
                        *line,
                        "only direct calls to the allowed function set are permitted",
                    ))
                }
            };
            if !builtins::is_expression_function(name) {
                return Err(LangError::security(
                    *line,
                    format!("function '{name}' is not allowed in expressions"),
                ));
            }
            for arg in args {
                walk_expression(arg, *line)?;
            }
            Ok(())
        }
        Expr::BoolOp { op, .. } => {
            let symbol = match op {
                BoolOpKind::And => "and",
                BoolOpKind::Or => "or",
            };
            Err(LangError::security(
                line,
                format!("operator '{symbol}' is not allowed in expressions"),
            ))
        }
        other => Err(LangError::security(
            line,
            format!("construct not allowed in expressions: {}", describe(other)),
        )),
    }
}

fn describe(expr: &Expr) -> &'static str {
    match expr {
        Expr::Str(_) => "string literal",
        Expr::Bool(_) => "boolean literal",
        Expr::NoneLit => "None",
        Expr::Attribute { .. } => "attribute access",
        Expr::Subscript { .. } => "subscript",
        Expr::List(_) => "list literal",
        Expr::Tuple(_) => "tuple literal",
        Expr::Set(_) => "set literal",
        Expr::Dict(_) => "dict literal",
        Expr::ListComp { .. } | Expr::SetComp { .. } | Expr::DictComp { .. } => "comprehension",
        _ => "expression",
    }
}

// =============================================================================
// Code form
// =============================================================================

/// Validate a code block: security walk plus the `resultado` requirement.
pub fn validate_code(stmts: &[Stmt]) -> Result<(), LangError> {
    for stmt in stmts {
        walk_stmt(stmt)?;
    }
    if !assigns_result(stmts) {
        return Err(LangError::validation(
            stmts.first().map(|s| s.line()).unwrap_or(1),
            format!("the code block must assign the variable '{RESULT_NAME}'"),
        ));
    }
    Ok(())
}

fn walk_stmt(stmt: &Stmt) -> Result<(), LangError> {
    match stmt {
        Stmt::Assign { target, value, line } => {
            walk_target(target, *line)?;
            walk_code_expr(value, *line)
        }
        Stmt::AugAssign { target, value, line, .. } => {
            walk_target(target, *line)?;
            walk_code_expr(value, *line)
        }
        Stmt::ExprStmt { expr, line } => walk_code_expr(expr, *line),
        Stmt::If { branches, orelse, line } => {
            for (cond, body) in branches {
                walk_code_expr(cond, *line)?;
                for s in body {
                    walk_stmt(s)?;
                }
            }
            for s in orelse {
                walk_stmt(s)?;
            }
            Ok(())
        }
        Stmt::For { target, iter, body, line } => {
            walk_target(target, *line)?;
            walk_code_expr(iter, *line)?;
            for s in body {
                walk_stmt(s)?;
            }
            Ok(())
        }
        Stmt::While { cond, body, line } => {
            walk_code_expr(cond, *line)?;
            for s in body {
                walk_stmt(s)?;
            }
            Ok(())
        }
        Stmt::Def { body, .. } => {
            for s in body {
                walk_stmt(s)?;
            }
            Ok(())
        }
        Stmt::Return { value, line } => match value {
            Some(expr) => walk_code_expr(expr, *line),
            None => Ok(()),
        },
        Stmt::Break { .. } | Stmt::Continue { .. } => Ok(()),
        Stmt::Import { module, line, .. } => {
            if ALLOWED_MODULES.contains(&module.as_str()) {
                Ok(())
            } else {
                Err(LangError::security(
                    *line,
                    format!("import of module '{module}' is not allowed"),
                ))
            }
        }
    }
}

fn walk_target(target: &Target, line: u32) -> Result<(), LangError> {
    match target {
        Target::Name(_) => Ok(()),
        Target::Tuple(items) => {
            for item in items {
                walk_target(item, line)?;
            }
            Ok(())
        }
        Target::Subscript { object, index } => {
            walk_code_expr(object, line)?;
            walk_code_expr(index, line)
        }
    }
}

fn walk_code_expr(expr: &Expr, line: u32) -> Result<(), LangError> {
    match expr {
        Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Bool(_) | Expr::NoneLit => Ok(()),
        Expr::Name(name) => {
            if BANNED_NAMES.contains(&name.as_str()) {
                Err(LangError::security(
                    line,
                    format!("use of '{name}' is not allowed"),
                ))
            } else {
                Ok(())
            }
        }
        Expr::Binary { left, right, .. } | Expr::BoolOp { left, right, .. } => {
            walk_code_expr(left, line)?;
            walk_code_expr(right, line)
        }
        Expr::Unary { operand, .. } => walk_code_expr(operand, line),
        Expr::Compare { first, rest } => {
            walk_code_expr(first, line)?;
            for (_, operand) in rest {
                walk_code_expr(operand, line)?;
            }
            Ok(())
        }
        Expr::Ternary { cond, then, orelse } => {
            walk_code_expr(cond, line)?;
            walk_code_expr(then, line)?;
            walk_code_expr(orelse, line)
        }
        Expr::Call { func, args, line } => {
            walk_code_expr(func, *line)?;
            for arg in args {
                walk_code_expr(arg, *line)?;
            }
            Ok(())
        }
        Expr::Attribute { object, name, line } => {
            if name.starts_with('_') {
                return Err(LangError::security(
                    *line,
                    format!("access to attribute '{name}' is not allowed"),
                ));
            }
            walk_code_expr(object, *line)
        }
        Expr::Subscript { object, index } => {
            walk_code_expr(object, line)?;
            walk_code_expr(index, line)
        }
        Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => {
            for item in items {
                walk_code_expr(item, line)?;
            }
            Ok(())
        }
        Expr::Dict(pairs) => {
            for (key, value) in pairs {
                walk_code_expr(key, line)?;
                walk_code_expr(value, line)?;
            }
            Ok(())
        }
        Expr::ListComp { element, comp } | Expr::SetComp { element, comp } => {
            walk_code_expr(element, line)?;
            walk_comprehension(comp, line)
        }
        Expr::DictComp { key, value, comp } => {
            walk_code_expr(key, line)?;
            walk_code_expr(value, line)?;
            walk_comprehension(comp, line)
        }
    }
}

fn walk_comprehension(comp: &Comprehension, line: u32) -> Result<(), LangError> {
    walk_target(&comp.target, line)?;
    walk_code_expr(&comp.iter, line)?;
    for cond in &comp.conds {
        walk_code_expr(cond, line)?;
    }
    Ok(())
}

/// Static check: `resultado` is assigned somewhere in module scope.
/// Bodies of `if`/`for`/`while` are module scope; `def` bodies are not.
fn assigns_result(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|stmt| match stmt {
        Stmt::Assign { target, .. } => target.names().contains(&RESULT_NAME),
        Stmt::AugAssign { target, .. } => target.names().contains(&RESULT_NAME),
        Stmt::If { branches, orelse, .. } => {
            branches.iter().any(|(_, body)| assigns_result(body)) || assigns_result(orelse)
        }
        Stmt::For { body, .. } | Stmt::While { body, .. } => assigns_result(body),
        _ => false,
    })
}
