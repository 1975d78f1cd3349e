//! Runtime values for the interpreter.

use std::fmt;
use std::rc::Rc;

use crate::ast::Stmt;
use crate::builtins::Builtin;

/// A user-defined function (`def`) captured at execution time.
#[derive(Debug, Clone, PartialEq)]
pub struct UserFn {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

/// The two importable modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Math,
    Numpy,
}

impl Module {
    pub fn name(&self) -> &'static str {
        match self {
            Module::Math => "math",
            Module::Numpy => "numpy",
        }
    }
}

/// Runtime value.
///
/// Numbers stay split between `Int` and `Float` so that integer arithmetic
/// and container indexing behave the way model authors expect.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    /// Insertion-ordered association list; keys are compared by value.
    Dict(Vec<(Value, Value)>),
    /// Lazy integer range, never materialized.
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    Module(Module),
    Builtin(Builtin),
    Function(Rc<UserFn>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::Module(_) => "module",
            Value::Builtin(_) => "builtin function",
            Value::Function(_) => "function",
        }
    }

    /// Numeric view, if this value is a number (bools count, as in Python).
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Integer view. Integral floats count: scenario values arrive as JSON
    /// numbers, so an `int`-kind variable reaches the interpreter as a
    /// float with zero fraction.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Some(*v as i64),
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => !items.is_empty(),
            Value::Dict(pairs) => !pairs.is_empty(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            Value::Module(_) | Value::Builtin(_) | Value::Function(_) => true,
        }
    }

    /// Length of a container, if this value has one.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(s.chars().count()),
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => Some(items.len()),
            Value::Dict(pairs) => Some(pairs.len()),
            Value::Range { start, stop, step } => Some(range_len(*start, *stop, *step)),
            _ => None,
        }
    }
}

pub(crate) fn range_len(start: i64, stop: i64, step: i64) -> usize {
    if step > 0 && stop > start {
        ((stop - start + step - 1) / step) as usize
    } else if step < 0 && stop < start {
        ((start - stop - step - 1) / -step) as usize
    } else {
        0
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => write_seq(f, "[", items, "]"),
            Value::Tuple(items) => write_seq(f, "(", items, ")"),
            Value::Set(items) => write_seq(f, "{", items, "}"),
            Value::Dict(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Range { start, stop, step } => write!(f, "range({start}, {stop}, {step})"),
            Value::Module(m) => write!(f, "<module '{}'>", m.name()),
            Value::Builtin(b) => write!(f, "<function '{}'>", b.name()),
            Value::Function(u) => write!(f, "<function '{}'>", u.name),
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, open: &str, items: &[Value], close: &str) -> fmt::Result {
    write!(f, "{open}")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    write!(f, "{close}")
}
