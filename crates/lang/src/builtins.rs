//! The closed function sets available to model functions.
//!
//! Expression form: the fixed scalar-math set plus the named constants.
//! Code form: the same set extended with the curated numerical functions
//! (numpy naming included) pre-bound at top level, plus the two modules.
//! Unary numerical functions map elementwise over lists and tuples.

use crate::value::{Module, Value};

/// Identity of a built-in function. The same builtin may be exposed under
/// several names (`asin` and `arcsin` both map to `Asin`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Abs,
    Round,
    Min,
    Max,
    Sum,
    Len,
    Range,
    Enumerate,
    Zip,
    Sqrt,
    Pow,
    Exp,
    Log,
    Log10,
    Log2,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Ceil,
    Floor,
    Trunc,
    Degrees,
    Radians,
    Mean,
    Median,
    Std,
    Var,
    Power,
    Square,
    Sign,
    Clip,
}

/// Functions callable from the expression form (spec'd closed set).
const EXPRESSION_FUNCTIONS: &[(&str, Builtin)] = &[
    ("abs", Builtin::Abs),
    ("round", Builtin::Round),
    ("min", Builtin::Min),
    ("max", Builtin::Max),
    ("sum", Builtin::Sum),
    ("sqrt", Builtin::Sqrt),
    ("pow", Builtin::Pow),
    ("exp", Builtin::Exp),
    ("log", Builtin::Log),
    ("log10", Builtin::Log10),
    ("log2", Builtin::Log2),
    ("sin", Builtin::Sin),
    ("cos", Builtin::Cos),
    ("tan", Builtin::Tan),
    ("asin", Builtin::Asin),
    ("acos", Builtin::Acos),
    ("atan", Builtin::Atan),
    ("atan2", Builtin::Atan2),
    ("sinh", Builtin::Sinh),
    ("cosh", Builtin::Cosh),
    ("tanh", Builtin::Tanh),
    ("ceil", Builtin::Ceil),
    ("floor", Builtin::Floor),
    ("trunc", Builtin::Trunc),
    ("degrees", Builtin::Degrees),
    ("radians", Builtin::Radians),
];

/// Extra names pre-bound at top level in the code form (numpy-flavoured).
const CODE_EXTRA_FUNCTIONS: &[(&str, Builtin)] = &[
    ("len", Builtin::Len),
    ("range", Builtin::Range),
    ("enumerate", Builtin::Enumerate),
    ("zip", Builtin::Zip),
    ("mean", Builtin::Mean),
    ("median", Builtin::Median),
    ("std", Builtin::Std),
    ("var", Builtin::Var),
    ("power", Builtin::Power),
    ("square", Builtin::Square),
    ("sign", Builtin::Sign),
    ("clip", Builtin::Clip),
    ("arcsin", Builtin::Asin),
    ("arccos", Builtin::Acos),
    ("arctan", Builtin::Atan),
    ("arctan2", Builtin::Atan2),
];

/// Named constants visible to both forms.
const CONSTANTS: &[(&str, f64)] = &[
    ("pi", std::f64::consts::PI),
    ("e", std::f64::consts::E),
    ("tau", std::f64::consts::TAU),
    ("inf", f64::INFINITY),
    ("nan", f64::NAN),
];

pub fn is_expression_function(name: &str) -> bool {
    EXPRESSION_FUNCTIONS.iter().any(|(n, _)| *n == name)
}

/// Global bindings for the expression form.
pub fn expression_globals() -> Vec<(String, Value)> {
    let mut globals = Vec::new();
    for (name, builtin) in EXPRESSION_FUNCTIONS {
        globals.push((name.to_string(), Value::Builtin(*builtin)));
    }
    for (name, value) in CONSTANTS {
        globals.push((name.to_string(), Value::Float(*value)));
    }
    globals
}

/// Global bindings for the code form: modules, curated functions, constants.
pub fn code_globals() -> Vec<(String, Value)> {
    let mut globals = expression_globals();
    for (name, builtin) in CODE_EXTRA_FUNCTIONS {
        globals.push((name.to_string(), Value::Builtin(*builtin)));
    }
    globals.push(("math".to_string(), Value::Module(Module::Math)));
    globals.push(("np".to_string(), Value::Module(Module::Numpy)));
    globals.push(("numpy".to_string(), Value::Module(Module::Numpy)));
    globals
}

/// Resolve a module for an `import` statement.
pub fn import_module(name: &str) -> Option<Module> {
    match name {
        "math" => Some(Module::Math),
        "numpy" | "np" => Some(Module::Numpy),
        _ => None,
    }
}

/// Resolve an attribute on a module.
pub fn module_attr(module: Module, name: &str) -> Option<Value> {
    match module {
        Module::Math => match name {
            "pi" => Some(Value::Float(std::f64::consts::PI)),
            "e" => Some(Value::Float(std::f64::consts::E)),
            "tau" => Some(Value::Float(std::f64::consts::TAU)),
            "inf" => Some(Value::Float(f64::INFINITY)),
            "nan" => Some(Value::Float(f64::NAN)),
            _ => EXPRESSION_FUNCTIONS
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, b)| Value::Builtin(*b)),
        },
        Module::Numpy => match name {
            "pi" => Some(Value::Float(std::f64::consts::PI)),
            "e" => Some(Value::Float(std::f64::consts::E)),
            "abs" => Some(Value::Builtin(Builtin::Abs)),
            "round" => Some(Value::Builtin(Builtin::Round)),
            "min" => Some(Value::Builtin(Builtin::Min)),
            "max" => Some(Value::Builtin(Builtin::Max)),
            "sum" => Some(Value::Builtin(Builtin::Sum)),
            _ => CODE_EXTRA_FUNCTIONS
                .iter()
                .chain(EXPRESSION_FUNCTIONS)
                .find(|(n, _)| *n == name)
                .map(|(_, b)| Value::Builtin(*b)),
        },
    }
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Abs => "abs",
            Builtin::Round => "round",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Len => "len",
            Builtin::Range => "range",
            Builtin::Enumerate => "enumerate",
            Builtin::Zip => "zip",
            Builtin::Sqrt => "sqrt",
            Builtin::Pow => "pow",
            Builtin::Exp => "exp",
            Builtin::Log => "log",
            Builtin::Log10 => "log10",
            Builtin::Log2 => "log2",
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
            Builtin::Tan => "tan",
            Builtin::Asin => "asin",
            Builtin::Acos => "acos",
            Builtin::Atan => "atan",
            Builtin::Atan2 => "atan2",
            Builtin::Sinh => "sinh",
            Builtin::Cosh => "cosh",
            Builtin::Tanh => "tanh",
            Builtin::Ceil => "ceil",
            Builtin::Floor => "floor",
            Builtin::Trunc => "trunc",
            Builtin::Degrees => "degrees",
            Builtin::Radians => "radians",
            Builtin::Mean => "mean",
            Builtin::Median => "median",
            Builtin::Std => "std",
            Builtin::Var => "var",
            Builtin::Power => "power",
            Builtin::Square => "square",
            Builtin::Sign => "sign",
            Builtin::Clip => "clip",
        }
    }

    /// Apply the builtin. Errors are plain messages; the interpreter attaches
    /// the call site line.
    pub fn call(&self, args: &[Value]) -> Result<Value, String> {
        match self {
            Builtin::Abs => elementwise(self.name(), args, |x| Ok(x.abs())),
            Builtin::Sqrt => elementwise(self.name(), args, |x| {
                if x < 0.0 {
                    Err("math domain error: sqrt of negative number".to_string())
                } else {
                    Ok(x.sqrt())
                }
            }),
            Builtin::Exp => elementwise(self.name(), args, |x| Ok(x.exp())),
            Builtin::Log => match args {
                [_] => elementwise(self.name(), args, log_checked),
                [x, base] => {
                    let x = number(self.name(), x)?;
                    let base = number(self.name(), base)?;
                    Ok(Value::Float(log_checked(x)? / log_checked(base)?))
                }
                _ => Err(arity(self.name(), "1 or 2")),
            },
            Builtin::Log10 => elementwise(self.name(), args, |x| {
                log_checked(x).map(|_| x.log10())
            }),
            Builtin::Log2 => elementwise(self.name(), args, |x| log_checked(x).map(|_| x.log2())),
            Builtin::Sin => elementwise(self.name(), args, |x| Ok(x.sin())),
            Builtin::Cos => elementwise(self.name(), args, |x| Ok(x.cos())),
            Builtin::Tan => elementwise(self.name(), args, |x| Ok(x.tan())),
            Builtin::Asin => elementwise(self.name(), args, |x| {
                if !(-1.0..=1.0).contains(&x) {
                    Err("math domain error: asin argument out of range".to_string())
                } else {
                    Ok(x.asin())
                }
            }),
            Builtin::Acos => elementwise(self.name(), args, |x| {
                if !(-1.0..=1.0).contains(&x) {
                    Err("math domain error: acos argument out of range".to_string())
                } else {
                    Ok(x.acos())
                }
            }),
            Builtin::Atan => elementwise(self.name(), args, |x| Ok(x.atan())),
            Builtin::Sinh => elementwise(self.name(), args, |x| Ok(x.sinh())),
            Builtin::Cosh => elementwise(self.name(), args, |x| Ok(x.cosh())),
            Builtin::Tanh => elementwise(self.name(), args, |x| Ok(x.tanh())),
            Builtin::Degrees => elementwise(self.name(), args, |x| Ok(x.to_degrees())),
            Builtin::Radians => elementwise(self.name(), args, |x| Ok(x.to_radians())),
            Builtin::Square => elementwise(self.name(), args, |x| Ok(x * x)),
            Builtin::Sign => elementwise(self.name(), args, |x| {
                Ok(if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                })
            }),
            Builtin::Ceil => int_unary(self.name(), args, |x| x.ceil()),
            Builtin::Floor => int_unary(self.name(), args, |x| x.floor()),
            Builtin::Trunc => int_unary(self.name(), args, |x| x.trunc()),
            Builtin::Atan2 => {
                let [y, x] = two(self.name(), args)?;
                Ok(Value::Float(y.atan2(x)))
            }
            Builtin::Pow | Builtin::Power => {
                let [a, b] = two(self.name(), args)?;
                Ok(Value::Float(a.powf(b)))
            }
            Builtin::Round => match args {
                [x] => {
                    let x = number(self.name(), x)?;
                    Ok(Value::Int(x.round() as i64))
                }
                [x, digits] => {
                    let x = number(self.name(), x)?;
                    let digits = number(self.name(), digits)? as i32;
                    let factor = 10f64.powi(digits);
                    Ok(Value::Float((x * factor).round() / factor))
                }
                _ => Err(arity(self.name(), "1 or 2")),
            },
            Builtin::Min => reduce(self.name(), args, f64::min),
            Builtin::Max => reduce(self.name(), args, f64::max),
            Builtin::Sum => {
                let items = sequence(self.name(), args)?;
                let mut all_int = true;
                let mut total = 0.0;
                for item in &items {
                    match item {
                        Value::Int(v) => total += *v as f64,
                        Value::Float(v) => {
                            all_int = false;
                            total += v;
                        }
                        Value::Bool(b) => total += if *b { 1.0 } else { 0.0 },
                        other => return Err(type_err(self.name(), other)),
                    }
                }
                if all_int {
                    Ok(Value::Int(total as i64))
                } else {
                    Ok(Value::Float(total))
                }
            }
            Builtin::Mean => aggregate(self.name(), args, |xs| {
                Ok(xs.iter().sum::<f64>() / xs.len() as f64)
            }),
            Builtin::Median => aggregate(self.name(), args, |xs| {
                let mut sorted = xs.to_vec();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let n = sorted.len();
                Ok(if n % 2 == 1 {
                    sorted[n / 2]
                } else {
                    (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
                })
            }),
            Builtin::Std => aggregate(self.name(), args, |xs| Ok(population_var(xs).sqrt())),
            Builtin::Var => aggregate(self.name(), args, |xs| Ok(population_var(xs))),
            Builtin::Clip => {
                let [x, lo, hi] = three(self.name(), args)?;
                Ok(Value::Float(x.clamp(lo, hi)))
            }
            Builtin::Len => match args {
                [v] => v
                    .len()
                    .map(|n| Value::Int(n as i64))
                    .ok_or_else(|| type_err(self.name(), v)),
                _ => Err(arity(self.name(), "1")),
            },
            Builtin::Range => {
                let ints: Vec<i64> = args
                    .iter()
                    .map(|a| a.as_int().ok_or_else(|| type_err(self.name(), a)))
                    .collect::<Result<_, _>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => return Err(arity(self.name(), "1 to 3")),
                };
                if step == 0 {
                    return Err("range() step must not be zero".to_string());
                }
                Ok(Value::Range { start, stop, step })
            }
            Builtin::Enumerate => {
                let items = sequence(self.name(), args)?;
                Ok(Value::List(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| Value::Tuple(vec![Value::Int(i as i64), v]))
                        .collect(),
                ))
            }
            Builtin::Zip => {
                let mut columns = Vec::new();
                for arg in args {
                    columns.push(iterate(self.name(), arg)?);
                }
                let len = columns.iter().map(Vec::len).min().unwrap_or(0);
                Ok(Value::List(
                    (0..len)
                        .map(|i| Value::Tuple(columns.iter().map(|c| c[i].clone()).collect()))
                        .collect(),
                ))
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn arity(name: &str, expected: &str) -> String {
    format!("{name}() takes {expected} argument(s)")
}

fn type_err(name: &str, value: &Value) -> String {
    format!("{name}() does not accept {}", value.type_name())
}

fn number(name: &str, value: &Value) -> Result<f64, String> {
    value.as_number().ok_or_else(|| type_err(name, value))
}

fn two(name: &str, args: &[Value]) -> Result<[f64; 2], String> {
    match args {
        [a, b] => Ok([number(name, a)?, number(name, b)?]),
        _ => Err(arity(name, "2")),
    }
}

fn three(name: &str, args: &[Value]) -> Result<[f64; 3], String> {
    match args {
        [a, b, c] => Ok([number(name, a)?, number(name, b)?, number(name, c)?]),
        _ => Err(arity(name, "3")),
    }
}

fn log_checked(x: f64) -> Result<f64, String> {
    if x <= 0.0 {
        Err("math domain error: log of non-positive number".to_string())
    } else {
        Ok(x.ln())
    }
}

fn iterate(name: &str, value: &Value) -> Result<Vec<Value>, String> {
    match value {
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => Ok(items.clone()),
        Value::Range { start, stop, step } => {
            let mut out = Vec::new();
            let mut cur = *start;
            while (*step > 0 && cur < *stop) || (*step < 0 && cur > *stop) {
                out.push(Value::Int(cur));
                cur += step;
            }
            Ok(out)
        }
        Value::Dict(pairs) => Ok(pairs.iter().map(|(k, _)| k.clone()).collect()),
        other => Err(type_err(name, other)),
    }
}

/// One iterable argument, or the argument list itself.
fn sequence(name: &str, args: &[Value]) -> Result<Vec<Value>, String> {
    match args {
        [single] if single.len().is_some() || matches!(single, Value::Range { .. }) => {
            iterate(name, single)
        }
        [] => Err(arity(name, "at least 1")),
        _ => Ok(args.to_vec()),
    }
}

fn numbers(name: &str, args: &[Value]) -> Result<Vec<f64>, String> {
    sequence(name, args)?
        .iter()
        .map(|v| number(name, v))
        .collect()
}

fn reduce(name: &str, args: &[Value], f: impl Fn(f64, f64) -> f64) -> Result<Value, String> {
    let items = sequence(name, args)?;
    if items.is_empty() {
        return Err(format!("{name}() of an empty sequence"));
    }
    // Preserve int-ness when every operand is an integer.
    let all_int = items
        .iter()
        .all(|v| matches!(v, Value::Int(_) | Value::Bool(_)));
    let mut acc = number(name, &items[0])?;
    for item in &items[1..] {
        acc = f(acc, number(name, item)?);
    }
    if all_int {
        Ok(Value::Int(acc as i64))
    } else {
        Ok(Value::Float(acc))
    }
}

fn aggregate(
    name: &str,
    args: &[Value],
    f: impl Fn(&[f64]) -> Result<f64, String>,
) -> Result<Value, String> {
    let xs = numbers(name, args)?;
    if xs.is_empty() {
        return Err(format!("{name}() of an empty sequence"));
    }
    f(&xs).map(Value::Float)
}

fn population_var(xs: &[f64]) -> f64 {
    let mean = xs.iter().sum::<f64>() / xs.len() as f64;
    xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / xs.len() as f64
}

/// Apply a scalar function elementwise: scalars map to scalars, lists and
/// tuples map to lists (numpy broadcast convention).
fn elementwise(
    name: &str,
    args: &[Value],
    f: impl Fn(f64) -> Result<f64, String> + Copy,
) -> Result<Value, String> {
    match args {
        [Value::List(items)] | [Value::Tuple(items)] => {
            let mapped = items
                .iter()
                .map(|v| number(name, v).and_then(f).map(Value::Float))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::List(mapped))
        }
        // abs() keeps integers integral; the other elementwise builtins
        // always return float.
        [Value::Int(v)] if name == "abs" => Ok(Value::Int(v.abs())),
        [v] => f(number(name, v)?).map(Value::Float),
        _ => Err(arity(name, "1")),
    }
}

fn int_unary(name: &str, args: &[Value], f: impl Fn(f64) -> f64) -> Result<Value, String> {
    match args {
        [v] => Ok(Value::Int(f(number(name, v)?) as i64)),
        _ => Err(arity(name, "1")),
    }
}
