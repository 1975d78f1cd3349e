//! Tree-walking interpreter.
//!
//! Executes validated syntax trees only. Scoping is Python-like: one module
//! scope plus one local frame per user-function call; name lookup checks the
//! local frame, then module scope. Loops and calls poll a cancellation flag
//! so an abandoned evaluation thread terminates shortly after its timeout.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ast::{BinOp, BoolOpKind, CmpOp, Comprehension, Expr, Stmt, Target, UnOp};
use crate::builtins;
use crate::error::LangError;
use crate::value::{UserFn, Value};

const MAX_CALL_DEPTH: usize = 200;

/// Scope chain: module globals plus at most one active local frame.
pub struct Env {
    globals: HashMap<String, Value>,
    frames: Vec<HashMap<String, Value>>,
}

impl Env {
    pub fn new(globals: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            globals: globals.into_iter().collect(),
            frames: Vec::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        if let Some(frame) = self.frames.last() {
            if let Some(v) = frame.get(name) {
                return Some(v);
            }
        }
        self.globals.get(name)
    }

    fn assign(&mut self, name: &str, value: Value) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut Value> {
        if let Some(frame) = self.frames.last_mut() {
            if frame.contains_key(name) {
                return frame.get_mut(name);
            }
        }
        self.globals.get_mut(name)
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }
}

/// Control flow signal threaded through statement execution.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub struct Interpreter<'a> {
    cancel: &'a AtomicBool,
    depth: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(cancel: &'a AtomicBool) -> Self {
        Self { cancel, depth: 0 }
    }

    fn check_cancelled(&self, line: u32) -> Result<(), LangError> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(LangError::eval(line, "evaluation cancelled"))
        } else {
            Ok(())
        }
    }

    /// Execute a module body to completion.
    pub fn exec_module(&mut self, stmts: &[Stmt], env: &mut Env) -> Result<(), LangError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                Flow::Return(_) => break,
                Flow::Break | Flow::Continue => {
                    return Err(LangError::eval(
                        stmt.line(),
                        "'break' or 'continue' outside a loop",
                    ))
                }
            }
        }
        Ok(())
    }

    fn exec_block(&mut self, stmts: &[Stmt], env: &mut Env) -> Result<Flow, LangError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &mut Env) -> Result<Flow, LangError> {
        match stmt {
            Stmt::Assign {
                target,
                value,
                line,
            } => {
                let value = self.eval(value, env, *line)?;
                self.bind_target(target, value, env, *line)?;
                Ok(Flow::Normal)
            }
            Stmt::AugAssign {
                target,
                op,
                value,
                line,
            } => {
                let rhs = self.eval(value, env, *line)?;
                let current = self.read_target(target, env, *line)?;
                let updated = binary_op(*op, &current, &rhs).map_err(|m| LangError::eval(*line, m))?;
                self.bind_target(target, updated, env, *line)?;
                Ok(Flow::Normal)
            }
            Stmt::ExprStmt { expr, line } => {
                self.eval(expr, env, *line)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                branches,
                orelse,
                line,
            } => {
                for (cond, body) in branches {
                    if self.eval(cond, env, *line)?.truthy() {
                        return self.exec_block(body, env);
                    }
                }
                if orelse.is_empty() {
                    Ok(Flow::Normal)
                } else {
                    self.exec_block(orelse, env)
                }
            }
            Stmt::For {
                target,
                iter,
                body,
                line,
            } => {
                let iterable = self.eval(iter, env, *line)?;
                let mut it = ValueIter::new(&iterable)
                    .ok_or_else(|| LangError::eval(*line, format!("'{}' is not iterable", iterable.type_name())))?;
                while let Some(item) = it.next() {
                    self.check_cancelled(*line)?;
                    self.bind_target(target, item, env, *line)?;
                    match self.exec_block(body, env)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::While { cond, body, line } => {
                while self.eval(cond, env, *line)?.truthy() {
                    self.check_cancelled(*line)?;
                    match self.exec_block(body, env)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Def {
                name,
                params,
                body,
                ..
            } => {
                let function = Value::Function(Rc::new(UserFn {
                    name: name.clone(),
                    params: params.clone(),
                    body: body.clone(),
                }));
                env.assign(name, function);
                Ok(Flow::Normal)
            }
            Stmt::Return { value, line } => {
                let value = match value {
                    Some(expr) => self.eval(expr, env, *line)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break { .. } => Ok(Flow::Break),
            Stmt::Continue { .. } => Ok(Flow::Continue),
            Stmt::Import {
                module,
                alias,
                line,
            } => {
                let resolved = builtins::import_module(module)
                    .ok_or_else(|| LangError::security(*line, format!("import of module '{module}' is not allowed")))?;
                let bind_as = alias.as_deref().unwrap_or(module);
                env.assign(bind_as, Value::Module(resolved));
                Ok(Flow::Normal)
            }
        }
    }

    fn bind_target(
        &mut self,
        target: &Target,
        value: Value,
        env: &mut Env,
        line: u32,
    ) -> Result<(), LangError> {
        match target {
            Target::Name(name) => {
                env.assign(name, value);
                Ok(())
            }
            Target::Tuple(items) => {
                let values = match value {
                    Value::Tuple(vs) | Value::List(vs) => vs,
                    other => {
                        return Err(LangError::eval(
                            line,
                            format!("cannot unpack '{}'", other.type_name()),
                        ))
                    }
                };
                if values.len() != items.len() {
                    return Err(LangError::eval(
                        line,
                        format!("expected {} values to unpack, got {}", items.len(), values.len()),
                    ));
                }
                for (item, v) in items.iter().zip(values) {
                    self.bind_target(item, v, env, line)?;
                }
                Ok(())
            }
            Target::Subscript { object, index } => {
                let index = self.eval(index, env, line)?;
                let name = match object {
                    Expr::Name(name) => name,
                    _ => {
                        return Err(LangError::eval(
                            line,
                            "subscript assignment requires a plain name",
                        ))
                    }
                };
                let container = env
                    .lookup_mut(name)
                    .ok_or_else(|| LangError::eval(line, format!("name '{name}' is not defined")))?;
                match container {
                    Value::List(items) => {
                        let idx = list_index(&index, items.len())
                            .map_err(|m| LangError::eval(line, m))?;
                        items[idx] = value;
                        Ok(())
                    }
                    Value::Dict(pairs) => {
                        if let Some(slot) = pairs.iter_mut().find(|(k, _)| *k == index) {
                            slot.1 = value;
                        } else {
                            pairs.push((index, value));
                        }
                        Ok(())
                    }
                    other => Err(LangError::eval(
                        line,
                        format!("'{}' does not support item assignment", other.type_name()),
                    )),
                }
            }
        }
    }

    /// Current value of an augmented-assignment target.
    fn read_target(&mut self, target: &Target, env: &mut Env, line: u32) -> Result<Value, LangError> {
        match target {
            Target::Name(name) => env
                .lookup(name)
                .cloned()
                .ok_or_else(|| LangError::eval(line, format!("name '{name}' is not defined"))),
            Target::Subscript { object, index } => {
                let object = self.eval(object, env, line)?;
                let index = self.eval(index, env, line)?;
                subscript(&object, &index).map_err(|m| LangError::eval(line, m))
            }
            Target::Tuple(_) => Err(LangError::eval(
                line,
                "augmented assignment target must be a single name",
            )),
        }
    }

    pub fn eval(&mut self, expr: &Expr, env: &mut Env, line: u32) -> Result<Value, LangError> {
        match expr {
            Expr::Int(v) => Ok(Value::Int(*v)),
            Expr::Float(v) => Ok(Value::Float(*v)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::NoneLit => Ok(Value::None),
            Expr::Name(name) => env
                .lookup(name)
                .cloned()
                .ok_or_else(|| LangError::eval(line, format!("name '{name}' is not defined"))),
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, env, line)?;
                let right = self.eval(right, env, line)?;
                binary_op(*op, &left, &right).map_err(|m| LangError::eval(line, m))
            }
            Expr::Unary { op, operand } => {
                let operand = self.eval(operand, env, line)?;
                match op {
                    UnOp::Pos => match operand {
                        Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(operand),
                        other => Err(LangError::eval(
                            line,
                            format!("bad operand type for unary +: '{}'", other.type_name()),
                        )),
                    },
                    UnOp::Neg => match operand {
                        Value::Int(v) => Ok(Value::Int(-v)),
                        Value::Float(v) => Ok(Value::Float(-v)),
                        Value::Bool(b) => Ok(Value::Int(if b { -1 } else { 0 })),
                        other => Err(LangError::eval(
                            line,
                            format!("bad operand type for unary -: '{}'", other.type_name()),
                        )),
                    },
                    UnOp::Not => Ok(Value::Bool(!operand.truthy())),
                }
            }
            Expr::BoolOp { op, left, right } => {
                let left = self.eval(left, env, line)?;
                match op {
                    BoolOpKind::And => {
                        if left.truthy() {
                            self.eval(right, env, line)
                        } else {
                            Ok(left)
                        }
                    }
                    BoolOpKind::Or => {
                        if left.truthy() {
                            Ok(left)
                        } else {
                            self.eval(right, env, line)
                        }
                    }
                }
            }
            Expr::Compare { first, rest } => {
                let mut left = self.eval(first, env, line)?;
                for (op, operand) in rest {
                    let right = self.eval(operand, env, line)?;
                    if !compare(*op, &left, &right).map_err(|m| LangError::eval(line, m))? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Ternary { cond, then, orelse } => {
                if self.eval(cond, env, line)?.truthy() {
                    self.eval(then, env, line)
                } else {
                    self.eval(orelse, env, line)
                }
            }
            Expr::Call { func, args, line } => {
                let callee = self.eval(func, env, *line)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, env, *line)?);
                }
                self.call(&callee, values, env, *line)
            }
            Expr::Attribute { object, name, line } => {
                let object = self.eval(object, env, *line)?;
                match object {
                    Value::Module(module) => builtins::module_attr(module, name).ok_or_else(|| {
                        LangError::eval(
                            *line,
                            format!("module '{}' has no attribute '{name}'", module.name()),
                        )
                    }),
                    other => Err(LangError::eval(
                        *line,
                        format!("'{}' has no attribute '{name}'", other.type_name()),
                    )),
                }
            }
            Expr::Subscript { object, index } => {
                let object = self.eval(object, env, line)?;
                let index = self.eval(index, env, line)?;
                subscript(&object, &index).map_err(|m| LangError::eval(line, m))
            }
            Expr::List(items) => {
                let values = self.eval_all(items, env, line)?;
                Ok(Value::List(values))
            }
            Expr::Tuple(items) => {
                let values = self.eval_all(items, env, line)?;
                Ok(Value::Tuple(values))
            }
            Expr::Set(items) => {
                let values = self.eval_all(items, env, line)?;
                Ok(Value::Set(dedup(values)))
            }
            Expr::Dict(pairs) => {
                let mut out: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = self.eval(k, env, line)?;
                    let value = self.eval(v, env, line)?;
                    if let Some(slot) = out.iter_mut().find(|(ek, _)| *ek == key) {
                        slot.1 = value;
                    } else {
                        out.push((key, value));
                    }
                }
                Ok(Value::Dict(out))
            }
            Expr::ListComp { element, comp } => {
                let mut out = Vec::new();
                self.run_comprehension(comp, env, line, |interp, env| {
                    out.push(interp.eval(element, env, line)?);
                    Ok(())
                })?;
                Ok(Value::List(out))
            }
            Expr::SetComp { element, comp } => {
                let mut out = Vec::new();
                self.run_comprehension(comp, env, line, |interp, env| {
                    out.push(interp.eval(element, env, line)?);
                    Ok(())
                })?;
                Ok(Value::Set(dedup(out)))
            }
            Expr::DictComp { key, value, comp } => {
                let mut out: Vec<(Value, Value)> = Vec::new();
                self.run_comprehension(comp, env, line, |interp, env| {
                    let k = interp.eval(key, env, line)?;
                    let v = interp.eval(value, env, line)?;
                    if let Some(slot) = out.iter_mut().find(|(ek, _)| *ek == k) {
                        slot.1 = v;
                    } else {
                        out.push((k, v));
                    }
                    Ok(())
                })?;
                Ok(Value::Dict(out))
            }
        }
    }

    fn eval_all(
        &mut self,
        exprs: &[Expr],
        env: &mut Env,
        line: u32,
    ) -> Result<Vec<Value>, LangError> {
        exprs.iter().map(|e| self.eval(e, env, line)).collect()
    }

    fn run_comprehension(
        &mut self,
        comp: &Comprehension,
        env: &mut Env,
        line: u32,
        mut emit: impl FnMut(&mut Self, &mut Env) -> Result<(), LangError>,
    ) -> Result<(), LangError> {
        let iterable = self.eval(&comp.iter, env, line)?;
        let mut it = ValueIter::new(&iterable).ok_or_else(|| {
            LangError::eval(line, format!("'{}' is not iterable", iterable.type_name()))
        })?;
        'outer: while let Some(item) = it.next() {
            self.check_cancelled(line)?;
            self.bind_target(&comp.target, item, env, line)?;
            for cond in &comp.conds {
                if !self.eval(cond, env, line)?.truthy() {
                    continue 'outer;
                }
            }
            emit(self, env)?;
        }
        Ok(())
    }

    fn call(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        env: &mut Env,
        line: u32,
    ) -> Result<Value, LangError> {
        self.check_cancelled(line)?;
        match callee {
            Value::Builtin(builtin) => builtin
                .call(&args)
                .map_err(|m| LangError::eval(line, m)),
            Value::Function(function) => {
                if args.len() != function.params.len() {
                    return Err(LangError::eval(
                        line,
                        format!(
                            "{}() takes {} argument(s), got {}",
                            function.name,
                            function.params.len(),
                            args.len()
                        ),
                    ));
                }
                if self.depth >= MAX_CALL_DEPTH {
                    return Err(LangError::eval(line, "maximum recursion depth exceeded"));
                }
                let mut frame = HashMap::new();
                for (param, arg) in function.params.iter().zip(args) {
                    frame.insert(param.clone(), arg);
                }
                env.frames.push(frame);
                self.depth += 1;
                let outcome = self.exec_block(&function.body, env);
                self.depth -= 1;
                env.frames.pop();
                match outcome? {
                    Flow::Return(v) => Ok(v),
                    Flow::Normal => Ok(Value::None),
                    Flow::Break | Flow::Continue => Err(LangError::eval(
                        line,
                        "'break' or 'continue' outside a loop",
                    )),
                }
            }
            other => Err(LangError::eval(
                line,
                format!("'{}' is not callable", other.type_name()),
            )),
        }
    }
}

// =============================================================================
// Operator semantics
// =============================================================================

fn binary_op(op: BinOp, left: &Value, right: &Value) -> Result<Value, String> {
    // Sequence concatenation and repetition first.
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{a}{b}"))),
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            return Ok(Value::List(out));
        }
        (BinOp::Mul, Value::List(items), Value::Int(n)) => {
            let mut out = Vec::new();
            for _ in 0..(*n).max(0) {
                out.extend(items.iter().cloned());
            }
            return Ok(Value::List(out));
        }
        (BinOp::Mul, Value::Str(s), Value::Int(n)) => {
            return Ok(Value::Str(s.repeat((*n).max(0) as usize)));
        }
        _ => {}
    }

    let both_int = matches!(left, Value::Int(_) | Value::Bool(_))
        && matches!(right, Value::Int(_) | Value::Bool(_));
    let (a, b) = match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(format!(
                "unsupported operand types for {}: '{}' and '{}'",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ))
        }
    };

    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul => {
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                _ => a * b,
            };
            if both_int && result.abs() < i64::MAX as f64 {
                Ok(Value::Int(result as i64))
            } else {
                Ok(Value::Float(result))
            }
        }
        BinOp::Div => {
            if b == 0.0 {
                Err("division by zero".to_string())
            } else {
                Ok(Value::Float(a / b))
            }
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                Err("integer division by zero".to_string())
            } else {
                let result = (a / b).floor();
                if both_int {
                    Ok(Value::Int(result as i64))
                } else {
                    Ok(Value::Float(result))
                }
            }
        }
        BinOp::Mod => {
            if b == 0.0 {
                Err("modulo by zero".to_string())
            } else {
                // Python semantics: the result takes the sign of the divisor.
                let result = a - b * (a / b).floor();
                if both_int {
                    Ok(Value::Int(result as i64))
                } else {
                    Ok(Value::Float(result))
                }
            }
        }
        BinOp::Pow => {
            let result = a.powf(b);
            if both_int && b >= 0.0 && result.abs() < i64::MAX as f64 {
                Ok(Value::Int(result as i64))
            } else {
                Ok(Value::Float(result))
            }
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, String> {
    if let (Value::Str(a), Value::Str(b)) = (left, right) {
        return Ok(match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        });
    }
    match (left.as_number(), right.as_number()) {
        (Some(a), Some(b)) => Ok(match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }),
        _ => match op {
            CmpOp::Eq => Ok(left == right),
            CmpOp::Ne => Ok(left != right),
            _ => Err(format!(
                "'{}' and '{}' are not orderable",
                left.type_name(),
                right.type_name()
            )),
        },
    }
}

fn subscript(object: &Value, index: &Value) -> Result<Value, String> {
    match object {
        Value::List(items) | Value::Tuple(items) => {
            let idx = list_index(index, items.len())?;
            Ok(items[idx].clone())
        }
        Value::Dict(pairs) => pairs
            .iter()
            .find(|(k, _)| k == index)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| format!("key {index} not found")),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = list_index(index, chars.len())?;
            Ok(Value::Str(chars[idx].to_string()))
        }
        other => Err(format!("'{}' is not subscriptable", other.type_name())),
    }
}

/// Resolve a (possibly negative) index against a container length.
fn list_index(index: &Value, len: usize) -> Result<usize, String> {
    let raw = index
        .as_int()
        .ok_or_else(|| format!("indices must be integers, not {}", index.type_name()))?;
    let resolved = if raw < 0 { raw + len as i64 } else { raw };
    if resolved < 0 || resolved as usize >= len {
        Err(format!("index {raw} out of range"))
    } else {
        Ok(resolved as usize)
    }
}

fn dedup(values: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for v in values {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

/// Lazy iteration over iterable values.
enum ValueIter {
    Items(std::vec::IntoIter<Value>),
    Range { cur: i64, stop: i64, step: i64 },
}

impl ValueIter {
    fn new(value: &Value) -> Option<Self> {
        match value {
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
                Some(ValueIter::Items(items.clone().into_iter()))
            }
            Value::Dict(pairs) => Some(ValueIter::Items(
                pairs
                    .iter()
                    .map(|(k, _)| k.clone())
                    .collect::<Vec<_>>()
                    .into_iter(),
            )),
            Value::Str(s) => Some(ValueIter::Items(
                s.chars()
                    .map(|c| Value::Str(c.to_string()))
                    .collect::<Vec<_>>()
                    .into_iter(),
            )),
            Value::Range { start, stop, step } => Some(ValueIter::Range {
                cur: *start,
                stop: *stop,
                step: *step,
            }),
            _ => None,
        }
    }
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Items(it) => it.next(),
            ValueIter::Range { cur, stop, step } => {
                let done = (*step > 0 && *cur >= *stop) || (*step < 0 && *cur <= *stop);
                if done {
                    None
                } else {
                    let v = *cur;
                    *cur += *step;
                    Some(Value::Int(v))
                }
            }
        }
    }
}
