//! Recursive descent parser.
//!
//! Expressions use precedence climbing; statements are keyword-dispatched.
//! The parser accepts the full restricted grammar; security restrictions
//! (closed call sets, import whitelist) are applied afterwards in `validate`.

use crate::ast::{BinOp, BoolOpKind, CmpOp, Comprehension, Expr, Stmt, Target, UnOp};
use crate::error::LangError;
use crate::lexer;
use crate::stream::TokenStream;
use crate::token::Token;

/// Parse a single-line expression (the `expresion` function form).
pub fn parse_expression(source: &str) -> Result<Expr, LangError> {
    let tokens = lexer::lex(source)?;
    let mut stream = TokenStream::new(&tokens);
    if stream.at_end() {
        return Err(LangError::parse(1, "empty expression"));
    }
    let expr = parse_expr(&mut stream)?;
    while stream.eat(&Token::Newline) {}
    if !stream.at_end() {
        return Err(stream.unexpected("after expression"));
    }
    Ok(expr)
}

/// Parse a code block (the `codigo` function form) into a statement list.
pub fn parse_module(source: &str) -> Result<Vec<Stmt>, LangError> {
    let tokens = lexer::lex(source)?;
    let mut stream = TokenStream::new(&tokens);
    let mut stmts = Vec::new();
    while !stream.at_end() {
        if stream.eat(&Token::Newline) {
            continue;
        }
        stmts.push(parse_stmt(&mut stream)?);
    }
    if stmts.is_empty() {
        return Err(LangError::parse(1, "empty code block"));
    }
    Ok(stmts)
}

// =============================================================================
// Statements
// =============================================================================

fn parse_stmt(stream: &mut TokenStream) -> Result<Stmt, LangError> {
    match stream.peek() {
        Some(Token::If) => parse_if(stream),
        Some(Token::While) => parse_while(stream),
        Some(Token::For) => parse_for(stream),
        Some(Token::Def) => parse_def(stream),
        _ => parse_simple_stmt(stream),
    }
}

fn parse_simple_stmt(stream: &mut TokenStream) -> Result<Stmt, LangError> {
    let line = stream.current_line();
    let stmt = match stream.peek() {
        Some(Token::Return) => {
            stream.advance();
            let value = if stream.check(&Token::Newline) || stream.at_end() {
                None
            } else {
                Some(parse_expr_list(stream)?)
            };
            Stmt::Return { value, line }
        }
        Some(Token::Break) => {
            stream.advance();
            Stmt::Break { line }
        }
        Some(Token::Continue) => {
            stream.advance();
            Stmt::Continue { line }
        }
        Some(Token::Import) => {
            stream.advance();
            let module = expect_ident(stream, "module name after 'import'")?;
            let alias = if stream.eat(&Token::As) {
                Some(expect_ident(stream, "alias after 'as'")?)
            } else {
                None
            };
            Stmt::Import {
                module,
                alias,
                line,
            }
        }
        _ => parse_assign_or_expr(stream, line)?,
    };
    end_of_statement(stream)?;
    Ok(stmt)
}

fn parse_assign_or_expr(stream: &mut TokenStream, line: u32) -> Result<Stmt, LangError> {
    let first = parse_expr_list(stream)?;

    if stream.eat(&Token::Eq) {
        let target = expr_to_target(first, line)?;
        let value = parse_expr_list(stream)?;
        if stream.check(&Token::Eq) {
            return Err(stream.error("chained assignment is not supported"));
        }
        return Ok(Stmt::Assign {
            target,
            value,
            line,
        });
    }

    if let Some(op) = aug_assign_op(stream.peek()) {
        stream.advance();
        let target = expr_to_target(first, line)?;
        if matches!(target, Target::Tuple(_)) {
            return Err(LangError::parse(
                line,
                "augmented assignment target must be a single name",
            ));
        }
        let value = parse_expr_list(stream)?;
        return Ok(Stmt::AugAssign {
            target,
            op,
            value,
            line,
        });
    }

    Ok(Stmt::ExprStmt { expr: first, line })
}

fn aug_assign_op(token: Option<&Token>) -> Option<BinOp> {
    match token {
        Some(Token::PlusEq) => Some(BinOp::Add),
        Some(Token::MinusEq) => Some(BinOp::Sub),
        Some(Token::StarEq) => Some(BinOp::Mul),
        Some(Token::SlashEq) => Some(BinOp::Div),
        Some(Token::DoubleSlashEq) => Some(BinOp::FloorDiv),
        Some(Token::PercentEq) => Some(BinOp::Mod),
        Some(Token::DoubleStarEq) => Some(BinOp::Pow),
        _ => None,
    }
}

fn parse_if(stream: &mut TokenStream) -> Result<Stmt, LangError> {
    let line = stream.current_line();
    stream.expect(Token::If)?;
    let cond = parse_expr(stream)?;
    let body = parse_block(stream)?;
    let mut branches = vec![(cond, body)];
    let mut orelse = Vec::new();

    loop {
        if stream.check(&Token::Elif) {
            stream.advance();
            let cond = parse_expr(stream)?;
            let body = parse_block(stream)?;
            branches.push((cond, body));
        } else if stream.check(&Token::Else) {
            stream.advance();
            orelse = parse_block(stream)?;
            break;
        } else {
            break;
        }
    }

    Ok(Stmt::If {
        branches,
        orelse,
        line,
    })
}

fn parse_while(stream: &mut TokenStream) -> Result<Stmt, LangError> {
    let line = stream.current_line();
    stream.expect(Token::While)?;
    let cond = parse_expr(stream)?;
    let body = parse_block(stream)?;
    Ok(Stmt::While { cond, body, line })
}

fn parse_for(stream: &mut TokenStream) -> Result<Stmt, LangError> {
    let line = stream.current_line();
    stream.expect(Token::For)?;
    let target = parse_target_list(stream)?;
    stream.expect(Token::In)?;
    let iter = parse_expr(stream)?;
    let body = parse_block(stream)?;
    Ok(Stmt::For {
        target,
        iter,
        body,
        line,
    })
}

fn parse_def(stream: &mut TokenStream) -> Result<Stmt, LangError> {
    let line = stream.current_line();
    stream.expect(Token::Def)?;
    let name = expect_ident(stream, "function name after 'def'")?;
    stream.expect(Token::LParen)?;
    let mut params = Vec::new();
    while !stream.check(&Token::RParen) {
        params.push(expect_ident(stream, "parameter name")?);
        if !stream.check(&Token::RParen) {
            stream.expect(Token::Comma)?;
        }
    }
    stream.expect(Token::RParen)?;
    let body = parse_block(stream)?;
    Ok(Stmt::Def {
        name,
        params,
        body,
        line,
    })
}

/// `: NEWLINE INDENT stmt+ DEDENT`
fn parse_block(stream: &mut TokenStream) -> Result<Vec<Stmt>, LangError> {
    stream.expect(Token::Colon)?;
    stream.expect(Token::Newline)?;
    stream.expect(Token::Indent)?;
    let mut stmts = Vec::new();
    while !stream.check(&Token::Dedent) && !stream.at_end() {
        if stream.eat(&Token::Newline) {
            continue;
        }
        stmts.push(parse_stmt(stream)?);
    }
    stream.eat(&Token::Dedent);
    if stmts.is_empty() {
        return Err(stream.error("empty block"));
    }
    Ok(stmts)
}

fn end_of_statement(stream: &mut TokenStream) -> Result<(), LangError> {
    if stream.at_end() || stream.eat(&Token::Newline) {
        Ok(())
    } else {
        Err(stream.unexpected("at end of statement"))
    }
}

fn expect_ident(stream: &mut TokenStream, context: &str) -> Result<String, LangError> {
    match stream.peek() {
        Some(Token::Ident(name)) => {
            let name = name.clone();
            stream.advance();
            Ok(name)
        }
        _ => Err(stream.unexpected(&format!("where {context} was expected"))),
    }
}

fn expr_to_target(expr: Expr, line: u32) -> Result<Target, LangError> {
    match expr {
        Expr::Name(name) => Ok(Target::Name(name)),
        Expr::Tuple(items) => {
            let targets = items
                .into_iter()
                .map(|e| expr_to_target(e, line))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Target::Tuple(targets))
        }
        Expr::Subscript { object, index } => Ok(Target::Subscript {
            object: *object,
            index: *index,
        }),
        _ => Err(LangError::parse(line, "invalid assignment target")),
    }
}

fn parse_target_list(stream: &mut TokenStream) -> Result<Target, LangError> {
    let line = stream.current_line();
    let expr = parse_expr_list(stream)?;
    expr_to_target(expr, line)
}

// =============================================================================
// Expressions
// =============================================================================

/// `a, b, c` becomes a tuple; a single expression stays as-is.
fn parse_expr_list(stream: &mut TokenStream) -> Result<Expr, LangError> {
    let first = parse_expr(stream)?;
    if !stream.check(&Token::Comma) {
        return Ok(first);
    }
    let mut items = vec![first];
    while stream.eat(&Token::Comma) {
        if expr_list_ends(stream.peek()) {
            break;
        }
        items.push(parse_expr(stream)?);
    }
    Ok(Expr::Tuple(items))
}

fn expr_list_ends(token: Option<&Token>) -> bool {
    matches!(
        token,
        None | Some(Token::Newline)
            | Some(Token::Eq)
            | Some(Token::In)
            | Some(Token::RParen)
            | Some(Token::RBracket)
            | Some(Token::RBrace)
            | Some(Token::Colon)
    )
}

/// Full expression: ternary over the boolean lattice.
pub(crate) fn parse_expr(stream: &mut TokenStream) -> Result<Expr, LangError> {
    let then = parse_or(stream)?;
    if stream.check(&Token::If) {
        stream.advance();
        let cond = parse_or(stream)?;
        stream.expect(Token::Else)?;
        let orelse = parse_expr(stream)?;
        return Ok(Expr::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            orelse: Box::new(orelse),
        });
    }
    Ok(then)
}

fn parse_or(stream: &mut TokenStream) -> Result<Expr, LangError> {
    let mut left = parse_and(stream)?;
    while stream.check(&Token::Or) {
        stream.advance();
        let right = parse_and(stream)?;
        left = Expr::BoolOp {
            op: BoolOpKind::Or,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn parse_and(stream: &mut TokenStream) -> Result<Expr, LangError> {
    let mut left = parse_not(stream)?;
    while stream.check(&Token::And) {
        stream.advance();
        let right = parse_not(stream)?;
        left = Expr::BoolOp {
            op: BoolOpKind::And,
            left: Box::new(left),
            right: Box::new(right),
        };
    }
    Ok(left)
}

fn parse_not(stream: &mut TokenStream) -> Result<Expr, LangError> {
    if stream.check(&Token::Not) {
        stream.advance();
        let operand = parse_not(stream)?;
        return Ok(Expr::Unary {
            op: UnOp::Not,
            operand: Box::new(operand),
        });
    }
    parse_comparison(stream)
}

fn cmp_op(token: Option<&Token>) -> Option<CmpOp> {
    match token {
        Some(Token::EqEq) => Some(CmpOp::Eq),
        Some(Token::NotEq) => Some(CmpOp::Ne),
        Some(Token::Lt) => Some(CmpOp::Lt),
        Some(Token::LtEq) => Some(CmpOp::Le),
        Some(Token::Gt) => Some(CmpOp::Gt),
        Some(Token::GtEq) => Some(CmpOp::Ge),
        _ => None,
    }
}

/// Chained comparisons: `a < b <= c`.
fn parse_comparison(stream: &mut TokenStream) -> Result<Expr, LangError> {
    let first = parse_pratt(stream, 0)?;
    let mut rest = Vec::new();
    while let Some(op) = cmp_op(stream.peek()) {
        stream.advance();
        rest.push((op, parse_pratt(stream, 0)?));
    }
    if rest.is_empty() {
        Ok(first)
    } else {
        Ok(Expr::Compare {
            first: Box::new(first),
            rest,
        })
    }
}

/// Operator associativity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assoc {
    Left,
    Right,
}

/// (precedence, associativity, op) for arithmetic binary operators.
/// Higher precedence binds tighter.
fn binary_op_info(token: &Token) -> Option<(u8, Assoc, BinOp)> {
    match token {
        Token::Plus => Some((40, Assoc::Left, BinOp::Add)),
        Token::Minus => Some((40, Assoc::Left, BinOp::Sub)),
        Token::Star => Some((50, Assoc::Left, BinOp::Mul)),
        Token::Slash => Some((50, Assoc::Left, BinOp::Div)),
        Token::DoubleSlash => Some((50, Assoc::Left, BinOp::FloorDiv)),
        Token::Percent => Some((50, Assoc::Left, BinOp::Mod)),
        Token::DoubleStar => Some((60, Assoc::Right, BinOp::Pow)),
        _ => None,
    }
}

/// Precedence climbing over the arithmetic operators.
fn parse_pratt(stream: &mut TokenStream, min_prec: u8) -> Result<Expr, LangError> {
    let mut left = parse_unary(stream)?;

    while let Some(token) = stream.peek() {
        if let Some((prec, assoc, op)) = binary_op_info(token) {
            if prec < min_prec {
                break;
            }
            stream.advance();
            let next_prec = if assoc == Assoc::Left { prec + 1 } else { prec };
            let right = parse_pratt(stream, next_prec)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        } else {
            break;
        }
    }

    Ok(left)
}

fn parse_unary(stream: &mut TokenStream) -> Result<Expr, LangError> {
    let op = match stream.peek() {
        Some(Token::Minus) => Some(UnOp::Neg),
        Some(Token::Plus) => Some(UnOp::Pos),
        _ => None,
    };
    if let Some(op) = op {
        stream.advance();
        let operand = parse_unary(stream)?;
        return Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        });
    }
    parse_postfix(stream)
}

/// Postfix chain: calls, subscripts and attribute access.
fn parse_postfix(stream: &mut TokenStream) -> Result<Expr, LangError> {
    let mut expr = parse_atom(stream)?;

    loop {
        match stream.peek() {
            Some(Token::LParen) => {
                let line = stream.current_line();
                let args = parse_call_args(stream)?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    line,
                };
            }
            Some(Token::LBracket) => {
                stream.advance();
                let index = parse_expr(stream)?;
                stream.expect(Token::RBracket)?;
                expr = Expr::Subscript {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            }
            Some(Token::Dot) => {
                let line = stream.current_line();
                stream.advance();
                let name = expect_ident(stream, "attribute name after '.'")?;
                expr = Expr::Attribute {
                    object: Box::new(expr),
                    name,
                    line,
                };
            }
            _ => break,
        }
    }

    Ok(expr)
}

fn parse_call_args(stream: &mut TokenStream) -> Result<Vec<Expr>, LangError> {
    stream.expect(Token::LParen)?;
    let mut args = Vec::new();
    while !stream.check(&Token::RParen) {
        // Keyword arguments are outside the restricted grammar.
        if matches!(stream.peek(), Some(Token::Ident(_)))
            && matches!(stream.peek_nth(1), Some(Token::Eq))
        {
            return Err(stream.error("keyword arguments are not supported"));
        }
        args.push(parse_expr(stream)?);
        if !stream.check(&Token::RParen) {
            stream.expect(Token::Comma)?;
        }
    }
    stream.expect(Token::RParen)?;
    Ok(args)
}

fn parse_atom(stream: &mut TokenStream) -> Result<Expr, LangError> {
    match stream.peek().cloned() {
        Some(Token::Int(v)) => {
            stream.advance();
            Ok(Expr::Int(v))
        }
        Some(Token::Float(v)) => {
            stream.advance();
            Ok(Expr::Float(v))
        }
        Some(Token::Str(s)) => {
            stream.advance();
            Ok(Expr::Str(s))
        }
        Some(Token::True) => {
            stream.advance();
            Ok(Expr::Bool(true))
        }
        Some(Token::False) => {
            stream.advance();
            Ok(Expr::Bool(false))
        }
        Some(Token::None) => {
            stream.advance();
            Ok(Expr::NoneLit)
        }
        Some(Token::Ident(name)) => {
            stream.advance();
            Ok(Expr::Name(name))
        }
        Some(Token::LParen) => parse_paren(stream),
        Some(Token::LBracket) => parse_list(stream),
        Some(Token::LBrace) => parse_brace(stream),
        _ => Err(stream.unexpected("where an expression was expected")),
    }
}

/// `()` empty tuple, `(e)` grouping, `(a, b)` tuple.
fn parse_paren(stream: &mut TokenStream) -> Result<Expr, LangError> {
    stream.expect(Token::LParen)?;
    if stream.eat(&Token::RParen) {
        return Ok(Expr::Tuple(Vec::new()));
    }
    let first = parse_expr(stream)?;
    if stream.check(&Token::Comma) {
        let mut items = vec![first];
        while stream.eat(&Token::Comma) {
            if stream.check(&Token::RParen) {
                break;
            }
            items.push(parse_expr(stream)?);
        }
        stream.expect(Token::RParen)?;
        return Ok(Expr::Tuple(items));
    }
    stream.expect(Token::RParen)?;
    Ok(first)
}

/// `[...]` list literal or list comprehension.
fn parse_list(stream: &mut TokenStream) -> Result<Expr, LangError> {
    stream.expect(Token::LBracket)?;
    if stream.eat(&Token::RBracket) {
        return Ok(Expr::List(Vec::new()));
    }
    let first = parse_expr(stream)?;
    if stream.check(&Token::For) {
        let comp = parse_comprehension(stream)?;
        stream.expect(Token::RBracket)?;
        return Ok(Expr::ListComp {
            element: Box::new(first),
            comp: Box::new(comp),
        });
    }
    let mut items = vec![first];
    while stream.eat(&Token::Comma) {
        if stream.check(&Token::RBracket) {
            break;
        }
        items.push(parse_expr(stream)?);
    }
    stream.expect(Token::RBracket)?;
    Ok(Expr::List(items))
}

/// `{...}` dict/set literal or comprehension.
fn parse_brace(stream: &mut TokenStream) -> Result<Expr, LangError> {
    stream.expect(Token::LBrace)?;
    if stream.eat(&Token::RBrace) {
        return Ok(Expr::Dict(Vec::new()));
    }
    let first = parse_expr(stream)?;

    if stream.eat(&Token::Colon) {
        let value = parse_expr(stream)?;
        if stream.check(&Token::For) {
            let comp = parse_comprehension(stream)?;
            stream.expect(Token::RBrace)?;
            return Ok(Expr::DictComp {
                key: Box::new(first),
                value: Box::new(value),
                comp: Box::new(comp),
            });
        }
        let mut pairs = vec![(first, value)];
        while stream.eat(&Token::Comma) {
            if stream.check(&Token::RBrace) {
                break;
            }
            let key = parse_expr(stream)?;
            stream.expect(Token::Colon)?;
            let value = parse_expr(stream)?;
            pairs.push((key, value));
        }
        stream.expect(Token::RBrace)?;
        return Ok(Expr::Dict(pairs));
    }

    if stream.check(&Token::For) {
        let comp = parse_comprehension(stream)?;
        stream.expect(Token::RBrace)?;
        return Ok(Expr::SetComp {
            element: Box::new(first),
            comp: Box::new(comp),
        });
    }
    let mut items = vec![first];
    while stream.eat(&Token::Comma) {
        if stream.check(&Token::RBrace) {
            break;
        }
        items.push(parse_expr(stream)?);
    }
    stream.expect(Token::RBrace)?;
    Ok(Expr::Set(items))
}

/// `for target in iter [if cond]*`. The iterable and conditions parse at
/// boolean level so a trailing `if` always belongs to the comprehension.
fn parse_comprehension(stream: &mut TokenStream) -> Result<Comprehension, LangError> {
    stream.expect(Token::For)?;
    let line = stream.current_line();
    let first = parse_comp_target(stream)?;
    let target = if stream.check(&Token::Comma) {
        let mut items = vec![first];
        while stream.eat(&Token::Comma) {
            items.push(parse_comp_target(stream)?);
        }
        Target::Tuple(items)
    } else {
        first
    };
    stream.expect(Token::In)?;
    let iter = parse_or(stream)?;
    let mut conds = Vec::new();
    while stream.eat(&Token::If) {
        conds.push(parse_or(stream)?);
    }
    if stream.check(&Token::For) {
        return Err(LangError::parse(
            line,
            "nested comprehension clauses are not supported",
        ));
    }
    Ok(Comprehension {
        target,
        iter,
        conds,
    })
}

fn parse_comp_target(stream: &mut TokenStream) -> Result<Target, LangError> {
    match stream.peek().cloned() {
        Some(Token::Ident(name)) => {
            stream.advance();
            Ok(Target::Name(name))
        }
        Some(Token::LParen) => {
            stream.advance();
            let mut items = Vec::new();
            while !stream.check(&Token::RParen) {
                items.push(parse_comp_target(stream)?);
                if !stream.check(&Token::RParen) {
                    stream.expect(Token::Comma)?;
                }
            }
            stream.expect(Token::RParen)?;
            Ok(Target::Tuple(items))
        }
        _ => Err(stream.unexpected("where a loop variable was expected")),
    }
}
