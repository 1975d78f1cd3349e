//! Layout-aware lexer.
//!
//! Logos tokenizes one logical line at a time; this pass tracks indentation
//! and bracket depth, synthesizing `Newline`, `Indent` and `Dedent` tokens.
//! Inside brackets, line breaks are implicit continuations and layout tokens
//! are suppressed.

use logos::Logos;

use crate::error::LangError;
use crate::token::Token;

/// A token tagged with the 1-based source line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
}

impl Spanned {
    fn new(token: Token, line: u32) -> Self {
        Self { token, line }
    }
}

/// Tokenize a source block into a layout-resolved token list.
pub fn lex(source: &str) -> Result<Vec<Spanned>, LangError> {
    let mut tokens = Vec::new();
    let mut indents: Vec<usize> = vec![0];
    let mut depth: usize = 0;
    let mut last_line = 1u32;

    for (idx, raw_line) in source.lines().enumerate() {
        let line = idx as u32 + 1;
        last_line = line;

        // Comment-only and blank lines never affect layout.
        let content = strip_comment(raw_line);
        if depth == 0 && content.trim().is_empty() {
            continue;
        }

        if depth == 0 {
            let indent = indent_width(content);
            let current = *indents.last().unwrap_or(&0);
            if indent > current {
                indents.push(indent);
                tokens.push(Spanned::new(Token::Indent, line));
            } else if indent < current {
                while *indents.last().unwrap_or(&0) > indent {
                    indents.pop();
                    tokens.push(Spanned::new(Token::Dedent, line));
                }
                if *indents.last().unwrap_or(&0) != indent {
                    return Err(LangError::parse(line, "inconsistent indentation"));
                }
            }
        }

        let mut lexer = Token::lexer(content.trim_start_matches([' ', '\t']));
        while let Some(result) = lexer.next() {
            match result {
                Ok(token) => {
                    match token {
                        Token::LParen | Token::LBracket | Token::LBrace => depth += 1,
                        Token::RParen | Token::RBracket | Token::RBrace => {
                            depth = depth.saturating_sub(1)
                        }
                        _ => {}
                    }
                    tokens.push(Spanned::new(token, line));
                }
                Err(()) => {
                    return Err(LangError::parse(
                        line,
                        format!("unexpected character(s) '{}'", lexer.slice()),
                    ));
                }
            }
        }

        if depth == 0 {
            tokens.push(Spanned::new(Token::Newline, line));
        }
    }

    if depth > 0 {
        return Err(LangError::parse(last_line, "unclosed bracket"));
    }
    while *indents.last().unwrap_or(&0) > 0 {
        indents.pop();
        tokens.push(Spanned::new(Token::Dedent, last_line));
    }

    Ok(tokens)
}

/// Truncate at the first `#` that is not inside a string literal.
fn strip_comment(line: &str) -> &str {
    let mut in_str: Option<char> = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match in_str {
            Some(quote) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == quote {
                    in_str = None;
                }
            }
            None => match c {
                '#' => return &line[..i],
                '"' | '\'' => in_str = Some(c),
                _ => {}
            },
        }
    }
    line
}

/// Leading whitespace width with tabs expanded to 8 columns.
fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width = (width / 8 + 1) * 8,
            _ => break,
        }
    }
    width
}
