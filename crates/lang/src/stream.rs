//! Token stream with lookahead for the recursive descent parser.

use crate::error::LangError;
use crate::lexer::Spanned;
use crate::token::Token;

pub struct TokenStream<'src> {
    tokens: &'src [Spanned],
    pos: usize,
}

impl<'src> TokenStream<'src> {
    pub fn new(tokens: &'src [Spanned]) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Peek at the current token without consuming it.
    pub fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    /// Peek at the nth token ahead without consuming.
    pub fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|s| &s.token)
    }

    /// Advance to the next token and return the consumed one.
    pub fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos).map(|s| &s.token);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// Check if the current token matches the expected discriminant.
    pub fn check(&self, expected: &Token) -> bool {
        matches!(self.peek(), Some(t) if std::mem::discriminant(t) == std::mem::discriminant(expected))
    }

    /// Consume the current token if it matches, otherwise report an error.
    pub fn expect(&mut self, expected: Token) -> Result<(), LangError> {
        if self.check(&expected) {
            self.advance();
            Ok(())
        } else {
            let line = self.current_line();
            let found = match self.peek() {
                Some(t) => t.describe(),
                None => "end of input".to_string(),
            };
            Err(LangError::parse(
                line,
                format!("expected {}, found {}", expected.describe(), found),
            ))
        }
    }

    /// Consume the current token if it matches; report nothing otherwise.
    pub fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Line of the current token, or of the last token at EOF.
    pub fn current_line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    pub fn error(&self, message: impl Into<String>) -> LangError {
        LangError::parse(self.current_line(), message)
    }

    pub fn unexpected(&self, context: &str) -> LangError {
        let found = match self.peek() {
            Some(t) => t.describe(),
            None => "end of input".to_string(),
        };
        self.error(format!("unexpected {found} {context}"))
    }
}
