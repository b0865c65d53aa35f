//! Tokenizer shared by both evaluators.

use super::ExpressionError;

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Equality and relational operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// `&&`, `||` and prefix `!`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Boolean(bool),
    Null,
    Undefined,
    Identifier(String),
    Operator(ArithOp),
    Comparison(CompareOp),
    Logical(LogicalOp),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Question,
    Colon,
    Pipe,
    Eof,
}

/// A token and the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub offset: usize,
}

/// Split `expression` into tokens, always terminated by `Eof`.
pub fn tokenize(expression: &str) -> Result<Vec<Token>, ExpressionError> {
    Lexer::new(expression).run()
}

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(i, _)| *i)
            .unwrap_or(self.source.len())
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            expression: self.source.to_string(),
            offset,
            message: message.into(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, ExpressionError> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
                continue;
            }
            let offset = self.offset();
            let kind = match c {
                '0'..='9' => self.number()?,
                '"' | '\'' => self.string(c)?,
                c if c.is_ascii_alphabetic() || c == '_' || c == '$' => self.word(),
                _ => self.symbol(c, offset)?,
            };
            tokens.push(Token { kind, offset });
        }
        tokens.push(Token {
            kind: TokenKind::Eof,
            offset: self.source.len(),
        });
        Ok(tokens)
    }

    fn number(&mut self) -> Result<TokenKind, ExpressionError> {
        let start = self.offset();
        while matches!(self.peek(), Some('0'..='9')) {
            self.pos += 1;
        }
        if self.peek() == Some('.') && matches!(self.peek_at(1), Some('0'..='9')) {
            self.pos += 1;
            while matches!(self.peek(), Some('0'..='9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some('+' | '-')));
            if matches!(self.peek_at(1 + sign), Some('0'..='9')) {
                self.pos += 1 + sign;
                while matches!(self.peek(), Some('0'..='9')) {
                    self.pos += 1;
                }
            }
        }
        let text = &self.source[start..self.offset()];
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| self.error(start, format!("invalid number '{text}'")))
    }

    fn string(&mut self, quote: char) -> Result<TokenKind, ExpressionError> {
        let start = self.offset();
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error(start, "unterminated string literal"));
            };
            self.pos += 1;
            match c {
                c if c == quote => return Ok(TokenKind::Str(out)),
                '\\' => {
                    let Some(escaped) = self.peek() else {
                        return Err(self.error(start, "unterminated string literal"));
                    };
                    self.pos += 1;
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        'u' => out.push(self.unicode_escape()?),
                        other => out.push(other),
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn unicode_escape(&mut self) -> Result<char, ExpressionError> {
        let start = self.offset();
        let mut code = 0u32;
        for _ in 0..4 {
            let digit = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error(start, "invalid \\u escape"))?;
            code = code * 16 + digit;
            self.pos += 1;
        }
        char::from_u32(code).ok_or_else(|| self.error(start, "invalid \\u escape"))
    }

    fn word(&mut self) -> TokenKind {
        let start = self.offset();
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '$') {
            self.pos += 1;
        }
        match &self.source[start..self.offset()] {
            "true" => TokenKind::Boolean(true),
            "false" => TokenKind::Boolean(false),
            "null" => TokenKind::Null,
            "undefined" => TokenKind::Undefined,
            word => TokenKind::Identifier(word.to_string()),
        }
    }

    fn symbol(&mut self, c: char, offset: usize) -> Result<TokenKind, ExpressionError> {
        let next = self.peek_at(1);
        let next2 = self.peek_at(2);
        let (kind, width) = match (c, next, next2) {
            ('=', Some('='), Some('=')) => (TokenKind::Comparison(CompareOp::StrictEq), 3),
            ('=', Some('='), _) => (TokenKind::Comparison(CompareOp::Eq), 2),
            ('!', Some('='), Some('=')) => (TokenKind::Comparison(CompareOp::StrictNotEq), 3),
            ('!', Some('='), _) => (TokenKind::Comparison(CompareOp::NotEq), 2),
            ('!', _, _) => (TokenKind::Logical(LogicalOp::Not), 1),
            ('<', Some('='), _) => (TokenKind::Comparison(CompareOp::Le), 2),
            ('<', _, _) => (TokenKind::Comparison(CompareOp::Lt), 1),
            ('>', Some('='), _) => (TokenKind::Comparison(CompareOp::Ge), 2),
            ('>', _, _) => (TokenKind::Comparison(CompareOp::Gt), 1),
            ('&', Some('&'), _) => (TokenKind::Logical(LogicalOp::And), 2),
            ('|', Some('|'), _) => (TokenKind::Logical(LogicalOp::Or), 2),
            ('|', _, _) => (TokenKind::Pipe, 1),
            ('+', _, _) => (TokenKind::Operator(ArithOp::Add), 1),
            ('-', _, _) => (TokenKind::Operator(ArithOp::Sub), 1),
            ('*', _, _) => (TokenKind::Operator(ArithOp::Mul), 1),
            ('/', _, _) => (TokenKind::Operator(ArithOp::Div), 1),
            ('%', _, _) => (TokenKind::Operator(ArithOp::Mod), 1),
            ('.', _, _) => (TokenKind::Dot, 1),
            (',', _, _) => (TokenKind::Comma, 1),
            ('(', _, _) => (TokenKind::LParen, 1),
            (')', _, _) => (TokenKind::RParen, 1),
            ('[', _, _) => (TokenKind::LBracket, 1),
            (']', _, _) => (TokenKind::RBracket, 1),
            ('?', _, _) => (TokenKind::Question, 1),
            (':', _, _) => (TokenKind::Colon, 1),
            ('=', _, _) => return Err(self.error(offset, "assignment is not supported, use '=='")),
            _ => return Err(self.error(offset, format!("unexpected character '{c}'"))),
        };
        self.pos += width;
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(expr: &str) -> Vec<TokenKind> {
        tokenize(expr).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("42 3.5 1e3 2E-2"),
            vec![
                TokenKind::Number(42.0),
                TokenKind::Number(3.5),
                TokenKind::Number(1000.0),
                TokenKind::Number(0.02),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_strings_with_escapes() {
        assert_eq!(
            kinds(r#"'it\'s' "a\nb" "A""#),
            vec![
                TokenKind::Str("it's".into()),
                TokenKind::Str("a\nb".into()),
                TokenKind::Str("A".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("true false null undefined state $x _y"),
            vec![
                TokenKind::Boolean(true),
                TokenKind::Boolean(false),
                TokenKind::Null,
                TokenKind::Undefined,
                TokenKind::Identifier("state".into()),
                TokenKind::Identifier("$x".into()),
                TokenKind::Identifier("_y".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("=== !== == != <= >= && || ! |"),
            vec![
                TokenKind::Comparison(CompareOp::StrictEq),
                TokenKind::Comparison(CompareOp::StrictNotEq),
                TokenKind::Comparison(CompareOp::Eq),
                TokenKind::Comparison(CompareOp::NotEq),
                TokenKind::Comparison(CompareOp::Le),
                TokenKind::Comparison(CompareOp::Ge),
                TokenKind::Logical(LogicalOp::And),
                TokenKind::Logical(LogicalOp::Or),
                TokenKind::Logical(LogicalOp::Not),
                TokenKind::Pipe,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_offsets() {
        let tokens = tokenize("a  + 'b'").unwrap();
        assert_eq!(tokens[0].offset, 0);
        assert_eq!(tokens[1].offset, 3);
        assert_eq!(tokens[2].offset, 5);
        assert_eq!(tokens[3].offset, 8);
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = tokenize("'abc").unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { offset: 0, .. }));
    }

    #[test]
    fn test_single_equals_rejected() {
        let err = tokenize("a = 1").unwrap_err();
        assert!(err.to_string().contains("assignment"));
    }
}
