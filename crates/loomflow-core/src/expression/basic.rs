//! Restricted evaluator working directly on the token stream.
//!
//! Covers literals, identifiers, dot/bracket access, unary, arithmetic,
//! comparison, logical and ternary operators. Method calls, transforms and
//! array literals are rejected with [`ExpressionError::Unsupported`]. No AST is
//! built; every sub-expression is evaluated as it is parsed.

use serde_json::Value;

use super::ast::BinaryOp;
use super::interpreter::apply_binary;
use super::lexer::{ArithOp, CompareOp, LogicalOp, Token, TokenKind, tokenize};
use super::parser::describe;
use super::value::{ExprValue, Place};
use super::{Evaluator, ExpressionError};

#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEvaluator;

impl BasicEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for BasicEvaluator {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn evaluate(&self, expression: &str, context: &Value) -> Result<ExprValue, ExpressionError> {
        let tokens = tokenize(expression)?;
        let mut run = Run {
            expression,
            tokens,
            pos: 0,
            context,
        };
        let value = run.ternary()?;
        match run.peek() {
            TokenKind::Eof => Ok(value),
            other => Err(run.error(format!("unexpected {}", describe(other)))),
        }
    }
}

struct Run<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    context: &'a Value,
}

impl<'a> Run<'a> {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        if matches!(self.peek(), TokenKind::Eof) {
            return ExpressionError::UnexpectedEnd {
                expression: self.expression.to_string(),
            };
        }
        ExpressionError::Syntax {
            expression: self.expression.to_string(),
            offset: self.tokens[self.pos].offset,
            message: message.into(),
        }
    }

    fn unsupported(&self, feature: &str) -> ExpressionError {
        ExpressionError::Unsupported {
            evaluator: "basic",
            feature: feature.to_string(),
            expression: self.expression.to_string(),
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), ExpressionError> {
        if *self.peek() == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}, found {}", describe(self.peek()))))
        }
    }

    fn ternary(&mut self) -> Result<ExprValue, ExpressionError> {
        let condition = self.binary_level(0)?;
        if *self.peek() != TokenKind::Question {
            return Ok(condition);
        }
        self.advance();
        let then_value = self.ternary()?;
        self.expect(TokenKind::Colon, "':' in ternary")?;
        let else_value = self.ternary()?;
        Ok(if condition.truthy() {
            then_value
        } else {
            else_value
        })
    }

    /// Precedence climbing over the binary levels, loosest first.
    fn binary_level(&mut self, level: usize) -> Result<ExprValue, ExpressionError> {
        const LEVELS: usize = 6;
        if level == LEVELS {
            return self.unary();
        }
        let mut left = self.binary_level(level + 1)?;
        while let Some(op) = binary_op_at(self.peek(), level) {
            self.advance();
            let right = self.binary_level(level + 1)?;
            left = apply_binary(op, &left, &right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<ExprValue, ExpressionError> {
        match self.peek() {
            TokenKind::Logical(LogicalOp::Not) => {
                self.advance();
                Ok(ExprValue::Bool(!self.unary()?.truthy()))
            }
            TokenKind::Operator(ArithOp::Sub) => {
                self.advance();
                Ok(ExprValue::Number(-self.unary()?.to_number()))
            }
            TokenKind::Operator(ArithOp::Add) => {
                self.advance();
                Ok(ExprValue::Number(self.unary()?.to_number()))
            }
            _ => self.access(),
        }
    }

    fn access(&mut self) -> Result<ExprValue, ExpressionError> {
        let mut place = self.primary()?;
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        TokenKind::Identifier(name) => name,
                        other => {
                            self.pos -= 1;
                            return Err(self.error(format!(
                                "expected property name after '.', found {}",
                                describe(&other)
                            )));
                        }
                    };
                    if *self.peek() == TokenKind::LParen {
                        return Err(self.unsupported(&format!("method call '{name}()'")));
                    }
                    place = place.property(&name);
                }
                TokenKind::LBracket => {
                    self.advance();
                    let key = self.ternary()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    place = place.index(&key);
                }
                TokenKind::Pipe => return Err(self.unsupported("transform")),
                _ => return Ok(place.into_value()),
            }
        }
    }

    fn primary(&mut self) -> Result<Place<'a>, ExpressionError> {
        let value = match self.peek().clone() {
            TokenKind::Number(n) => ExprValue::Number(n),
            TokenKind::Str(s) => ExprValue::String(s),
            TokenKind::Boolean(b) => ExprValue::Bool(b),
            TokenKind::Null => ExprValue::Null,
            TokenKind::Undefined => ExprValue::Undefined,
            TokenKind::Identifier(name) => {
                self.advance();
                return Ok(Place::root(self.context, &name));
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.ternary()?;
                self.expect(TokenKind::RParen, "')'")?;
                return Ok(Place::Owned(inner));
            }
            TokenKind::LBracket => return Err(self.unsupported("array literal")),
            other => return Err(self.error(format!("unexpected {}", describe(&other)))),
        };
        self.advance();
        Ok(Place::Owned(value))
    }
}

/// Operator accepted at a precedence level: `||`, `&&`, equality,
/// relational, additive, multiplicative.
fn binary_op_at(kind: &TokenKind, level: usize) -> Option<BinaryOp> {
    match (level, kind) {
        (0, TokenKind::Logical(LogicalOp::Or)) => Some(BinaryOp::Or),
        (1, TokenKind::Logical(LogicalOp::And)) => Some(BinaryOp::And),
        (
            2,
            TokenKind::Comparison(
                op @ (CompareOp::Eq | CompareOp::NotEq | CompareOp::StrictEq | CompareOp::StrictNotEq),
            ),
        ) => Some(BinaryOp::Compare(*op)),
        (3, TokenKind::Comparison(op @ (CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge))) => {
            Some(BinaryOp::Compare(*op))
        }
        (4, TokenKind::Operator(op @ (ArithOp::Add | ArithOp::Sub))) => Some(BinaryOp::Arith(*op)),
        (5, TokenKind::Operator(op @ (ArithOp::Mul | ArithOp::Div | ArithOp::Mod))) => {
            Some(BinaryOp::Arith(*op))
        }
        _ => None,
    }
}
