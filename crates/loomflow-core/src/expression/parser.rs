//! Recursive-descent parser.
//!
//! Precedence, loosest first: ternary, `||`, `&&`, equality, relational,
//! additive, multiplicative, unary, postfix (`.name`, `[index]`, method call,
//! `|transform`), primary.

use super::ExpressionError;
use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::{ArithOp, CompareOp, LogicalOp, Token, TokenKind, tokenize};
use super::value::ExprValue;

/// Parse an expression into an AST.
pub fn parse(expression: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        expression,
        tokens,
        pos: 0,
    };
    let expr = parser.ternary()?;
    match parser.peek() {
        TokenKind::Eof => Ok(expr),
        other => Err(parser.error(format!("unexpected {}", describe(other)))),
    }
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
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

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].offset
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        if matches!(self.peek(), TokenKind::Eof) {
            return ExpressionError::UnexpectedEnd {
                expression: self.expression.to_string(),
            };
        }
        ExpressionError::Syntax {
            expression: self.expression.to_string(),
            offset: self.offset(),
            message: message.into(),
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

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        let condition = self.or()?;
        if *self.peek() != TokenKind::Question {
            return Ok(condition);
        }
        self.advance();
        let then_branch = self.ternary()?;
        self.expect(TokenKind::Colon, "':' in ternary")?;
        let else_branch = self.ternary()?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        })
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while *self.peek() == TokenKind::Logical(LogicalOp::Or) {
            self.advance();
            let right = self.and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.equality()?;
        while *self.peek() == TokenKind::Logical(LogicalOp::And) {
            self.advance();
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.comparison()?;
        while let TokenKind::Comparison(
            op @ (CompareOp::Eq | CompareOp::NotEq | CompareOp::StrictEq | CompareOp::StrictNotEq),
        ) = *self.peek()
        {
            self.advance();
            let right = self.comparison()?;
            left = binary(BinaryOp::Compare(op), left, right);
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.additive()?;
        while let TokenKind::Comparison(
            op @ (CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge),
        ) = *self.peek()
        {
            self.advance();
            let right = self.additive()?;
            left = binary(BinaryOp::Compare(op), left, right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.multiplicative()?;
        while let TokenKind::Operator(op @ (ArithOp::Add | ArithOp::Sub)) = *self.peek() {
            self.advance();
            let right = self.multiplicative()?;
            left = binary(BinaryOp::Arith(op), left, right);
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        while let TokenKind::Operator(op @ (ArithOp::Mul | ArithOp::Div | ArithOp::Mod)) =
            *self.peek()
        {
            self.advance();
            let right = self.unary()?;
            left = binary(BinaryOp::Arith(op), left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = match self.peek() {
            TokenKind::Logical(LogicalOp::Not) => UnaryOp::Not,
            TokenKind::Operator(ArithOp::Sub) => UnaryOp::Neg,
            TokenKind::Operator(ArithOp::Add) => UnaryOp::Plus,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.identifier("property name after '.'")?;
                    if *self.peek() == TokenKind::LParen {
                        let args = self.arguments()?;
                        expr = Expr::MethodCall {
                            object: Box::new(expr),
                            method: name,
                            args,
                        };
                    } else {
                        expr = Expr::Property {
                            object: Box::new(expr),
                            name,
                        };
                    }
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.ternary()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                TokenKind::Pipe => {
                    self.advance();
                    let name = self.identifier("transform name after '|'")?;
                    let args = if *self.peek() == TokenKind::LParen {
                        self.arguments()?
                    } else {
                        Vec::new()
                    };
                    expr = Expr::Transform {
                        input: Box::new(expr),
                        name,
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn identifier(&mut self, what: &str) -> Result<String, ExpressionError> {
        match self.peek().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected {what}, found {}", describe(&other)))),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if *self.peek() != TokenKind::RParen {
            loop {
                args.push(self.ternary()?);
                if *self.peek() == TokenKind::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Literal(ExprValue::Number(n)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal(ExprValue::String(s)))
            }
            TokenKind::Boolean(b) => {
                self.advance();
                Ok(Expr::Literal(ExprValue::Bool(b)))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal(ExprValue::Null))
            }
            TokenKind::Undefined => {
                self.advance();
                Ok(Expr::Literal(ExprValue::Undefined))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::Identifier(name))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.ternary()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if *self.peek() != TokenKind::RBracket {
                    loop {
                        items.push(self.ternary()?);
                        if *self.peek() == TokenKind::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            other => Err(self.error(format!("unexpected {}", describe(&other)))),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

pub(crate) fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Number(n) => format!("number {n}"),
        TokenKind::Str(s) => format!("string {s:?}"),
        TokenKind::Boolean(b) => format!("'{b}'"),
        TokenKind::Null => "'null'".to_string(),
        TokenKind::Undefined => "'undefined'".to_string(),
        TokenKind::Identifier(name) => format!("identifier '{name}'"),
        TokenKind::Operator(_) | TokenKind::Comparison(_) | TokenKind::Logical(_) => {
            "operator".to_string()
        }
        TokenKind::Dot => "'.'".to_string(),
        TokenKind::Comma => "','".to_string(),
        TokenKind::LParen => "'('".to_string(),
        TokenKind::RParen => "')'".to_string(),
        TokenKind::LBracket => "'['".to_string(),
        TokenKind::RBracket => "']'".to_string(),
        TokenKind::Question => "'?'".to_string(),
        TokenKind::Colon => "':'".to_string(),
        TokenKind::Pipe => "'|'".to_string(),
        TokenKind::Eof => "end of expression".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Expr {
        Expr::Literal(ExprValue::Number(n))
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Arith(ArithOp::Add),
                num(1.0),
                binary(BinaryOp::Arith(ArithOp::Mul), num(2.0), num(3.0))
            )
        );
    }

    #[test]
    fn test_ternary_is_right_associative() {
        let expr = parse("a ? 1 : b ? 2 : 3").unwrap();
        match expr {
            Expr::Ternary { else_branch, .. } => {
                assert!(matches!(*else_branch, Expr::Ternary { .. }));
            }
            other => panic!("expected ternary, got {other:?}"),
        }
    }

    #[test]
    fn test_property_and_index_chain() {
        let expr = parse("state.items[0].name").unwrap();
        assert_eq!(expr.referenced_paths(), vec!["state.items.0.name".to_string()]);
    }

    #[test]
    fn test_method_call_and_transform() {
        let expr = parse("inputs.name.toUpperCase() | trim").unwrap();
        match expr {
            Expr::Transform { input, name, args } => {
                assert_eq!(name, "trim");
                assert!(args.is_empty());
                assert!(matches!(*input, Expr::MethodCall { .. }));
            }
            other => panic!("expected transform, got {other:?}"),
        }
    }

    #[test]
    fn test_referenced_paths_collects_all_operands() {
        let expr = parse("state.count > inputs.limit && !computed.done").unwrap();
        assert_eq!(
            expr.referenced_paths(),
            vec![
                "computed.done".to_string(),
                "inputs.limit".to_string(),
                "state.count".to_string()
            ]
        );
    }

    #[test]
    fn test_unexpected_end() {
        assert!(matches!(
            parse("1 +").unwrap_err(),
            ExpressionError::UnexpectedEnd { .. }
        ));
        assert!(matches!(
            parse("").unwrap_err(),
            ExpressionError::UnexpectedEnd { .. }
        ));
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        let err = parse("1 2").unwrap_err();
        match err {
            ExpressionError::Syntax { offset, .. } => assert_eq!(offset, 2),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_unbalanced_paren() {
        assert!(parse("(1 + 2").is_err());
        assert!(parse("a[1").is_err());
    }
}
