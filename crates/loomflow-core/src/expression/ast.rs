//! Typed syntax tree produced by the parser.

use super::lexer::{ArithOp, CompareOp};
use super::value::ExprValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Arith(ArithOp),
    Compare(CompareOp),
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(ExprValue),
    Identifier(String),
    /// `object.name`
    Property {
        object: Box<Expr>,
        name: String,
    },
    /// `object[index]`
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    /// `object.method(args)`
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    /// `input|name(args)`
    Transform {
        input: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    Array(Vec<Expr>),
}

impl Expr {
    /// Dotted state paths read by this expression, e.g. `state.items` for
    /// `state.items.length > 0`. Bracket access with a literal key extends
    /// the path; computed keys end it.
    pub fn referenced_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_paths(&self, out: &mut Vec<String>) {
        if let Some(path) = self.as_path() {
            out.push(path);
            if let Expr::Index { index, .. } = self {
                index.collect_paths(out);
            }
            return;
        }
        match self {
            Expr::Literal(_) | Expr::Identifier(_) => {}
            Expr::Property { object, .. } => object.collect_paths(out),
            Expr::Index { object, index } => {
                object.collect_paths(out);
                index.collect_paths(out);
            }
            Expr::Unary { operand, .. } => operand.collect_paths(out),
            Expr::Binary { left, right, .. } => {
                left.collect_paths(out);
                right.collect_paths(out);
            }
            Expr::Ternary {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.collect_paths(out);
                then_branch.collect_paths(out);
                else_branch.collect_paths(out);
            }
            Expr::MethodCall { object, args, .. } => {
                object.collect_paths(out);
                args.iter().for_each(|a| a.collect_paths(out));
            }
            Expr::Transform { input, args, .. } => {
                input.collect_paths(out);
                args.iter().for_each(|a| a.collect_paths(out));
            }
            Expr::Array(items) => items.iter().for_each(|a| a.collect_paths(out)),
        }
    }

    /// The dotted path for a pure access chain rooted at an identifier.
    fn as_path(&self) -> Option<String> {
        match self {
            Expr::Identifier(name) => Some(name.clone()),
            Expr::Property { object, name } => object.as_path().map(|p| format!("{p}.{name}")),
            Expr::Index { object, index } => {
                let base = object.as_path()?;
                match index.as_ref() {
                    Expr::Literal(ExprValue::String(key)) => Some(format!("{base}.{key}")),
                    Expr::Literal(ExprValue::Number(n)) => Some(format!("{base}.{n}")),
                    _ => Some(base),
                }
            }
            _ => None,
        }
    }
}
