//! Tree-walking interpreter over the parsed AST.
//!
//! Registered transforms (`value|name(args)`):
//! - String: `lower`, `upper`, `trim`, `split`, `startsWith`, `endsWith`
//! - Collection: `length`, `contains`, `keys`, `first`, `last`, `join`
//! - Conversion: `not`, `number`, `string`, `default`

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::{ArithOp, CompareOp};
use super::parser::parse;
use super::value::{ExprValue, Place, format_number};
use super::{Evaluator, ExpressionError};
use crate::suggest::closest_match;

const TRANSFORMS: &[&str] = &[
    "lower",
    "upper",
    "trim",
    "split",
    "startsWith",
    "endsWith",
    "length",
    "contains",
    "keys",
    "first",
    "last",
    "join",
    "not",
    "number",
    "string",
    "default",
];

/// The full evaluator: parser, typed AST and interpreter, with a parse cache
/// keyed by expression text.
#[derive(Debug, Default)]
pub struct ExpressionEngine {
    cache: DashMap<String, Arc<Expr>>,
}

impl ExpressionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse (or fetch from cache) an expression.
    pub fn compile(&self, expression: &str) -> Result<Arc<Expr>, ExpressionError> {
        if let Some(expr) = self.cache.get(expression) {
            return Ok(Arc::clone(expr.value()));
        }
        let expr = Arc::new(parse(expression)?);
        self.cache.insert(expression.to_string(), Arc::clone(&expr));
        Ok(expr)
    }

    /// Evaluate an already-parsed expression.
    pub fn eval(&self, expr: &Expr, context: &Value) -> Result<ExprValue, ExpressionError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Identifier(_) | Expr::Property { .. } | Expr::Index { .. } => {
                Ok(self.place(expr, context)?.into_value())
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, context)?;
                Ok(match op {
                    UnaryOp::Not => ExprValue::Bool(!value.truthy()),
                    UnaryOp::Neg => ExprValue::Number(-value.to_number()),
                    UnaryOp::Plus => ExprValue::Number(value.to_number()),
                })
            }
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                let left = self.eval(left, context)?;
                if left.truthy() {
                    self.eval(right, context)
                } else {
                    Ok(left)
                }
            }
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                let left = self.eval(left, context)?;
                if left.truthy() {
                    Ok(left)
                } else {
                    self.eval(right, context)
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, context)?;
                let right = self.eval(right, context)?;
                Ok(apply_binary(*op, &left, &right))
            }
            Expr::Ternary {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval(condition, context)?.truthy() {
                    self.eval(then_branch, context)
                } else {
                    self.eval(else_branch, context)
                }
            }
            Expr::MethodCall {
                object,
                method,
                args,
            } => {
                let target = self.eval(object, context)?;
                let args = self.eval_all(args, context)?;
                call_method(&target, method, &args)
            }
            Expr::Transform { input, name, args } => {
                let input = self.eval(input, context)?;
                let args = self.eval_all(args, context)?;
                apply_transform(&input, name, &args)
            }
            Expr::Array(items) => Ok(ExprValue::Array(self.eval_all(items, context)?)),
        }
    }

    fn eval_all(&self, exprs: &[Expr], context: &Value) -> Result<Vec<ExprValue>, ExpressionError> {
        exprs.iter().map(|e| self.eval(e, context)).collect()
    }

    fn place<'a>(&self, expr: &Expr, context: &'a Value) -> Result<Place<'a>, ExpressionError> {
        match expr {
            Expr::Identifier(name) => Ok(Place::root(context, name)),
            Expr::Property { object, name } => Ok(self.place(object, context)?.property(name)),
            Expr::Index { object, index } => {
                let key = self.eval(index, context)?;
                Ok(self.place(object, context)?.index(&key))
            }
            other => Ok(Place::Owned(self.eval(other, context)?)),
        }
    }
}

impl Evaluator for ExpressionEngine {
    fn name(&self) -> &'static str {
        "full"
    }

    fn evaluate(&self, expression: &str, context: &Value) -> Result<ExprValue, ExpressionError> {
        let expr = self.compile(expression)?;
        self.eval(&expr, context)
    }
}

pub(crate) fn apply_binary(op: BinaryOp, left: &ExprValue, right: &ExprValue) -> ExprValue {
    match op {
        BinaryOp::Arith(ArithOp::Add) => left.add(right),
        BinaryOp::Arith(ArithOp::Sub) => ExprValue::Number(left.to_number() - right.to_number()),
        BinaryOp::Arith(ArithOp::Mul) => ExprValue::Number(left.to_number() * right.to_number()),
        BinaryOp::Arith(ArithOp::Div) => ExprValue::Number(left.to_number() / right.to_number()),
        BinaryOp::Arith(ArithOp::Mod) => ExprValue::Number(left.to_number() % right.to_number()),
        BinaryOp::Compare(cmp) => ExprValue::Bool(compare(cmp, left, right)),
        BinaryOp::And => {
            if left.truthy() {
                right.clone()
            } else {
                left.clone()
            }
        }
        BinaryOp::Or => {
            if left.truthy() {
                left.clone()
            } else {
                right.clone()
            }
        }
    }
}

fn compare(op: CompareOp, left: &ExprValue, right: &ExprValue) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CompareOp::Eq => left.loose_eq(right),
        CompareOp::NotEq => !left.loose_eq(right),
        CompareOp::StrictEq => left.strict_eq(right),
        CompareOp::StrictNotEq => !left.strict_eq(right),
        CompareOp::Lt => left.compare(right) == Some(Less),
        CompareOp::Le => matches!(left.compare(right), Some(Less | Equal)),
        CompareOp::Gt => left.compare(right) == Some(Greater),
        CompareOp::Ge => matches!(left.compare(right), Some(Greater | Equal)),
    }
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

fn arg_string(args: &[ExprValue], i: usize) -> Option<String> {
    args.get(i)
        .filter(|v| !v.is_nullish())
        .map(ExprValue::to_display_string)
}

/// JS `slice` bounds: negative indices count from the end.
fn slice_bounds(args: &[ExprValue], len: usize) -> (usize, usize) {
    let resolve = |v: Option<&ExprValue>, default: usize| -> usize {
        match v.filter(|v| !v.is_nullish()) {
            None => default,
            Some(v) => {
                let n = v.to_number();
                if n.is_nan() {
                    0
                } else if n < 0.0 {
                    len.saturating_sub((-n) as usize)
                } else {
                    (n as usize).min(len)
                }
            }
        }
    };
    let start = resolve(args.first(), 0);
    let end = resolve(args.get(1), len);
    (start, end.max(start))
}

fn call_method(
    target: &ExprValue,
    method: &str,
    args: &[ExprValue],
) -> Result<ExprValue, ExpressionError> {
    match target {
        ExprValue::String(s) => string_method(s, method, args),
        ExprValue::Array(items) => array_method(items, method, args),
        ExprValue::Number(n) => match method {
            "toFixed" => {
                let digits = args.first().map(|d| d.to_number() as usize).unwrap_or(0);
                Ok(ExprValue::String(format!("{n:.digits$}")))
            }
            "toString" => Ok(ExprValue::String(format_number(*n))),
            _ => Err(unknown_method(method, target)),
        },
        _ => Err(unknown_method(method, target)),
    }
}

fn string_method(s: &str, method: &str, args: &[ExprValue]) -> Result<ExprValue, ExpressionError> {
    let needle = arg_string(args, 0).unwrap_or_default();
    Ok(match method {
        "includes" => ExprValue::Bool(s.contains(&needle)),
        "startsWith" => ExprValue::Bool(s.starts_with(&needle)),
        "endsWith" => ExprValue::Bool(s.ends_with(&needle)),
        "indexOf" => ExprValue::Number(
            s.find(&needle)
                .map(|byte| s[..byte].chars().count() as f64)
                .unwrap_or(-1.0),
        ),
        "toUpperCase" => ExprValue::String(s.to_uppercase()),
        "toLowerCase" => ExprValue::String(s.to_lowercase()),
        "trim" => ExprValue::String(s.trim().to_string()),
        "toString" => ExprValue::String(s.to_string()),
        "split" => {
            let parts: Vec<ExprValue> = match arg_string(args, 0) {
                None => vec![ExprValue::String(s.to_string())],
                Some(sep) if sep.is_empty() => {
                    s.chars().map(|c| ExprValue::String(c.to_string())).collect()
                }
                Some(sep) => s
                    .split(sep.as_str())
                    .map(|p| ExprValue::String(p.to_string()))
                    .collect(),
            };
            ExprValue::Array(parts)
        }
        "replace" => {
            let with = arg_string(args, 1).unwrap_or_default();
            ExprValue::String(s.replacen(&needle, &with, 1))
        }
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = slice_bounds(args, chars.len());
            ExprValue::String(chars[start..end].iter().collect())
        }
        _ => return Err(unknown_method(method, &ExprValue::String(s.to_string()))),
    })
}

fn array_method(
    items: &[ExprValue],
    method: &str,
    args: &[ExprValue],
) -> Result<ExprValue, ExpressionError> {
    let needle = args.first().cloned().unwrap_or(ExprValue::Undefined);
    Ok(match method {
        "includes" => ExprValue::Bool(items.iter().any(|v| v.strict_eq(&needle))),
        "indexOf" => ExprValue::Number(
            items
                .iter()
                .position(|v| v.strict_eq(&needle))
                .map(|i| i as f64)
                .unwrap_or(-1.0),
        ),
        "join" => {
            let sep = arg_string(args, 0).unwrap_or_else(|| ",".to_string());
            ExprValue::String(
                items
                    .iter()
                    .map(ExprValue::to_display_string)
                    .collect::<Vec<_>>()
                    .join(&sep),
            )
        }
        "slice" => {
            let (start, end) = slice_bounds(args, items.len());
            ExprValue::Array(items[start..end].to_vec())
        }
        "toString" => ExprValue::String(ExprValue::Array(items.to_vec()).to_display_string()),
        _ => return Err(unknown_method(method, &ExprValue::Array(Vec::new()))),
    })
}

fn unknown_method(method: &str, target: &ExprValue) -> ExpressionError {
    ExpressionError::UnknownMethod {
        name: method.to_string(),
        target: target.type_name(),
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

fn apply_transform(
    input: &ExprValue,
    name: &str,
    args: &[ExprValue],
) -> Result<ExprValue, ExpressionError> {
    let text = || input.to_display_string();
    Ok(match name {
        "lower" => ExprValue::String(text().to_lowercase()),
        "upper" => ExprValue::String(text().to_uppercase()),
        "trim" => ExprValue::String(text().trim().to_string()),
        "split" => {
            let sep = arg_string(args, 0).unwrap_or_else(|| ",".to_string());
            ExprValue::Array(
                text()
                    .split(sep.as_str())
                    .map(|p| ExprValue::String(p.to_string()))
                    .collect(),
            )
        }
        "startsWith" => {
            ExprValue::Bool(text().starts_with(&arg_string(args, 0).unwrap_or_default()))
        }
        "endsWith" => ExprValue::Bool(text().ends_with(&arg_string(args, 0).unwrap_or_default())),
        "length" => match input {
            ExprValue::Array(items) => ExprValue::Number(items.len() as f64),
            ExprValue::Object(map) => ExprValue::Number(map.len() as f64),
            ExprValue::String(s) => ExprValue::Number(s.chars().count() as f64),
            _ => ExprValue::Number(0.0),
        },
        "contains" => {
            let probe = args.first().cloned().unwrap_or(ExprValue::Undefined);
            match input {
                ExprValue::Array(items) => ExprValue::Bool(items.iter().any(|v| v.loose_eq(&probe))),
                ExprValue::Object(map) => {
                    ExprValue::Bool(map.contains_key(&probe.to_display_string()))
                }
                ExprValue::String(s) => ExprValue::Bool(s.contains(&probe.to_display_string())),
                _ => ExprValue::Bool(false),
            }
        }
        "keys" => match input {
            ExprValue::Object(map) => {
                ExprValue::Array(map.keys().cloned().map(ExprValue::String).collect())
            }
            _ => ExprValue::Array(Vec::new()),
        },
        "first" => match input {
            ExprValue::Array(items) => items.first().cloned().unwrap_or(ExprValue::Undefined),
            _ => ExprValue::Undefined,
        },
        "last" => match input {
            ExprValue::Array(items) => items.last().cloned().unwrap_or(ExprValue::Undefined),
            _ => ExprValue::Undefined,
        },
        "join" => match input {
            ExprValue::Array(items) => array_method(items, "join", args)?,
            other => ExprValue::String(other.to_display_string()),
        },
        "not" => ExprValue::Bool(!input.truthy()),
        "number" => ExprValue::Number(input.to_number()),
        "string" => ExprValue::String(text()),
        "default" => {
            if input.is_nullish() {
                args.first().cloned().unwrap_or(ExprValue::Null)
            } else {
                input.clone()
            }
        }
        _ => {
            return Err(ExpressionError::UnknownTransform {
                name: name.to_string(),
                suggestion: closest_match(name, TRANSFORMS.iter().copied()),
            });
        }
    })
}
