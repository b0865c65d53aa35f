//! Embedded expression language.
//!
//! A JavaScript expression subset used by step conditions, loop collections,
//! computed-field transforms and `{{ }}` templates:
//!
//! - `lexer` -- tokenizer shared by both evaluators
//! - `parser` / `ast` -- recursive-descent parser producing a typed AST
//! - `interpreter` -- [`ExpressionEngine`], the full tree-walking evaluator
//! - `basic` -- [`BasicEvaluator`], the restricted token-level fallback
//! - `value` -- [`ExprValue`] and JS coercion rules
//! - `template` -- `{{ expr }}` interpolation over JSON values
//!
//! **Security note:** runtime data is always passed as the evaluation
//! context, never spliced into expression text.

pub mod ast;
pub mod basic;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod template;
pub mod value;

use std::sync::Arc;

use loomflow_types::config::EvaluatorMode;
use serde_json::Value;

pub use basic::BasicEvaluator;
pub use interpreter::ExpressionEngine;
pub use value::ExprValue;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error at offset {offset} in '{expression}': {message}")]
    Syntax {
        expression: String,
        offset: usize,
        message: String,
    },

    #[error("unexpected end of expression '{expression}'")]
    UnexpectedEnd { expression: String },

    #[error("{feature} is not supported by the {evaluator} evaluator (in '{expression}')")]
    Unsupported {
        evaluator: &'static str,
        feature: String,
        expression: String,
    },

    #[error("unknown transform '{name}'{}", did_you_mean(.suggestion))]
    UnknownTransform {
        name: String,
        suggestion: Option<String>,
    },

    #[error("unknown method '{name}' on {target}")]
    UnknownMethod { name: String, target: &'static str },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(", did you mean '{s}'?"))
        .unwrap_or_default()
}

impl ExpressionError {
    pub fn code(&self) -> &'static str {
        match self {
            ExpressionError::Syntax { .. } => "EXPRESSION_SYNTAX",
            ExpressionError::UnexpectedEnd { .. } => "EXPRESSION_UNEXPECTED_END",
            ExpressionError::Unsupported { .. } => "EXPRESSION_UNSUPPORTED",
            ExpressionError::UnknownTransform { .. } => "EXPRESSION_UNKNOWN_TRANSFORM",
            ExpressionError::UnknownMethod { .. } => "EXPRESSION_UNKNOWN_METHOD",
            ExpressionError::InvalidContext(_) => "EXPRESSION_INVALID_CONTEXT",
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator interface
// ---------------------------------------------------------------------------

/// One expression language, two implementations selected by
/// [`EvaluatorMode`].
///
/// Missing identifiers resolve to `undefined` rather than failing, so
/// partially populated contexts evaluate cleanly.
pub trait Evaluator: Send + Sync + std::fmt::Debug {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    fn evaluate(&self, expression: &str, context: &Value) -> Result<ExprValue, ExpressionError>;

    /// Evaluate and convert the result to JSON. Non-finite numbers become
    /// `null`, see [`ExprValue::to_json`].
    fn evaluate_json(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        Ok(self.evaluate(expression, context)?.to_json())
    }

    /// Evaluate and apply JS truthiness.
    fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        Ok(self.evaluate(expression, context)?.truthy())
    }
}

/// Build the evaluator for a configured mode.
pub fn evaluator_for(mode: EvaluatorMode) -> Arc<dyn Evaluator> {
    match mode {
        EvaluatorMode::Full => Arc::new(ExpressionEngine::new()),
        EvaluatorMode::Basic => Arc::new(BasicEvaluator::new()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
