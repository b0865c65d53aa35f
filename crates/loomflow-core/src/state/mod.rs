//! Three-tier reactive state.
//!
//! - `path` -- typed [`StatePath`] parsing and navigation
//! - `graph` -- [`ComputedGraph`], the compiled computed-field DAG
//! - `store` -- [`StateStore`], atomic batched updates with affected-only
//!   recomputation and path-scoped write locking

pub mod graph;
pub mod path;
pub mod store;

pub use graph::ComputedGraph;
pub use path::{Scope, Segment, StatePath};
pub use store::StateStore;

use crate::expression::ExpressionError;

/// Structural state errors. Never retried; a failing batch leaves state
/// untouched.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateError {
    #[error("circular dependency among computed fields: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("computed field '{field}' depends on unknown field '{reference}'{}", hint(.suggestion))]
    UnknownDependency {
        field: String,
        reference: String,
        suggestion: Option<String>,
    },

    #[error("invalid path '{path}': {reason}{}", hint(.suggestion))]
    InvalidPath {
        path: String,
        reason: String,
        suggestion: Option<String>,
    },

    #[error("cannot {operation} at '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        operation: String,
        expected: &'static str,
        found: String,
    },

    #[error("computed field '{field}' failed to evaluate: {source}")]
    Computation {
        field: String,
        #[source]
        source: ExpressionError,
    },
}

fn hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{s}'?)"))
        .unwrap_or_default()
}

impl StateError {
    pub fn code(&self) -> &'static str {
        match self {
            StateError::CircularDependency { .. } => "CIRCULAR_DEPENDENCY",
            StateError::UnknownDependency { .. } => "UNKNOWN_DEPENDENCY",
            StateError::InvalidPath { .. } => "INVALID_PATH",
            StateError::TypeMismatch { .. } => "TYPE_MISMATCH",
            StateError::Computation { .. } => "COMPUTED_FIELD_FAILED",
        }
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StateError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
            suggestion: None,
        }
    }
}

pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
