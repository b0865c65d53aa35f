//! State store wire types: snapshots, update operations and their results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Point-in-time copy of a workflow's three state tiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Inputs supplied at `start`; immutable afterwards.
    pub raw: Map<String, Value>,
    /// Mutable state, written only through update operations.
    pub state: Map<String, Value>,
    /// Derived values.
    pub computed: Map<String, Value>,
}

impl StateSnapshot {
    /// Expression context exposing every tier. `inputs` aliases `raw`.
    pub fn to_context(&self) -> Value {
        json!({
            "raw": self.raw,
            "inputs": self.raw,
            "state": self.state,
            "computed": self.computed,
        })
    }
}

/// What an update operation does at its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    #[default]
    Set,
    /// Push onto an array, creating it when absent.
    Append,
    /// Add a number (default 1), starting from 0 when absent.
    Increment,
    /// Deep-merge an object regardless of the store's conflict policy.
    Merge,
}

/// `{ path, value, operation? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOperation {
    pub path: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub operation: UpdateKind,
}

impl UpdateOperation {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
            operation: UpdateKind::Set,
        }
    }

    pub fn append(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
            operation: UpdateKind::Append,
        }
    }

    pub fn increment(path: impl Into<String>, by: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            value: by.into(),
            operation: UpdateKind::Increment,
        }
    }

    pub fn merge(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
            operation: UpdateKind::Merge,
        }
    }
}

/// Result of an atomic update batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub success: bool,
    /// Number of operations applied.
    pub applied: usize,
    /// Computed fields recomputed, in evaluation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recomputed: Vec<String>,
    /// Path -> value after the batch, for every written and recomputed path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state_updates: BTreeMap<String, Value>,
    /// Write version of each touched top-level state key after the batch.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub versions: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_operation_defaults_to_set() {
        let op: UpdateOperation =
            serde_json::from_value(json!({"path": "state.x", "value": 1})).unwrap();
        assert_eq!(op, UpdateOperation::set("state.x", json!(1)));
    }

    #[test]
    fn test_update_operation_kinds_parse() {
        let op: UpdateOperation =
            serde_json::from_value(json!({"path": "state.n", "operation": "increment"})).unwrap();
        assert_eq!(op.operation, UpdateKind::Increment);
        assert!(op.value.is_null());
    }

    #[test]
    fn test_snapshot_context_aliases_inputs() {
        let mut snapshot = StateSnapshot::default();
        snapshot.raw.insert("name".into(), json!("demo"));
        let ctx = snapshot.to_context();
        assert_eq!(ctx["inputs"]["name"], "demo");
        assert_eq!(ctx["raw"]["name"], "demo");
        assert!(ctx["state"].as_object().unwrap().is_empty());
    }
}
