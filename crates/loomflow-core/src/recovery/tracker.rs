//! Append-only error history.
//!
//! Entries are never removed while their workflow instance is registered;
//! the only mutation is flipping `recovered` on an entry whose action allows
//! it.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use loomflow_types::error::WorkflowError;
use serde::Serialize;
use uuid::Uuid;

use super::RecoveryAction;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedError {
    pub error: WorkflowError,
    pub action: RecoveryAction,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ErrorTracker {
    entries: RwLock<Vec<TrackedError>>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handled error. Fallbacks count as recovered immediately.
    pub fn record(&self, mut error: WorkflowError, action: RecoveryAction) -> Uuid {
        if action == RecoveryAction::Fallback {
            error.recovered = true;
        }
        let id = error.id;
        self.entries
            .write()
            .expect("error history lock poisoned")
            .push(TrackedError {
                error,
                action,
                recorded_at: Utc::now(),
            });
        id
    }

    /// Mark one error recovered. Returns false for unknown ids and for
    /// actions that never recover (`fail`, open circuits).
    pub fn mark_recovered(&self, error_id: Uuid) -> bool {
        let mut entries = self.entries.write().expect("error history lock poisoned");
        match entries.iter_mut().find(|e| e.error.id == error_id) {
            Some(entry) if entry.action.is_recoverable() => {
                entry.error.recovered = true;
                true
            }
            _ => false,
        }
    }

    /// Mark every pending retry/continue error of a step recovered after the
    /// step succeeded. Returns how many entries changed.
    pub fn mark_step_recovered(&self, workflow_id: Uuid, step_id: &str) -> usize {
        let mut entries = self.entries.write().expect("error history lock poisoned");
        let mut marked = 0;
        for entry in entries.iter_mut().filter(|e| {
            e.error.workflow_id == workflow_id
                && e.error.step_id == step_id
                && !e.error.recovered
                && matches!(e.action, RecoveryAction::Retry | RecoveryAction::Continue)
        }) {
            entry.error.recovered = true;
            marked += 1;
        }
        marked
    }

    pub fn history(&self) -> Vec<TrackedError> {
        self.entries.read().expect("error history lock poisoned").clone()
    }

    pub fn errors_for_workflow(&self, workflow_id: Uuid) -> Vec<TrackedError> {
        self.filtered(|e| e.error.workflow_id == workflow_id)
    }

    pub fn count_for_workflow(&self, workflow_id: Uuid) -> usize {
        self.entries
            .read()
            .expect("error history lock poisoned")
            .iter()
            .filter(|e| e.error.workflow_id == workflow_id)
            .count()
    }

    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        let entries = self.entries.read().expect("error history lock poisoned");
        let mut counts = BTreeMap::new();
        for entry in entries.iter() {
            *counts.entry(entry.error.error_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Errors that occurred in `[since, until)`.
    pub fn in_window(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<TrackedError> {
        self.filtered(|e| e.error.occurred_at >= since && e.error.occurred_at < until)
    }

    /// Most frequent error types, ties broken by name.
    pub fn top_error_types(&self, n: usize) -> Vec<(String, usize)> {
        let mut counts: Vec<_> = self.counts_by_type().into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(n);
        counts
    }

    /// Share of recorded errors marked recovered; 0.0 for an empty history.
    pub fn recovery_rate(&self) -> f64 {
        let entries = self.entries.read().expect("error history lock poisoned");
        if entries.is_empty() {
            return 0.0;
        }
        let recovered = entries.iter().filter(|e| e.error.recovered).count();
        recovered as f64 / entries.len() as f64
    }

    /// Drop a released workflow's history.
    pub fn forget_workflow(&self, workflow_id: Uuid) {
        self.entries
            .write()
            .expect("error history lock poisoned")
            .retain(|e| e.error.workflow_id != workflow_id);
    }

    fn filtered(&self, keep: impl Fn(&TrackedError) -> bool) -> Vec<TrackedError> {
        self.entries
            .read()
            .expect("error history lock poisoned")
            .iter()
            .filter(|e| keep(e))
            .cloned()
            .collect()
    }
}
