//! Queue-based workflow execution.
//!
//! [`QueueExecutor`] is a pull-model state machine: callers ask for the next
//! step, execute it themselves and report the result back. Nothing runs
//! between calls; each instance's position lives entirely in its frame
//! stack.
//!
//! - `instance` -- [`WorkflowInstance`], one running workflow and its store
//! - `queue` -- [`QueueExecutor`], `start` / `get_next_step` / `report_step_result`
//! - `subagents` -- the sub-agent half of the API (`get_next_sub_agent_step`, ...)
//! - `driver` -- [`WorkflowDriver`], an async loop that runs a workflow to
//!   completion against a [`StepHandler`]

pub mod driver;
pub mod instance;
pub mod queue;
pub mod subagents;

use std::collections::BTreeMap;
use std::time::Duration;

use loomflow_types::config::ExecutionMode;
use loomflow_types::workflow::{SubAgentStatus, WorkflowStatus};
use serde::Serialize;
use serde_json::Value;

pub use driver::{DriveSummary, StepHandler, WorkflowDriver};
pub use instance::WorkflowInstance;
pub use queue::QueueExecutor;

use crate::recovery::{HandlingOutcome, RecoveryAction};

/// Per-instance overrides for [`QueueExecutor::start_with`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Overrides the engine-wide execution mode.
    pub execution_mode: Option<ExecutionMode>,
    /// Run structural validation before creating the instance.
    pub validate: bool,
}

impl StartOptions {
    pub fn serial() -> Self {
        Self {
            execution_mode: Some(ExecutionMode::Serial),
            ..Self::default()
        }
    }
}

/// What happened to a reported step result.
#[derive(Debug, Clone, Serialize)]
pub struct ReportOutcome {
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Set when the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handling: Option<HandlingOutcome>,
    /// Path -> value for everything the result wrote.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub state_updates: BTreeMap<String, Value>,
    pub workflow_status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_status: Option<SubAgentStatus>,
}

impl ReportOutcome {
    pub(crate) fn new(step_id: impl Into<String>, workflow_status: WorkflowStatus) -> Self {
        Self {
            step_id: step_id.into(),
            task_id: None,
            handling: None,
            state_updates: BTreeMap::new(),
            workflow_status,
            task_status: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.handling.is_none()
    }

    /// How long to wait before pulling the retried step again.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.handling
            .as_ref()
            .filter(|h| h.action == RecoveryAction::Retry)
            .and_then(|h| h.retry_delay_ms)
            .map(Duration::from_millis)
    }
}
