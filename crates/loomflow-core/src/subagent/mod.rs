//! Sub-agents and `parallel_foreach` fan-out.
//!
//! - `manager` -- [`SubAgentManager`]: task lifecycle and isolated views
//! - `orchestrator` -- [`ParallelOrchestrator`]: one execution per
//!   `parallel_foreach`, bounded dispatch and result aggregation

pub mod manager;
pub mod orchestrator;

pub use manager::{SubAgentManager, SubAgentSummary, SubAgentTask};
pub use orchestrator::{
    ExecutionDescriptor, ExecutionProgress, ParallelAggregate, ParallelOrchestrator, TaskFailure,
    TaskResolution,
};

use loomflow_types::workflow::SubAgentStatus;
use uuid::Uuid;

use crate::expression::ExpressionError;
use crate::state::StateError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubAgentError {
    #[error("sub-agent task '{task_id}' not found")]
    TaskNotFound { task_id: String },

    #[error("parallel execution {execution_id} not found")]
    ExecutionNotFound { execution_id: Uuid },

    #[error("sub-agent task '{task_id}' may only write below 'output', got '{path}'")]
    IsolationViolation { task_id: String, path: String },

    #[error("sub-agent task '{task_id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task_id: String,
        from: SubAgentStatus,
        to: SubAgentStatus,
    },

    #[error("sub-agent task '{task_id}' has not been dispatched yet")]
    NotDispatched { task_id: String },

    #[error("step '{step_id}' names unknown sub-agent task '{template}'{}", hint(.suggestion))]
    UnknownTemplate {
        step_id: String,
        template: String,
        suggestion: Option<String>,
    },

    #[error("step '{step_id}' is not a parallel_foreach")]
    NotParallel { step_id: String },

    #[error("parallel_foreach step '{step_id}' needs an array, got {found}")]
    NotIterable { step_id: String, found: &'static str },

    #[error("step '{step_id}': {source}")]
    Expression {
        step_id: String,
        #[source]
        source: ExpressionError,
    },

    #[error("sub-agent task '{task_id}' cannot write '{path}': {source}")]
    Output {
        task_id: String,
        path: String,
        #[source]
        source: StateError,
    },

    #[error("sub-agent task '{template}' shares an invalid path: {source}")]
    SharedPath {
        template: String,
        #[source]
        source: StateError,
    },
}

fn hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{s}'?)"))
        .unwrap_or_default()
}

impl SubAgentError {
    pub fn code(&self) -> &'static str {
        match self {
            SubAgentError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            SubAgentError::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            SubAgentError::IsolationViolation { .. } => "ISOLATION_VIOLATION",
            SubAgentError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SubAgentError::NotDispatched { .. } => "NOT_DISPATCHED",
            SubAgentError::UnknownTemplate { .. } => "UNKNOWN_TASK",
            SubAgentError::NotParallel { .. } => "NOT_PARALLEL",
            SubAgentError::NotIterable { .. } => "NOT_ITERABLE",
            SubAgentError::Expression { source, .. } => source.code(),
            SubAgentError::Output { source, .. } | SubAgentError::SharedPath { source, .. } => {
                source.code()
            }
        }
    }
}
