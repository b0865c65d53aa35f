//! Engine-level error type.
//!
//! `EngineError` is what the executor API returns. Module errors convert
//! into it with `?`; [`EngineError::to_payload`] renders the user-facing
//! [`ErrorPayload`] with a stable code and actionable context.

use loomflow_types::error::ErrorPayload;
use loomflow_types::workflow::WorkflowStatus;
use serde_json::Value;
use uuid::Uuid;

use crate::definition::DefinitionError;
use crate::expression::ExpressionError;
use crate::flow::ControlFlowError;
use crate::state::StateError;
use crate::subagent::SubAgentError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    ControlFlow(#[from] ControlFlowError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    SubAgent(SubAgentError),

    #[error("workflow {workflow_id} not found")]
    WorkflowNotFound { workflow_id: Uuid },

    #[error("sub-agent task '{task_id}' not found")]
    TaskNotFound { task_id: String },

    #[error("workflow {workflow_id} is {status}")]
    WorkflowTerminated {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },

    #[error("workflow '{workflow}' input '{input}': {reason}")]
    InvalidInput {
        workflow: String,
        input: String,
        reason: String,
    },

    #[error("step '{step_id}' is not awaiting a result{}", expected_hint(.expected))]
    UnknownStep {
        step_id: String,
        expected: Option<String>,
    },

    #[error("sub-agent task '{task_id}' may only write below 'output', got '{path}'")]
    IsolationViolation { task_id: String, path: String },

    #[error("circuit for step '{step_id}' is open; retry after {retry_after_ms}ms")]
    CircuitOpen { step_id: String, retry_after_ms: u64 },
}

fn expected_hint(expected: &Option<String>) -> String {
    expected
        .as_ref()
        .map(|s| format!(" (awaiting '{s}')"))
        .unwrap_or_else(|| " (no step is awaiting a result)".to_string())
}

impl From<SubAgentError> for EngineError {
    fn from(err: SubAgentError) -> Self {
        match err {
            SubAgentError::TaskNotFound { task_id } => EngineError::TaskNotFound { task_id },
            SubAgentError::IsolationViolation { task_id, path } => {
                EngineError::IsolationViolation { task_id, path }
            }
            other => EngineError::SubAgent(other),
        }
    }
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Definition(e) => e.code(),
            EngineError::State(e) => e.code(),
            EngineError::ControlFlow(e) => e.code(),
            EngineError::Expression(e) => e.code(),
            EngineError::SubAgent(e) => e.code(),
            EngineError::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            EngineError::TaskNotFound { .. } => "TASK_NOT_FOUND",
            EngineError::WorkflowTerminated { .. } => "WORKFLOW_TERMINATED",
            EngineError::InvalidInput { .. } => "INVALID_INPUT",
            EngineError::UnknownStep { .. } => "UNKNOWN_STEP",
            EngineError::IsolationViolation { .. } => "ISOLATION_VIOLATION",
            EngineError::CircuitOpen { .. } => "CIRCUIT_OPEN",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        if let EngineError::Definition(e) = self {
            return e.to_payload();
        }
        let payload = ErrorPayload::new(self.code(), self.to_string());
        match self {
            EngineError::WorkflowNotFound { workflow_id } => {
                payload.with_context("workflow_id", workflow_id.to_string())
            }
            EngineError::TaskNotFound { task_id } => payload.with_context("task_id", task_id.clone()),
            EngineError::WorkflowTerminated { status, .. } => payload.with_context("status", status.to_string()),
            EngineError::InvalidInput { input, .. } => payload.with_context("input", input.clone()),
            EngineError::UnknownStep {
                step_id,
                expected: Some(expected),
            } => payload
                .with_context("step_id", step_id.clone())
                .with_context("expected", expected.clone()),
            EngineError::CircuitOpen {
                step_id,
                retry_after_ms,
            } => payload
                .with_context("step_id", step_id.clone())
                .with_context("retry_after_ms", *retry_after_ms),
            EngineError::ControlFlow(e) => {
                let payload = payload.with_context("step_id", e.step_id().to_string());
                match e {
                    ControlFlowError::UnknownWorkflow {
                        suggestion: Some(s), ..
                    } => payload.with_context("suggestion", s.clone()),
                    ControlFlowError::IncludeDepthExceeded { max_depth, .. } => {
                        payload.with_context("max_depth", *max_depth)
                    }
                    _ => payload,
                }
            }
            EngineError::State(StateError::InvalidPath {
                path,
                suggestion,
                ..
            }) => {
                let payload = payload.with_context("path", path.clone());
                match suggestion {
                    Some(s) => payload.with_context("suggestion", s.clone()),
                    None => payload,
                }
            }
            EngineError::State(StateError::CircularDependency { cycle }) => payload.with_context(
                "cycle",
                Value::Array(cycle.iter().cloned().map(Value::String).collect()),
            ),
            EngineError::SubAgent(SubAgentError::UnknownTemplate {
                suggestion: Some(s), ..
            }) => payload.with_context("suggestion", s.clone()),
            _ => payload,
        }
    }
}
