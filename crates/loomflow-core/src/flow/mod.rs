//! Control-flow processing.
//!
//! - `context` -- [`ExecutionContext`]: frame arena and loop stack
//! - `cursor` -- [`StepCursor`], a context plus its dispatched step
//! - `processors` -- conditional, while, foreach, break and continue
//! - `walker` -- [`StepWalker`], the cursor engine shared by workflows and
//!   sub-agents

pub mod context;
pub mod cursor;
pub mod processors;
pub mod walker;

pub use context::{
    CompletedLoop, ControlSignal, ExecutionContext, FrameKind, LoopExit, LoopKind, LoopState, StackFrame,
};
pub use cursor::{DispatchedStep, StepCursor};
pub use processors::{ForeachMode, ProcessOutcome};
pub use walker::{ParallelPolicy, StepWalker, WalkEnv, WalkEvent};

use crate::expression::ExpressionError;

/// Precondition violations raised while walking steps. Never retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlFlowError {
    #[error("'{signal}' in step '{step_id}' has no enclosing loop")]
    NoActiveLoop {
        step_id: String,
        signal: ControlSignal,
    },

    #[error("foreach step '{step_id}' needs an array, got {found}")]
    NotIterable { step_id: String, found: &'static str },

    #[error("step '{step_id}': {source}")]
    Expression {
        step_id: String,
        #[source]
        source: ExpressionError,
    },

    #[error("step '{step_id}' includes unknown workflow '{workflow}'{}", hint(.suggestion))]
    UnknownWorkflow {
        step_id: String,
        workflow: String,
        suggestion: Option<String>,
    },

    #[error("step '{step_id}' would include '{workflow}' beyond the maximum depth of {max_depth}")]
    IncludeDepthExceeded {
        step_id: String,
        workflow: String,
        max_depth: usize,
    },
}

fn hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{s}'?)"))
        .unwrap_or_default()
}

impl ControlFlowError {
    pub fn code(&self) -> &'static str {
        match self {
            ControlFlowError::NoActiveLoop { .. } => "CONTROL_FLOW",
            ControlFlowError::NotIterable { .. } => "NOT_ITERABLE",
            ControlFlowError::Expression { source, .. } => source.code(),
            ControlFlowError::UnknownWorkflow { .. } => "UNKNOWN_WORKFLOW",
            ControlFlowError::IncludeDepthExceeded { .. } => "INCLUDE_DEPTH_EXCEEDED",
        }
    }

    pub fn step_id(&self) -> &str {
        match self {
            ControlFlowError::NoActiveLoop { step_id, .. }
            | ControlFlowError::NotIterable { step_id, .. }
            | ControlFlowError::Expression { step_id, .. }
            | ControlFlowError::UnknownWorkflow { step_id, .. }
            | ControlFlowError::IncludeDepthExceeded { step_id, .. } => step_id,
        }
    }
}
