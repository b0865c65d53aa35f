//! A resumable position in a step list plus the step awaiting a result.

use std::sync::Arc;

use loomflow_types::workflow::StepDefinition;

use super::context::ExecutionContext;

/// A step handed to the caller whose result has not been reported.
#[derive(Debug, Clone)]
pub struct DispatchedStep {
    pub step: StepDefinition,
    /// 1 for the first dispatch, incremented per retry.
    pub attempt: u32,
    /// Set by a `retry` outcome; the next pull hands the step out again.
    pub retry_pending: bool,
}

#[derive(Debug, Clone)]
pub struct StepCursor {
    pub context: ExecutionContext,
    pub dispatched: Option<DispatchedStep>,
    /// Distinct steps handed out so far. Retries do not count.
    pub steps_dispatched: usize,
    pub last_step_id: Option<String>,
}

impl StepCursor {
    pub fn new(steps: Arc<[StepDefinition]>) -> Self {
        Self {
            context: ExecutionContext::new(steps),
            dispatched: None,
            steps_dispatched: 0,
            last_step_id: None,
        }
    }

    pub fn dispatch(&mut self, step: StepDefinition) {
        self.steps_dispatched += 1;
        self.last_step_id = Some(step.id.clone());
        self.dispatched = Some(DispatchedStep {
            step,
            attempt: 1,
            retry_pending: false,
        });
    }

    /// Re-arm the dispatched step for another attempt.
    pub fn redispatch(&mut self) -> Option<&DispatchedStep> {
        let dispatched = self.dispatched.as_mut()?;
        dispatched.attempt += 1;
        dispatched.retry_pending = false;
        Some(dispatched)
    }

    pub fn take_dispatched(&mut self) -> Option<DispatchedStep> {
        self.dispatched.take()
    }

    pub fn is_finished(&self) -> bool {
        self.dispatched.is_none() && self.context.is_finished()
    }
}
