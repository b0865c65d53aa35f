//! Maps a failure plus its step's [`ErrorHandler`] to a recovery decision.

use loomflow_types::config::{CircuitBreakerDefaults, RetryDefaults};
use loomflow_types::error::{CircuitStatus, ErrorHandler, ErrorStrategy, WorkflowError};
use loomflow_types::state::UpdateOperation;
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::backoff::ExponentialBackoffCalculator;
use super::circuit_breaker::{CircuitBreakerTable, CircuitSnapshot};
use super::tracker::{ErrorTracker, TrackedError};
use super::RecoveryAction;

// ---------------------------------------------------------------------------
// HandlingOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlingOutcome {
    pub action: RecoveryAction,
    /// Whether the workflow may proceed past the failed step.
    pub should_continue: bool,
    /// 1-based number of the retry about to happen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_value: Option<Value>,
    /// State writes the caller should apply (e.g. recording the error).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub state_updates: Vec<UpdateOperation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<CircuitStatus>,
    pub message: String,
    pub error_id: Uuid,
}

impl HandlingOutcome {
    fn new(action: RecoveryAction, should_continue: bool, message: String, error_id: Uuid) -> Self {
        Self {
            action,
            should_continue,
            retry_attempt: None,
            retry_delay_ms: None,
            fallback_value: None,
            state_updates: Vec::new(),
            circuit_state: None,
            message,
            error_id,
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorHandlerRegistry
// ---------------------------------------------------------------------------

/// Shared by every workflow instance of an executor.
#[derive(Debug)]
pub struct ErrorHandlerRegistry {
    breakers: CircuitBreakerTable,
    tracker: ErrorTracker,
    retry: RetryDefaults,
}

impl ErrorHandlerRegistry {
    pub fn new(retry: RetryDefaults, circuit_breaker: CircuitBreakerDefaults) -> Self {
        Self {
            breakers: CircuitBreakerTable::new(circuit_breaker.half_open_max_calls),
            tracker: ErrorTracker::new(),
            retry,
        }
    }

    pub fn tracker(&self) -> &ErrorTracker {
        &self.tracker
    }

    pub fn breakers(&self) -> &CircuitBreakerTable {
        &self.breakers
    }

    /// Decide what to do about `error` and append it to the history.
    pub fn handle_error(&self, error: WorkflowError, handler: &ErrorHandler) -> HandlingOutcome {
        let outcome = match handler.strategy {
            ErrorStrategy::CircuitBreaker => {
                let status = self
                    .breakers
                    .record_failure(error.workflow_id, &error.step_id, handler);
                let mut outcome = if status == CircuitStatus::Open {
                    self.open_circuit(&error, handler)
                } else {
                    let delegate = match handler.delegate {
                        ErrorStrategy::CircuitBreaker => ErrorStrategy::Retry,
                        other => other,
                    };
                    self.apply(delegate, &error, handler)
                };
                outcome.circuit_state = Some(status);
                outcome
            }
            strategy => self.apply(strategy, &error, handler),
        };

        match outcome.action {
            RecoveryAction::Fail => tracing::warn!(
                workflow_id = %error.workflow_id,
                step_id = %error.step_id,
                error_type = %error.error_type,
                "step failed: {}",
                outcome.message
            ),
            action => tracing::info!(
                workflow_id = %error.workflow_id,
                step_id = %error.step_id,
                %action,
                "{}",
                outcome.message
            ),
        }
        self.tracker.record(error, outcome.action);
        outcome
    }

    /// Outcome for a dispatch refused by an open circuit. Recorded like any
    /// other failure.
    pub fn reject_open_circuit(
        &self,
        workflow_id: Uuid,
        step_id: &str,
        handler: &ErrorHandler,
    ) -> HandlingOutcome {
        let remaining = self
            .breakers
            .remaining_open(workflow_id, step_id)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let error = WorkflowError::new(
            workflow_id,
            step_id,
            "circuit_open",
            format!("circuit for step '{step_id}' is open; next probe in {remaining}ms"),
        )
        .with_data(json!({ "retry_after_ms": remaining }));
        let mut outcome = self.open_circuit(&error, handler);
        outcome.circuit_state = Some(CircuitStatus::Open);
        self.tracker.record(error, outcome.action);
        outcome
    }

    pub fn check_circuit_breaker(&self, workflow_id: Uuid, step_id: &str) -> bool {
        self.breakers.check_circuit_breaker(workflow_id, step_id)
    }

    pub fn circuit_snapshot(&self, workflow_id: Uuid, step_id: &str) -> Option<CircuitSnapshot> {
        self.breakers.snapshot(workflow_id, step_id)
    }

    /// A step succeeded: close its breaker and mark earlier retry/continue
    /// errors recovered.
    pub fn record_success(&self, workflow_id: Uuid, step_id: &str) {
        self.breakers.record_success(workflow_id, step_id);
        let marked = self.tracker.mark_step_recovered(workflow_id, step_id);
        if marked > 0 {
            tracing::debug!(workflow_id = %workflow_id, step_id, marked, "errors recovered");
        }
    }

    pub fn history_for(&self, workflow_id: Uuid) -> Vec<TrackedError> {
        self.tracker.errors_for_workflow(workflow_id)
    }

    /// Circuit state is per instance and goes away with it.
    pub fn teardown(&self, workflow_id: Uuid) {
        self.breakers.forget_workflow(workflow_id);
    }

    pub fn release(&self, workflow_id: Uuid) {
        self.breakers.forget_workflow(workflow_id);
        self.tracker.forget_workflow(workflow_id);
    }

    fn apply(
        &self,
        strategy: ErrorStrategy,
        error: &WorkflowError,
        handler: &ErrorHandler,
    ) -> HandlingOutcome {
        match strategy {
            ErrorStrategy::Retry if error.retry_count < handler.retry_count => {
                let max_delay = handler.max_retry_delay_ms.min(self.retry.delay_ceiling_ms);
                let delay = ExponentialBackoffCalculator::calculate_delay(
                    error.retry_count,
                    handler.retry_delay_ms,
                    handler.backoff_multiplier,
                    max_delay,
                    handler.jitter || self.retry.force_jitter,
                );
                let attempt = error.retry_count + 1;
                let mut outcome = HandlingOutcome::new(
                    RecoveryAction::Retry,
                    false,
                    format!(
                        "retrying step '{}' (attempt {attempt} of {}) in {delay}ms after {}: {}",
                        error.step_id, handler.retry_count, error.error_type, error.message
                    ),
                    error.id,
                );
                outcome.retry_attempt = Some(attempt);
                outcome.retry_delay_ms = Some(delay);
                outcome
            }
            ErrorStrategy::Retry => self.fail(
                error,
                handler,
                format!(
                    "step '{}' failed after {} retries: {}",
                    error.step_id, error.retry_count, error.message
                ),
            ),
            ErrorStrategy::Continue => HandlingOutcome::new(
                RecoveryAction::Continue,
                true,
                format!(
                    "continuing past step '{}' after {}: {}",
                    error.step_id, error.error_type, error.message
                ),
                error.id,
            ),
            ErrorStrategy::Fallback => {
                let mut outcome = HandlingOutcome::new(
                    RecoveryAction::Fallback,
                    true,
                    format!(
                        "using fallback value for step '{}' after {}",
                        error.step_id, error.error_type
                    ),
                    error.id,
                );
                outcome.fallback_value = Some(handler.fallback_value.clone().unwrap_or(Value::Null));
                outcome
            }
            ErrorStrategy::Fail | ErrorStrategy::CircuitBreaker => self.fail(
                error,
                handler,
                format!("step '{}' failed ({}): {}", error.step_id, error.error_type, error.message),
            ),
        }
    }

    fn fail(&self, error: &WorkflowError, handler: &ErrorHandler, message: String) -> HandlingOutcome {
        let mut outcome = HandlingOutcome::new(RecoveryAction::Fail, false, message, error.id);
        outcome.state_updates = vec![UpdateOperation::set(
            handler.error_state_path.clone(),
            error_record(error),
        )];
        outcome
    }

    /// An open circuit continues with the fallback value when one is
    /// declared and fails otherwise.
    fn open_circuit(&self, error: &WorkflowError, handler: &ErrorHandler) -> HandlingOutcome {
        let message = format!(
            "circuit for step '{}' is open after {} failures: {}",
            error.step_id,
            self.breakers
                .snapshot(error.workflow_id, &error.step_id)
                .map(|s| s.failure_count)
                .unwrap_or(handler.failure_threshold),
            error.message
        );
        match &handler.fallback_value {
            Some(value) => {
                let mut outcome =
                    HandlingOutcome::new(RecoveryAction::CircuitBreaker, true, message, error.id);
                outcome.fallback_value = Some(value.clone());
                outcome
            }
            None => {
                let mut outcome =
                    HandlingOutcome::new(RecoveryAction::CircuitBreaker, false, message, error.id);
                outcome.state_updates = vec![UpdateOperation::set(
                    handler.error_state_path.clone(),
                    error_record(error),
                )];
                outcome
            }
        }
    }
}

impl Default for ErrorHandlerRegistry {
    fn default() -> Self {
        Self::new(RetryDefaults::default(), CircuitBreakerDefaults::default())
    }
}

fn error_record(error: &WorkflowError) -> Value {
    json!({
        "step_id": error.step_id,
        "error_type": error.error_type,
        "message": error.message,
        "retry_count": error.retry_count,
        "occurred_at": error.occurred_at.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(wf: Uuid, step: &str, retries: u32) -> WorkflowError {
        WorkflowError::new(wf, step, "timeout", "upstream timed out").with_retry_count(retries)
    }

    // -----------------------------------------------------------------------
    // Strategy table
    // -----------------------------------------------------------------------

    #[test]
    fn test_retry_computes_attempt_and_delay() {
        let registry = ErrorHandlerRegistry::default();
        let wf = Uuid::now_v7();
        let handler = ErrorHandler::retry(3, 100);

        let first = registry.handle_error(failure(wf, "fetch", 0), &handler);
        assert_eq!(first.action, RecoveryAction::Retry);
        assert!(!first.should_continue);
        assert_eq!(first.retry_attempt, Some(1));
        assert_eq!(first.retry_delay_ms, Some(100));

        let third = registry.handle_error(failure(wf, "fetch", 2), &handler);
        assert_eq!(third.retry_attempt, Some(3));
        assert_eq!(third.retry_delay_ms, Some(400));
    }

    #[test]
    fn test_exhausted_retries_fail() {
        let registry = ErrorHandlerRegistry::default();
        let outcome = registry.handle_error(failure(Uuid::now_v7(), "fetch", 3), &ErrorHandler::retry(3, 10));
        assert_eq!(outcome.action, RecoveryAction::Fail);
        assert!(outcome.message.contains("after 3 retries"));
        assert_eq!(outcome.state_updates.len(), 1);
        assert_eq!(outcome.state_updates[0].path, "state.last_error");
    }

    #[test]
    fn test_continue_and_fallback() {
        let registry = ErrorHandlerRegistry::default();
        let wf = Uuid::now_v7();

        let cont = registry.handle_error(failure(wf, "a", 0), &ErrorHandler::new(ErrorStrategy::Continue));
        assert_eq!(cont.action, RecoveryAction::Continue);
        assert!(cont.should_continue);

        let fb = registry.handle_error(failure(wf, "b", 0), &ErrorHandler::fallback(json!({"items": []})));
        assert_eq!(fb.action, RecoveryAction::Fallback);
        assert!(fb.should_continue);
        assert_eq!(fb.fallback_value, Some(json!({"items": []})));
    }

    #[test]
    fn test_fail_records_error_state() {
        let registry = ErrorHandlerRegistry::default();
        let outcome = registry.handle_error(failure(Uuid::now_v7(), "a", 0), &ErrorHandler::default());
        assert_eq!(outcome.action, RecoveryAction::Fail);
        assert!(!outcome.should_continue);
        assert_eq!(outcome.state_updates[0].value["error_type"], json!("timeout"));
    }

    #[test]
    fn test_retry_delay_respects_config_ceiling() {
        let registry = ErrorHandlerRegistry::new(
            RetryDefaults {
                delay_ceiling_ms: 250,
                force_jitter: false,
            },
            CircuitBreakerDefaults::default(),
        );
        let outcome = registry.handle_error(failure(Uuid::now_v7(), "a", 2), &ErrorHandler::retry(5, 100));
        assert_eq!(outcome.retry_delay_ms, Some(250));
    }

    // -----------------------------------------------------------------------
    // Circuit breaker
    // -----------------------------------------------------------------------

    #[test]
    fn test_circuit_breaker_delegates_until_open() {
        let registry = ErrorHandlerRegistry::default();
        let wf = Uuid::now_v7();
        let handler = ErrorHandler::circuit_breaker(2, 60_000);

        let first = registry.handle_error(failure(wf, "api", 0), &handler);
        assert_eq!(first.action, RecoveryAction::Retry);
        assert_eq!(first.circuit_state, Some(CircuitStatus::Closed));
        assert!(registry.check_circuit_breaker(wf, "api"));

        let second = registry.handle_error(failure(wf, "api", 1), &handler);
        assert_eq!(second.action, RecoveryAction::CircuitBreaker);
        assert_eq!(second.circuit_state, Some(CircuitStatus::Open));
        assert!(!second.should_continue);
        assert!(!registry.check_circuit_breaker(wf, "api"));

        let rejected = registry.reject_open_circuit(wf, "api", &handler);
        assert_eq!(rejected.action, RecoveryAction::CircuitBreaker);
        assert!(rejected.message.contains("is open"));
    }

    #[test]
    fn test_open_circuit_uses_fallback_when_declared() {
        let registry = ErrorHandlerRegistry::default();
        let handler = ErrorHandler {
            fallback_value: Some(json!("cached")),
            ..ErrorHandler::circuit_breaker(1, 60_000)
        };
        let outcome = registry.handle_error(failure(Uuid::now_v7(), "api", 0), &handler);
        assert_eq!(outcome.action, RecoveryAction::CircuitBreaker);
        assert!(outcome.should_continue);
        assert_eq!(outcome.fallback_value, Some(json!("cached")));
    }

    // -----------------------------------------------------------------------
    // Tracking
    // -----------------------------------------------------------------------

    #[test]
    fn test_every_handled_error_is_tracked() {
        let registry = ErrorHandlerRegistry::default();
        let wf = Uuid::now_v7();
        registry.handle_error(failure(wf, "a", 0), &ErrorHandler::retry(2, 1));
        registry.handle_error(failure(wf, "b", 0), &ErrorHandler::default());
        registry.record_success(wf, "a");

        let history = registry.history_for(wf);
        assert_eq!(history.len(), 2);
        assert!(history[0].error.recovered);
        assert!(!history[1].error.recovered);

        registry.release(wf);
        assert!(registry.history_for(wf).is_empty());
    }
}
