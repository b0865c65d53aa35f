//! Per-step circuit breakers.
//!
//! A breaker only changes state through [`CircuitBreaker::try_acquire`],
//! [`CircuitBreaker::on_success`] and [`CircuitBreaker::on_failure`]. The
//! [`CircuitBreakerTable`] keys breakers by `(workflow_id, step_id)`; each
//! DashMap entry guard serialises callers of the same key.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use loomflow_types::error::{CircuitStatus, ErrorHandler};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
enum CircuitState {
    /// Counting consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Failing fast until `opened_at + timeout`.
    Open { opened_at: Instant },
    /// Admitting up to `half_open_max_calls` probes.
    HalfOpen { probes_in_flight: u32 },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_threshold: u32,
    timeout: Duration,
    half_open_max_calls: u32,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            failure_threshold: failure_threshold.max(1),
            timeout,
            half_open_max_calls: half_open_max_calls.max(1),
            failure_count: 0,
            last_failure_at: None,
        }
    }

    pub fn status(&self) -> CircuitStatus {
        match self.state {
            CircuitState::Closed { .. } => CircuitStatus::Closed,
            CircuitState::Open { .. } => CircuitStatus::Open,
            CircuitState::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }

    /// Failures recorded since the circuit last closed.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    /// Whether a call may proceed at `now`. An elapsed open circuit moves to
    /// half-open; each admitted half-open call consumes one probe.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed { .. } => true,
            CircuitState::Open { opened_at } => {
                if now.saturating_duration_since(opened_at) >= self.timeout {
                    self.state = CircuitState::HalfOpen {
                        probes_in_flight: 1,
                    };
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { probes_in_flight } => {
                if probes_in_flight < self.half_open_max_calls {
                    self.state = CircuitState::HalfOpen {
                        probes_in_flight: probes_in_flight + 1,
                    };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.state = CircuitState::Closed {
            consecutive_failures: 0,
        };
        self.failure_count = 0;
    }

    /// Returns the status after recording the failure.
    pub fn on_failure(&mut self, now: Instant) -> CircuitStatus {
        self.failure_count += 1;
        self.last_failure_at = Some(Utc::now());
        match self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let count = consecutive_failures + 1;
                self.state = if count >= self.failure_threshold {
                    CircuitState::Open { opened_at: now }
                } else {
                    CircuitState::Closed {
                        consecutive_failures: count,
                    }
                };
            }
            CircuitState::HalfOpen { .. } => {
                self.state = CircuitState::Open { opened_at: now };
            }
            CircuitState::Open { .. } => {}
        }
        self.status()
    }

    /// Time left before an open circuit admits a probe.
    pub fn remaining_open(&self, now: Instant) -> Option<Duration> {
        match self.state {
            CircuitState::Open { opened_at } => {
                Some(self.timeout.saturating_sub(now.saturating_duration_since(opened_at)))
            }
            _ => None,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

type BreakerKey = (Uuid, String);

#[derive(Debug)]
pub struct CircuitBreakerTable {
    breakers: DashMap<BreakerKey, CircuitBreaker>,
    half_open_max_calls: u32,
}

impl CircuitBreakerTable {
    pub fn new(half_open_max_calls: u32) -> Self {
        Self {
            breakers: DashMap::new(),
            half_open_max_calls,
        }
    }

    fn breaker_for(&self, handler: &ErrorHandler) -> CircuitBreaker {
        CircuitBreaker::new(
            handler.failure_threshold,
            Duration::from_millis(handler.circuit_timeout_ms),
            self.half_open_max_calls,
        )
    }

    /// True when the circuit is closed or half-open with probe budget left.
    /// Steps without a breaker yet are always admitted.
    pub fn check_circuit_breaker(&self, workflow_id: Uuid, step_id: &str) -> bool {
        self.check_at(workflow_id, step_id, Instant::now())
    }

    pub(crate) fn check_at(&self, workflow_id: Uuid, step_id: &str, now: Instant) -> bool {
        self.breakers
            .get_mut(&(workflow_id, step_id.to_string()))
            .is_none_or(|mut breaker| breaker.try_acquire(now))
    }

    pub fn record_success(&self, workflow_id: Uuid, step_id: &str) -> Option<CircuitStatus> {
        let mut breaker = self.breakers.get_mut(&(workflow_id, step_id.to_string()))?;
        let before = breaker.status();
        breaker.on_success();
        if before != CircuitStatus::Closed {
            tracing::info!(workflow_id = %workflow_id, step_id, "circuit closed");
        }
        Some(breaker.status())
    }

    pub fn record_failure(
        &self,
        workflow_id: Uuid,
        step_id: &str,
        handler: &ErrorHandler,
    ) -> CircuitStatus {
        self.record_failure_at(workflow_id, step_id, handler, Instant::now())
    }

    pub(crate) fn record_failure_at(
        &self,
        workflow_id: Uuid,
        step_id: &str,
        handler: &ErrorHandler,
        now: Instant,
    ) -> CircuitStatus {
        let mut breaker = self
            .breakers
            .entry((workflow_id, step_id.to_string()))
            .or_insert_with(|| self.breaker_for(handler));
        let before = breaker.status();
        let after = breaker.on_failure(now);
        if before != CircuitStatus::Open && after == CircuitStatus::Open {
            tracing::warn!(
                workflow_id = %workflow_id,
                step_id,
                failures = breaker.failure_count(),
                "circuit opened"
            );
        }
        after
    }

    pub fn remaining_open(&self, workflow_id: Uuid, step_id: &str) -> Option<Duration> {
        self.breakers
            .get(&(workflow_id, step_id.to_string()))
            .and_then(|b| b.remaining_open(Instant::now()))
    }

    pub fn snapshot(&self, workflow_id: Uuid, step_id: &str) -> Option<CircuitSnapshot> {
        self.breakers
            .get(&(workflow_id, step_id.to_string()))
            .map(|b| CircuitSnapshot {
                status: b.status(),
                failure_count: b.failure_count(),
                last_failure_at: b.last_failure_at(),
            })
    }

    /// Drop every breaker belonging to one workflow instance.
    pub fn forget_workflow(&self, workflow_id: Uuid) {
        self.breakers.retain(|(id, _), _| *id != workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(threshold, Duration::from_millis(timeout_ms), 1)
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let now = Instant::now();
        let mut b = breaker(3, 1_000);
        assert_eq!(b.on_failure(now), CircuitStatus::Closed);
        assert_eq!(b.on_failure(now), CircuitStatus::Closed);
        assert!(b.try_acquire(now));
        assert_eq!(b.on_failure(now), CircuitStatus::Open);
    }

    #[test]
    fn test_open_fails_fast_until_timeout() {
        let now = Instant::now();
        let mut b = breaker(1, 1_000);
        b.on_failure(now);
        for ms in [0, 10, 500, 999] {
            assert!(!b.try_acquire(now + Duration::from_millis(ms)));
            assert_eq!(b.status(), CircuitStatus::Open);
        }
        assert!(b.try_acquire(now + Duration::from_millis(1_000)));
        assert_eq!(b.status(), CircuitStatus::HalfOpen);
    }

    #[test]
    fn test_half_open_probe_budget() {
        let now = Instant::now();
        let mut b = breaker(1, 0);
        b.on_failure(now);
        assert!(b.try_acquire(now));
        // Single probe already in flight.
        assert!(!b.try_acquire(now));
    }

    #[test]
    fn test_half_open_success_closes() {
        let now = Instant::now();
        let mut b = breaker(2, 100);
        b.on_failure(now);
        b.on_failure(now);
        assert!(b.try_acquire(now + Duration::from_millis(100)));
        b.on_success();
        assert_eq!(b.status(), CircuitStatus::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let now = Instant::now();
        let mut b = breaker(2, 100);
        b.on_failure(now);
        b.on_failure(now);
        let later = now + Duration::from_millis(150);
        assert!(b.try_acquire(later));
        assert_eq!(b.on_failure(later), CircuitStatus::Open);
        assert!(!b.try_acquire(later + Duration::from_millis(50)));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let now = Instant::now();
        let mut b = breaker(2, 100);
        b.on_failure(now);
        b.on_success();
        assert_eq!(b.on_failure(now), CircuitStatus::Closed);
    }

    #[test]
    fn test_table_keys_are_independent() {
        let table = CircuitBreakerTable::new(1);
        let handler = ErrorHandler::circuit_breaker(1, 60_000);
        let wf = Uuid::now_v7();
        let other = Uuid::now_v7();

        assert!(table.check_circuit_breaker(wf, "fetch"));
        assert_eq!(table.record_failure(wf, "fetch", &handler), CircuitStatus::Open);
        assert!(!table.check_circuit_breaker(wf, "fetch"));
        assert!(table.check_circuit_breaker(wf, "store"));
        assert!(table.check_circuit_breaker(other, "fetch"));

        let snap = table.snapshot(wf, "fetch").unwrap();
        assert_eq!(snap.status, CircuitStatus::Open);
        assert_eq!(snap.failure_count, 1);
        assert!(table.remaining_open(wf, "fetch").is_some());

        table.forget_workflow(wf);
        assert!(table.snapshot(wf, "fetch").is_none());
    }
}
