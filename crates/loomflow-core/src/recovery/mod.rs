//! Strategy-driven failure handling: retry backoff, circuit breakers,
//! fallback and an append-only error history.

pub mod backoff;
pub mod circuit_breaker;
pub mod registry;
pub mod tracker;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use backoff::ExponentialBackoffCalculator;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerTable, CircuitSnapshot};
pub use registry::{ErrorHandlerRegistry, HandlingOutcome};
pub use tracker::{ErrorTracker, TrackedError};

/// What the registry decided to do about one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Continue,
    Fail,
    Fallback,
    /// The circuit is open; the call was refused or has just tripped it.
    CircuitBreaker,
}

impl RecoveryAction {
    /// Actions whose error may later be marked recovered.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RecoveryAction::Retry | RecoveryAction::Continue | RecoveryAction::Fallback
        )
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Continue => "continue",
            RecoveryAction::Fail => "fail",
            RecoveryAction::Fallback => "fallback",
            RecoveryAction::CircuitBreaker => "circuit_breaker",
        };
        write!(f, "{s}")
    }
}
