//! Error records, error-handler policies and user-facing error payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Runtime error record
// ---------------------------------------------------------------------------

/// How bad a runtime failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A runtime failure of a single step, created at the failure site.
///
/// Every handled error is appended to the instance's error history whether or
/// not it was recovered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: String,
    /// Caller-supplied classification (e.g. "timeout", "command_failed").
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub severity: ErrorSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_data: Option<Value>,
    /// Retries already spent on this step before this failure.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub recovered: bool,
    pub occurred_at: DateTime<Utc>,
}

impl WorkflowError {
    pub fn new(
        workflow_id: Uuid,
        step_id: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            step_id: step_id.into(),
            error_type: error_type.into(),
            message: message.into(),
            severity: ErrorSeverity::default(),
            error_data: None,
            retry_count: 0,
            recovered: false,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.error_data = Some(data);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

// ---------------------------------------------------------------------------
// Error handler policy
// ---------------------------------------------------------------------------

/// Recovery strategy applied when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    Retry,
    Continue,
    #[default]
    Fail,
    Fallback,
    CircuitBreaker,
}

impl fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorStrategy::Retry => "retry",
            ErrorStrategy::Continue => "continue",
            ErrorStrategy::Fail => "fail",
            ErrorStrategy::Fallback => "fallback",
            ErrorStrategy::CircuitBreaker => "circuit_breaker",
        };
        write!(f, "{s}")
    }
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_timeout_ms() -> u64 {
    60_000
}

fn default_delegate() -> ErrorStrategy {
    ErrorStrategy::Retry
}

fn default_error_state_path() -> String {
    "state.last_error".to_string()
}

/// Declarative failure policy attached to a step.
///
/// ```yaml
/// error_handler:
///   strategy: circuit_breaker
///   failure_threshold: 3
///   circuit_timeout_ms: 10000
///   delegate: fallback
///   fallback_value: []
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandler {
    #[serde(default)]
    pub strategy: ErrorStrategy,
    /// Maximum retries before the failure becomes terminal.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Base delay for exponential backoff.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default)]
    pub jitter: bool,
    /// Stand-in result used by the `fallback` strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_value: Option<Value>,
    /// Failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit stays open before probing.
    #[serde(default = "default_circuit_timeout_ms")]
    pub circuit_timeout_ms: u64,
    /// Strategy applied while a circuit is closed or half-open.
    #[serde(default = "default_delegate")]
    pub delegate: ErrorStrategy,
    /// State path that receives the error record on `fail`.
    #[serde(default = "default_error_state_path")]
    pub error_state_path: String,
}

impl ErrorHandler {
    pub fn new(strategy: ErrorStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn retry(retry_count: u32, retry_delay_ms: u64) -> Self {
        Self {
            strategy: ErrorStrategy::Retry,
            retry_count,
            retry_delay_ms,
            ..Self::default()
        }
    }

    pub fn fallback(value: Value) -> Self {
        Self {
            strategy: ErrorStrategy::Fallback,
            fallback_value: Some(value),
            ..Self::default()
        }
    }

    pub fn circuit_breaker(failure_threshold: u32, circuit_timeout_ms: u64) -> Self {
        Self {
            strategy: ErrorStrategy::CircuitBreaker,
            failure_threshold,
            circuit_timeout_ms,
            ..Self::default()
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::default(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            jitter: false,
            fallback_value: None,
            failure_threshold: default_failure_threshold(),
            circuit_timeout_ms: default_circuit_timeout_ms(),
            delegate: default_delegate(),
            error_state_path: default_error_state_path(),
        }
    }
}

/// Externally visible state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// User-facing payload
// ---------------------------------------------------------------------------

/// Error rendering handed to callers: a stable `code`, a message naming the
/// offending resource and optional actionable context.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}
