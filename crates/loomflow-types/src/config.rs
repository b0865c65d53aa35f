//! Engine configuration types for Loomflow.
//!
//! `EngineConfig` is the `loomflow.toml` document that selects the evaluator
//! implementation, execution mode, state conflict policy and the default
//! limits applied when a workflow does not set its own.

use serde::{Deserialize, Serialize};

/// Which expression evaluator backs an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorMode {
    /// Parser + AST interpreter with methods and transforms.
    #[default]
    Full,
    /// Operators, property access and ternaries only.
    Basic,
}

/// How `parallel_foreach` and `foreach` are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Sub-agents are dispatched to callers and run concurrently.
    #[default]
    Concurrent,
    /// Synchronous debug mode: constructs are expanded and run one at a time.
    Serial,
}

/// Resolution for concurrent writes to the same state path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    LastWriterWins,
    /// Deep-merge objects and concatenate arrays on `set`.
    Merge,
}

/// Top-level engine configuration. All fields have defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub evaluator: EvaluatorMode,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Loop cap used when a `while_loop`/`foreach` omits `max_iterations`.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    /// Concurrency bound used when `parallel_foreach` omits `max_parallel`.
    #[serde(default = "default_max_parallel")]
    pub default_max_parallel: usize,
    /// Maximum `include_workflow` nesting depth.
    #[serde(default = "default_max_include_depth")]
    pub max_include_depth: usize,
    #[serde(default)]
    pub retry: RetryDefaults,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerDefaults,
}

fn default_max_iterations() -> u32 {
    100
}

fn default_max_parallel() -> usize {
    5
}

fn default_max_include_depth() -> usize {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            evaluator: EvaluatorMode::default(),
            execution_mode: ExecutionMode::default(),
            conflict_policy: ConflictPolicy::default(),
            default_max_iterations: default_max_iterations(),
            default_max_parallel: default_max_parallel(),
            max_include_depth: default_max_include_depth(),
            retry: RetryDefaults::default(),
            circuit_breaker: CircuitBreakerDefaults::default(),
        }
    }
}

/// Backoff ceiling applied on top of per-step handler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryDefaults {
    /// Hard upper bound on any computed retry delay.
    #[serde(default = "default_delay_ceiling_ms")]
    pub delay_ceiling_ms: u64,
    /// Force jitter on for every retrying handler.
    #[serde(default)]
    pub force_jitter: bool,
}

fn default_delay_ceiling_ms() -> u64 {
    300_000
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            delay_ceiling_ms: default_delay_ceiling_ms(),
            force_jitter: false,
        }
    }
}

/// Circuit breaker tuning shared by every breaker in an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerDefaults {
    /// Probe calls admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for CircuitBreakerDefaults {
    fn default() -> Self {
        Self {
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.evaluator, EvaluatorMode::Full);
        assert_eq!(config.execution_mode, ExecutionMode::Concurrent);
        assert_eq!(config.conflict_policy, ConflictPolicy::LastWriterWins);
        assert_eq!(config.default_max_iterations, 100);
        assert_eq!(config.default_max_parallel, 5);
        assert_eq!(config.max_include_depth, 5);
        assert_eq!(config.circuit_breaker.half_open_max_calls, 1);
    }

    #[test]
    fn test_engine_config_empty_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_toml_overrides() {
        let toml_str = r#"
evaluator = "basic"
execution_mode = "serial"
conflict_policy = "merge"
default_max_iterations = 20

[retry]
delay_ceiling_ms = 1000
force_jitter = true

[circuit_breaker]
half_open_max_calls = 2
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.evaluator, EvaluatorMode::Basic);
        assert_eq!(config.execution_mode, ExecutionMode::Serial);
        assert_eq!(config.conflict_policy, ConflictPolicy::Merge);
        assert_eq!(config.default_max_iterations, 20);
        assert_eq!(config.default_max_parallel, 5);
        assert_eq!(config.retry.delay_ceiling_ms, 1000);
        assert!(config.retry.force_jitter);
        assert_eq!(config.circuit_breaker.half_open_max_calls, 2);
    }

    #[test]
    fn test_engine_config_toml_roundtrip() {
        let config = EngineConfig {
            execution_mode: ExecutionMode::Serial,
            ..EngineConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
