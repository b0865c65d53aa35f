//! Engine configuration loading from `loomflow.toml`.

use std::path::Path;

use loomflow_types::config::{EngineConfig, EvaluatorMode, ExecutionMode};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "loomflow.toml";

/// Load engine settings from `path`.
///
/// A missing file yields defaults. An unreadable or malformed file logs a
/// warning and also yields defaults, so a bad config never blocks a run.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Command-line switches that take precedence over the file.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigOverrides {
    pub serial: bool,
    pub basic_evaluator: bool,
}

impl ConfigOverrides {
    pub fn apply(self, mut config: EngineConfig) -> EngineConfig {
        if self.serial {
            config.execution_mode = ExecutionMode::Serial;
        }
        if self.basic_evaluator {
            config.evaluator = EvaluatorMode::Basic;
        }
        config
    }
}
