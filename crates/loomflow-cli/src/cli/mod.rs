//! CLI command definitions and dispatch for the `loomflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod handler;
pub mod run;
pub mod trace;
pub mod validate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::{Map, Value};

use loomflow_core::definition::load_workflow_file_async;
use loomflow_core::library::WorkflowLibrary;
use loomflow_types::workflow::WorkflowDefinition;

use crate::config::DEFAULT_CONFIG_FILE;

/// Run declarative workflows from the command line.
#[derive(Parser)]
#[command(name = "loomflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow file to completion.
    Run(run::RunArgs),

    /// Check a workflow file for structural errors.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,

        #[command(flatten)]
        library: LibraryArgs,
    },

    /// Show which workflows a workflow includes, transitively.
    Trace {
        /// Path to the workflow YAML file.
        file: PathBuf,

        #[command(flatten)]
        library: LibraryArgs,

        /// Deepest include level to follow (the file itself is level 0).
        #[arg(long, default_value = "5")]
        max_depth: usize,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Workflow files made available to `include_workflow` steps.
#[derive(Args, Debug, Clone, Default)]
pub struct LibraryArgs {
    /// Workflow file to register for includes (repeatable).
    #[arg(long = "include", value_name = "FILE")]
    pub includes: Vec<PathBuf>,
}

impl LibraryArgs {
    pub fn load(&self) -> Result<WorkflowLibrary> {
        let mut library = WorkflowLibrary::new();
        library
            .load_files(&self.includes)
            .context("Failed to load included workflows")?;
        Ok(library)
    }
}

/// Engine config file location shared by commands that build an engine.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Engine config file (missing file means defaults).
    #[arg(long, env = "LOOMFLOW_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}

/// Load a workflow file, turning definition errors into readable messages.
pub async fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file_async(file)
        .await
        .with_context(|| format!("Failed to load workflow {}", file.display()))
}

/// Merge `--inputs` JSON and `--input key=value` pairs into one input map.
///
/// Pair values are parsed as JSON when possible (`count=3` is a number),
/// otherwise kept as strings. Pairs override keys from the JSON object.
pub fn parse_inputs(json: Option<&str>, pairs: &[String]) -> Result<Map<String, Value>> {
    let mut inputs = match json {
        Some(text) => match serde_json::from_str::<Value>(text).context("--inputs is not valid JSON")? {
            Value::Object(map) => map,
            other => bail!("--inputs must be a JSON object, got {other}"),
        },
        None => Map::new(),
    };
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("invalid --input '{pair}': expected key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid --input '{pair}': empty key");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}
