//! `loomflow run`: drive a workflow to completion with local step execution.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use loomflow_core::definition::ensure_valid;
use loomflow_core::executor::DriveSummary;
use loomflow_core::recovery::TrackedError;
use loomflow_core::{QueueExecutor, StartOptions, WorkflowDriver};
use loomflow_types::workflow::WorkflowStatus;

use super::handler::CliStepHandler;
use super::{ConfigArgs, LibraryArgs, load_definition, parse_inputs};
use crate::config::{ConfigOverrides, load_engine_config};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow YAML file.
    pub file: PathBuf,

    /// Workflow input as key=value; values are parsed as JSON when possible.
    #[arg(long = "input", value_name = "KEY=VALUE")]
    pub inputs: Vec<String>,

    /// Workflow inputs as a JSON object.
    #[arg(long = "inputs", value_name = "JSON")]
    pub inputs_json: Option<String>,

    /// Scripted answer for user_input steps, consumed in order (repeatable).
    #[arg(long = "answer", value_name = "TEXT")]
    pub answers: Vec<String>,

    /// Never read answers from stdin.
    #[arg(long)]
    pub no_input: bool,

    /// Run loops and sub-agents one step at a time.
    #[arg(long)]
    pub serial: bool,

    /// Use the basic expression evaluator.
    #[arg(long)]
    pub basic_evaluator: bool,

    /// Fail any single step that runs longer than this many seconds.
    #[arg(long, value_name = "SECS")]
    pub step_timeout: Option<u64>,

    #[command(flatten)]
    pub library: LibraryArgs,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Serialize)]
struct RunReport<'a> {
    workflow: &'a str,
    #[serde(flatten)]
    summary: &'a DriveSummary,
    state: Map<String, Value>,
    computed: Map<String, Value>,
    error_history: &'a [TrackedError],
}

pub async fn handle_run(args: RunArgs, json: bool, quiet: bool) -> Result<()> {
    let overrides = ConfigOverrides {
        serial: args.serial,
        basic_evaluator: args.basic_evaluator,
    };
    let config = overrides.apply(load_engine_config(&args.config.config).await);

    let library = args.library.load()?;
    let definition = load_definition(&args.file).await?;
    for issue in ensure_valid(&definition, Some(&library))? {
        if !quiet && !json {
            println!("  {} {issue}", style("!").yellow().bold());
        }
    }
    let inputs = parse_inputs(args.inputs_json.as_deref(), &args.inputs)?;
    let name = definition.name.clone();

    let executor = Arc::new(QueueExecutor::new(config).with_library(library));
    let workflow_id = executor
        .start_with(Arc::new(definition), inputs, StartOptions::default())
        .with_context(|| format!("Failed to start workflow '{name}'"))?;

    if !quiet && !json {
        println!(
            "  {} Running workflow '{}' ({})",
            style("*").green().bold(),
            style(&name).cyan(),
            style(workflow_id).dim()
        );
    }

    let interactive = !args.no_input && std::io::stdin().is_terminal();
    let handler = CliStepHandler::new(args.answers, interactive, quiet || json);
    let cancel = CancellationToken::new();
    let mut driver = WorkflowDriver::new(Arc::clone(&executor), handler).with_cancellation(cancel.clone());
    if let Some(secs) = args.step_timeout {
        driver = driver.with_step_timeout(Duration::from_secs(secs));
    }

    let watcher = tokio::spawn(async move {
        crate::shutdown_signal().await;
        tracing::info!("interrupt received, cancelling workflow");
        cancel.cancel();
    });
    let summary = driver.run(workflow_id).await;
    watcher.abort();
    let summary = summary?;

    let snapshot = executor.read(workflow_id)?;
    let history = executor.error_history(workflow_id)?;
    executor.release(workflow_id)?;

    if json {
        let report = RunReport {
            workflow: &name,
            summary: &summary,
            state: snapshot.state,
            computed: snapshot.computed,
            error_history: &history,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !quiet {
        print_summary(&name, &summary, &snapshot.state, &history)?;
    }

    match summary.status {
        WorkflowStatus::Completed => Ok(()),
        WorkflowStatus::Cancelled => bail!("Workflow '{name}' was cancelled"),
        status => match &summary.failure {
            Some(failure) => bail!("Workflow '{name}' {status}: {}", failure.message),
            None => bail!("Workflow '{name}' ended {status}"),
        },
    }
}

fn print_summary(
    name: &str,
    summary: &DriveSummary,
    state: &Map<String, Value>,
    history: &[TrackedError],
) -> Result<()> {
    let status = match summary.status {
        WorkflowStatus::Completed => style(summary.status.to_string()).green(),
        WorkflowStatus::Cancelled => style(summary.status.to_string()).yellow(),
        _ => style(summary.status.to_string()).red(),
    };
    println!();
    println!("  {} {}", style(name).bold(), status);
    println!(
        "  {} steps, {} retries, {} sub-agents, {} errors",
        summary.steps_executed, summary.retries, summary.sub_agents, summary.errors
    );

    if !history.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Step", "Type", "Action", "Recovered", "Message"]);
        for entry in history {
            let recovered = if entry.error.recovered {
                Cell::new("yes").fg(Color::Green)
            } else {
                Cell::new("no").fg(Color::Red)
            };
            table.add_row(vec![
                Cell::new(&entry.error.step_id),
                Cell::new(&entry.error.error_type),
                Cell::new(entry.action.to_string()),
                recovered,
                Cell::new(&entry.error.message),
            ]);
        }
        println!();
        println!("{table}");
    }

    if !state.is_empty() {
        println!();
        println!("  {}", style("Final state").bold());
        println!("{}", serde_json::to_string_pretty(state)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    fn run_args(dir: &std::path::Path, yaml: &str, extra: &[&str]) -> RunArgs {
        let file = dir.join("flow.yaml");
        std::fs::write(&file, yaml).unwrap();
        let config = dir.join("absent.toml");
        let mut argv = vec![
            "loomflow".to_string(),
            "run".to_string(),
            file.display().to_string(),
            "--no-input".to_string(),
            "--config".to_string(),
            config.display().to_string(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            _ => panic!("expected run"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_workflow_with_scripted_input() {
        let dir = tempfile::tempdir().unwrap();
        let args = run_args(
            dir.path(),
            r#"
name: greet-cli
inputs:
  who:
    type: string
    required: true
steps:
  - id: ask
    type: user_input
    prompt: "Name?"
    save_to: state.answer
  - id: echo
    type: shell_command
    command: "echo {{ state.answer }}-{{ inputs.who }}"
    save_to: state.out
"#,
            &["--input", "who=y", "--answer", "x"],
        );
        handle_run(args, false, true).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_workflow_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = run_args(
            dir.path(),
            r#"
name: broken
steps:
  - id: boom
    type: shell_command
    command: "exit 1"
"#,
            &[],
        );
        let err = handle_run(args, false, true).await.unwrap_err();
        assert!(err.to_string().starts_with("Workflow 'broken'"), "{err}");
    }

    #[tokio::test]
    async fn missing_required_input_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let args = run_args(
            dir.path(),
            "name: needs-input\ninputs:\n  n:\n    type: number\n    required: true\nsteps:\n  - id: hi\n    type: user_message\n    message: hi\n",
            &[],
        );
        let err = handle_run(args, false, true).await.unwrap_err();
        assert!(err.to_string().contains("needs-input"), "{err}");
    }
}
