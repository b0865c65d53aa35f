//! Local execution of external workflow steps.
//!
//! Messages go to stdout, shell commands run through `sh -c`, and user
//! input comes from scripted `--answer` values before falling back to
//! stdin. `mcp_call` has no client in the CLI and always fails.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;

use console::style;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};

use loomflow_core::StepHandler;
use loomflow_types::workflow::{ExecutableStep, StepResult, StepType};

pub struct CliStepHandler {
    answers: Mutex<VecDeque<String>>,
    /// Serialises prompts so concurrent sub-agents do not interleave.
    stdin: tokio::sync::Mutex<Option<BufReader<Stdin>>>,
    quiet: bool,
}

impl CliStepHandler {
    /// `interactive` enables stdin once scripted answers run out.
    pub fn new(answers: Vec<String>, interactive: bool, quiet: bool) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            stdin: tokio::sync::Mutex::new(interactive.then(|| BufReader::new(tokio::io::stdin()))),
            quiet,
        }
    }

    fn field<'a>(step: &'a ExecutableStep, key: &str) -> &'a str {
        step.definition.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    fn label(step: &ExecutableStep) -> String {
        match &step.task_id {
            Some(task) => format!("[{task}] "),
            None => String::new(),
        }
    }

    fn user_message(&self, step: &ExecutableStep) -> StepResult {
        if !self.quiet {
            println!(
                "  {} {}{}",
                style(">").cyan().bold(),
                style(Self::label(step)).dim(),
                Self::field(step, "message")
            );
        }
        StepResult::success(Value::Null)
    }

    async fn shell_command(&self, step: &ExecutableStep) -> StepResult {
        let command = Self::field(step, "command");
        tracing::debug!(step_id = %step.id, command, "running shell command");

        let output = match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(output) => output,
            Err(err) => return StepResult::failure("spawn_failed", format!("failed to spawn sh: {err}")),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if output.status.success() {
            return StepResult::success(parse_output(stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let code = output.status.code();
        let message = match code {
            Some(code) => format!("command exited with status {code}"),
            None => "command terminated by signal".to_string(),
        };
        StepResult::Failure {
            error_type: "exit_code".to_string(),
            message: if stderr.is_empty() { message } else { format!("{message}: {stderr}") },
            error_data: Some(json!({ "exit_code": code, "stdout": stdout, "stderr": stderr })),
        }
    }

    async fn user_input(&self, step: &ExecutableStep) -> StepResult {
        let prompt = Self::field(step, "prompt");
        let scripted = self.answers.lock().expect("answers lock poisoned").pop_front();
        if let Some(answer) = scripted {
            if !self.quiet {
                println!("  {} {}{} {}", style("?").yellow().bold(), style(Self::label(step)).dim(), prompt, style(&answer).cyan());
            }
            return StepResult::success(Value::String(answer));
        }

        let mut stdin = self.stdin.lock().await;
        let Some(reader) = stdin.as_mut() else {
            return StepResult::failure("no_input", format!("no answer available for prompt '{prompt}'"));
        };
        println!("  {} {}{}", style("?").yellow().bold(), style(Self::label(step)).dim(), prompt);
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => StepResult::failure("no_input", "stdin closed before an answer was given"),
            Ok(_) => StepResult::success(Value::String(line.trim_end_matches(['\r', '\n']).to_string())),
            Err(err) => StepResult::failure("io_error", format!("failed to read stdin: {err}")),
        }
    }
}

/// Structured stdout (a JSON object or array) is stored as data; anything
/// else is kept as text.
fn parse_output(stdout: String) -> Value {
    match serde_json::from_str::<Value>(&stdout) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        _ => Value::String(stdout),
    }
}

impl StepHandler for CliStepHandler {
    async fn execute(&self, step: &ExecutableStep) -> StepResult {
        match step.step_type {
            StepType::UserMessage => self.user_message(step),
            StepType::ShellCommand => self.shell_command(step).await,
            StepType::UserInput => self.user_input(step).await,
            StepType::McpCall => StepResult::failure(
                "unsupported",
                format!("no MCP client configured for tool '{}'", Self::field(step, "tool")),
            ),
            other => StepResult::failure("unsupported", format!("'{other}' steps are not executed by the CLI")),
        }
    }
}
