//! Async driver: runs a workflow to completion against a [`StepHandler`].
//!
//! The main cursor is driven on the calling task. Each sub-agent of a
//! `Batch` runs on its own tokio task in a `JoinSet`, so sub-agents proceed
//! concurrently up to the step's `max_parallel`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use loomflow_types::error::ErrorPayload;
use loomflow_types::workflow::{ExecutableStep, NextStep, StepResult, SubAgentStatus, WorkflowStatus};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::QueueExecutor;
use crate::error::EngineError;

/// Default pause between polls while waiting on sub-agents with nothing to
/// join.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Executes the external steps the engine hands out.
///
/// Failures are data, not errors: return [`StepResult::Failure`] and the
/// step's error handler decides what happens next.
pub trait StepHandler: Send + Sync + 'static {
    fn execute(&self, step: &ExecutableStep) -> impl std::future::Future<Output = StepResult> + Send;
}

/// How a driven workflow ended.
#[derive(Debug, Clone, Serialize)]
pub struct DriveSummary {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    /// Handler invocations, retries and sub-agent steps included.
    pub steps_executed: usize,
    pub retries: usize,
    pub sub_agents: usize,
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorPayload>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    steps: usize,
    retries: usize,
    sub_agents: usize,
}

impl Counters {
    fn absorb(&mut self, workflow_id: Uuid, joined: Result<Counters, tokio::task::JoinError>) {
        match joined {
            Ok(run) => {
                self.steps += run.steps;
                self.retries += run.retries;
            }
            Err(err) => {
                tracing::error!(workflow_id = %workflow_id, error = %err, "sub-agent task aborted");
            }
        }
    }
}

pub struct WorkflowDriver<H> {
    executor: Arc<QueueExecutor>,
    handler: Arc<H>,
    cancel: CancellationToken,
    poll_interval: Duration,
    step_timeout: Option<Duration>,
}

impl<H: StepHandler> WorkflowDriver<H> {
    pub fn new(executor: Arc<QueueExecutor>, handler: H) -> Self {
        Self {
            executor,
            handler: Arc::new(handler),
            cancel: CancellationToken::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            step_timeout: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Fail any handler call that takes longer than `timeout` with error
    /// type `timeout`.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive `workflow_id` until it completes, fails or is cancelled.
    ///
    /// A workflow failure is reported through the summary; `Err` means the
    /// engine itself was misused (unknown workflow, bad report).
    pub async fn run(&self, workflow_id: Uuid) -> Result<DriveSummary, EngineError> {
        let mut counters = Counters::default();
        let mut tasks: JoinSet<Counters> = JoinSet::new();

        loop {
            if self.cancel.is_cancelled() {
                tasks.abort_all();
                self.executor.cancel(workflow_id)?;
                break;
            }

            let next = match self.executor.get_next_step(workflow_id) {
                Ok(next) => next,
                Err(err) => {
                    if self.executor.get_workflow_status(workflow_id)?.status.is_terminal() {
                        tracing::debug!(workflow_id = %workflow_id, error = %err, "workflow stopped");
                        break;
                    }
                    return Err(err);
                }
            };

            match next {
                NextStep::Step(step) => {
                    let result = tokio::select! {
                        result = execute(self.handler.as_ref(), &step, self.step_timeout) => result,
                        _ = self.cancel.cancelled() => continue,
                    };
                    counters.steps += 1;
                    let outcome = self.executor.report_step_result(workflow_id, &step.id, result)?;
                    if let Some(delay) = outcome.retry_delay() {
                        counters.retries += 1;
                        self.pause(delay).await;
                    }
                    if outcome.workflow_status.is_terminal() {
                        break;
                    }
                }
                NextStep::Batch(batch) => {
                    tracing::debug!(
                        workflow_id = %workflow_id,
                        step_id = %batch.step_id,
                        tasks = batch.task_ids.len(),
                        "spawning sub-agents"
                    );
                    for task_id in batch.task_ids {
                        counters.sub_agents += 1;
                        tasks.spawn(run_sub_agent(
                            Arc::clone(&self.executor),
                            Arc::clone(&self.handler),
                            workflow_id,
                            task_id,
                            self.step_timeout,
                            self.cancel.clone(),
                        ));
                    }
                }
                NextStep::Waiting(_) if tasks.is_empty() => self.pause(self.poll_interval).await,
                NextStep::Waiting(_) => {
                    tokio::select! {
                        Some(joined) = tasks.join_next() => counters.absorb(workflow_id, joined),
                        _ = self.cancel.cancelled() => {}
                    }
                }
                NextStep::Complete => break,
            }
        }

        let status = self.executor.get_workflow_status(workflow_id)?;
        if status.status == WorkflowStatus::Completed {
            // Every task has resolved; collect the stragglers' counters.
            while let Some(joined) = tasks.join_next().await {
                counters.absorb(workflow_id, joined);
            }
        } else {
            tasks.abort_all();
        }
        let errors = self.executor.error_history(workflow_id)?.len();
        tracing::info!(
            workflow_id = %workflow_id,
            status = %status.status,
            steps = counters.steps,
            retries = counters.retries,
            sub_agents = counters.sub_agents,
            errors,
            "workflow drive finished"
        );
        Ok(DriveSummary {
            workflow_id,
            status: status.status,
            steps_executed: counters.steps,
            retries: counters.retries,
            sub_agents: counters.sub_agents,
            errors,
            failure: status.failure,
        })
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

/// Run one handler call, turning panics and timeouts into failures.
async fn execute<H: StepHandler>(handler: &H, step: &ExecutableStep, timeout: Option<Duration>) -> StepResult {
    let guarded = AssertUnwindSafe(handler.execute(step)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return StepResult::failure(
                    "timeout",
                    format!("step '{}' timed out after {}ms", step.id, limit.as_millis()),
                );
            }
        },
        None => guarded.await,
    };
    outcome.unwrap_or_else(|_| {
        tracing::error!(step_id = %step.id, task_id = ?step.task_id, "step handler panicked");
        StepResult::failure("handler_panicked", format!("handler panicked while running step '{}'", step.id))
    })
}

async fn run_sub_agent<H: StepHandler>(
    executor: Arc<QueueExecutor>,
    handler: Arc<H>,
    workflow_id: Uuid,
    task_id: String,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) -> Counters {
    let mut run = Counters::default();
    if let Err(err) = drive_sub_agent(&executor, handler.as_ref(), workflow_id, &task_id, timeout, &cancel, &mut run).await
    {
        tracing::warn!(workflow_id = %workflow_id, task_id = %task_id, error = %err, "sub-agent stopped");
        // The workflow may already be gone; nothing left to record then.
        let _ = executor.fail_sub_agent(workflow_id, &task_id, &err.to_string());
    }
    run
}

async fn drive_sub_agent<H: StepHandler>(
    executor: &QueueExecutor,
    handler: &H,
    workflow_id: Uuid,
    task_id: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    run: &mut Counters,
) -> Result<(), EngineError> {
    while let Some(step) = executor.get_next_sub_agent_step(workflow_id, task_id)? {
        let result = tokio::select! {
            result = execute(handler, &step, timeout) => result,
            _ = cancel.cancelled() => return Ok(()),
        };
        run.steps += 1;
        let outcome = executor.report_sub_agent_step_result(workflow_id, task_id, &step.id, result)?;
        if let Some(delay) = outcome.retry_delay() {
            run.retries += 1;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }
        if outcome.task_status.is_some_and(|s| s.is_resolved()) {
            return Ok(());
        }
    }
    if executor.sub_agent_status(workflow_id, task_id)? == SubAgentStatus::Active {
        executor.complete_sub_agent(workflow_id, task_id, None)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
