//! The sub-agent half of the executor API.
//!
//! Each task walks its template's steps with its own cursor, held inside the
//! task. Calls here lock only the task (and briefly the owning run to check
//! it is still live), so sibling tasks progress independently.

use loomflow_types::error::WorkflowError;
use loomflow_types::state::UpdateOperation;
use loomflow_types::workflow::{ExecutableStep, StepResult, SubAgentStatus, WorkflowStatus};
use serde_json::Value;
use uuid::Uuid;

use super::ReportOutcome;
use super::instance::{WorkflowInstance, render_step};
use super::queue::{QueueExecutor, circuit_handler};
use crate::error::EngineError;
use crate::flow::{ParallelPolicy, StepWalker, WalkEvent};
use crate::recovery::RecoveryAction;
use crate::subagent::{ExecutionProgress, SubAgentError, SubAgentSummary, SubAgentTask};

/// Where a task's cursor ended up after advancing.
#[derive(Debug)]
pub(super) enum TaskAdvance {
    Step(ExecutableStep),
    /// Every step ran; the task still needs completing.
    Finished,
    /// Already completed or failed.
    Resolved,
    /// The task cannot go on; it should be failed with this message.
    Failed(String),
}

fn ensure_owned(instance: &WorkflowInstance, task: &SubAgentTask) -> Result<(), EngineError> {
    if task.workflow_id != instance.id {
        return Err(EngineError::TaskNotFound {
            task_id: task.task_id.clone(),
        });
    }
    Ok(())
}

fn ensure_active(instance: &WorkflowInstance) -> Result<(), EngineError> {
    let status = instance.status();
    if status.is_terminal() {
        return Err(EngineError::WorkflowTerminated {
            workflow_id: instance.id,
            status,
        });
    }
    Ok(())
}

impl QueueExecutor {
    // -----------------------------------------------------------------------
    // Cursor plumbing shared with serial mode
    // -----------------------------------------------------------------------

    /// Move a task to its next external step. Must not be called with the
    /// task locked.
    pub(super) fn advance_task(&self, instance: &WorkflowInstance, task_id: &str) -> Result<TaskAdvance, EngineError> {
        let parent = instance.store.context();
        self.orchestrator
            .manager()
            .with_task(task_id, |task| self.advance_locked(instance, task, &parent))?
    }

    fn advance_locked(
        &self,
        instance: &WorkflowInstance,
        task: &mut SubAgentTask,
        parent: &Value,
    ) -> Result<TaskAdvance, EngineError> {
        ensure_owned(instance, task)?;
        match task.status {
            SubAgentStatus::Completed | SubAgentStatus::Failed => return Ok(TaskAdvance::Resolved),
            SubAgentStatus::Registered => {
                return Err(SubAgentError::NotDispatched {
                    task_id: task.task_id.clone(),
                }
                .into());
            }
            SubAgentStatus::Active => {}
        }

        if let Some(pending) = task.cursor.dispatched.as_ref() {
            if pending.retry_pending {
                let scope = task.cursor.context.scope(&task.view(parent));
                if let Some(pending) = task.cursor.redispatch() {
                    return match render_step(
                        &pending.step,
                        &scope,
                        self.evaluator.as_ref(),
                        Some(task.task_id.as_str()),
                        pending.attempt,
                    ) {
                        Ok(step) => Ok(TaskAdvance::Step(step)),
                        Err(err) => Ok(TaskAdvance::Failed(err.to_string())),
                    };
                }
            }
            if let Some(acked) = task.cursor.take_dispatched() {
                self.registry.record_success(instance.id, &acked.step.id);
            }
        }

        loop {
            let env = self.walk_env(task.view(parent), instance.mode, ParallelPolicy::Skip);
            let event = match StepWalker::advance(&mut task.cursor.context, &env) {
                Ok(event) => event,
                Err(err) => return Ok(TaskAdvance::Failed(err.to_string())),
            };
            let (step, scope) = match event {
                WalkEvent::External { step, scope } => (step, scope),
                WalkEvent::Parallel { .. } => continue,
                WalkEvent::Finished => return Ok(TaskAdvance::Finished),
            };

            if let Some(handler) = circuit_handler(step.error_handler.as_ref()) {
                if !self.registry.check_circuit_breaker(instance.id, &step.id) {
                    let outcome = self.registry.reject_open_circuit(instance.id, &step.id, handler);
                    if !outcome.should_continue {
                        return Ok(TaskAdvance::Failed(outcome.message));
                    }
                    if let (Some(path), Some(value)) = (step.kind.save_to(), outcome.fallback_value) {
                        if let Err(err) = task.apply_output(&[UpdateOperation::set(path, value)]) {
                            return Ok(TaskAdvance::Failed(err.to_string()));
                        }
                    }
                    continue;
                }
            }

            let rendered = match render_step(&step, &scope, self.evaluator.as_ref(), Some(task.task_id.as_str()), 1) {
                Ok(rendered) => rendered,
                Err(err) => return Ok(TaskAdvance::Failed(err.to_string())),
            };
            tracing::debug!(
                workflow_id = %instance.id,
                task_id = %task.task_id,
                step_id = %step.id,
                "sub-agent step dispatched"
            );
            task.cursor.dispatch(step);
            return Ok(TaskAdvance::Step(rendered));
        }
    }

    /// Apply a reported result to a task's pending step. The second value is
    /// set when the task must be failed; the caller does that once the task
    /// lock is released. `workflow_status` is left for the caller to fill.
    pub(super) fn report_task_result(
        &self,
        instance: &WorkflowInstance,
        task_id: &str,
        step_id: &str,
        result: StepResult,
    ) -> Result<(ReportOutcome, Option<String>), EngineError> {
        self.orchestrator.manager().with_task(task_id, |task| {
            ensure_owned(instance, task)?;
            let Some(pending) = task.cursor.dispatched.clone() else {
                return Err(EngineError::UnknownStep {
                    step_id: step_id.to_string(),
                    expected: None,
                });
            };
            if pending.step.id != step_id {
                return Err(EngineError::UnknownStep {
                    step_id: step_id.to_string(),
                    expected: Some(pending.step.id),
                });
            }
            let save_to = pending.step.kind.save_to();
            let mut outcome = ReportOutcome::new(step_id, WorkflowStatus::Running);
            outcome.task_id = Some(task_id.to_string());
            let mut failure = None;

            match result {
                StepResult::Success { output } => {
                    task.cursor.take_dispatched();
                    if let Some(path) = save_to {
                        match task.apply_output(&[UpdateOperation::set(path, output.clone())]) {
                            Ok(_) => {
                                outcome.state_updates.insert(path.to_string(), output);
                            }
                            Err(err) => failure = Some(err.to_string()),
                        }
                    }
                    self.registry.record_success(instance.id, step_id);
                }
                StepResult::Failure {
                    error_type,
                    message,
                    error_data,
                } => {
                    let handler = pending.step.error_handler.clone().unwrap_or_default();
                    let mut error = WorkflowError::new(instance.id, step_id, error_type, message)
                        .with_retry_count(pending.attempt.saturating_sub(1));
                    if let Some(data) = error_data {
                        error = error.with_data(data);
                    }
                    let handling = self.registry.handle_error(error, &handler);

                    if handling.action == RecoveryAction::Retry {
                        if let Some(dispatched) = task.cursor.dispatched.as_mut() {
                            dispatched.retry_pending = true;
                        }
                    } else {
                        task.cursor.take_dispatched();
                        if !handling.should_continue {
                            failure = Some(handling.message.clone());
                        } else if let (Some(path), Some(value)) = (save_to, handling.fallback_value.clone()) {
                            match task.apply_output(&[UpdateOperation::set(path, value.clone())]) {
                                Ok(_) => {
                                    outcome.state_updates.insert(path.to_string(), value);
                                }
                                Err(err) => failure = Some(err.to_string()),
                            }
                        }
                    }
                    outcome.handling = Some(handling);
                }
            }
            Ok((outcome, failure))
        })?
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Next step of a dispatched task, or `None` once it has nothing left to
    /// run. A finished task is not completed here: the caller reports that
    /// with `complete_sub_agent`, optionally attaching a final output.
    pub fn get_next_sub_agent_step(
        &self,
        workflow_id: Uuid,
        task_id: &str,
    ) -> Result<Option<ExecutableStep>, EngineError> {
        let instance = self.instance(workflow_id)?;
        ensure_active(&instance)?;
        match self.advance_task(&instance, task_id)? {
            TaskAdvance::Step(step) => Ok(Some(step)),
            TaskAdvance::Finished | TaskAdvance::Resolved => Ok(None),
            TaskAdvance::Failed(message) => {
                self.orchestrator.fail_task(task_id, message)?;
                Ok(None)
            }
        }
    }

    /// Record the outcome of a sub-agent step. A failure the step's handler
    /// cannot absorb fails the task, never the parent workflow.
    pub fn report_sub_agent_step_result(
        &self,
        workflow_id: Uuid,
        task_id: &str,
        step_id: &str,
        result: StepResult,
    ) -> Result<ReportOutcome, EngineError> {
        let instance = self.instance(workflow_id)?;
        ensure_active(&instance)?;
        let (mut outcome, failure) = self.report_task_result(&instance, task_id, step_id, result)?;
        if let Some(message) = failure {
            self.orchestrator.fail_task(task_id, message)?;
        }
        outcome.task_status = self.orchestrator.manager().status(task_id);
        outcome.workflow_status = instance.status();
        Ok(outcome)
    }

    /// Mark a task completed. An object `output` is merged into what the
    /// task already wrote; any other value lands under `output.result`.
    pub fn complete_sub_agent(
        &self,
        workflow_id: Uuid,
        task_id: &str,
        output: Option<Value>,
    ) -> Result<ExecutionProgress, EngineError> {
        let instance = self.instance(workflow_id)?;
        ensure_active(&instance)?;
        let acked = self.orchestrator.manager().with_task(task_id, |task| {
            ensure_owned(&instance, task)?;
            Ok::<_, EngineError>(task.cursor.take_dispatched().map(|d| d.step.id))
        })??;
        if let Some(step_id) = acked {
            self.registry.record_success(workflow_id, &step_id);
        }
        let resolution = self.orchestrator.complete_task(task_id, output)?;
        Ok(resolution.progress)
    }

    pub fn fail_sub_agent(
        &self,
        workflow_id: Uuid,
        task_id: &str,
        error: &str,
    ) -> Result<ExecutionProgress, EngineError> {
        let instance = self.instance(workflow_id)?;
        ensure_active(&instance)?;
        self.orchestrator
            .manager()
            .with_task(task_id, |task| ensure_owned(&instance, task))??;
        Ok(self.orchestrator.fail_task(task_id, error)?.progress)
    }

    /// Write into a task's `output` namespace. Anything else is rejected
    /// with `ISOLATION_VIOLATION` and nothing is written.
    pub fn update_sub_agent(
        &self,
        workflow_id: Uuid,
        task_id: &str,
        ops: &[UpdateOperation],
    ) -> Result<Vec<String>, EngineError> {
        let instance = self.instance(workflow_id)?;
        ensure_active(&instance)?;
        self.orchestrator.manager().with_task(task_id, |task| {
            ensure_owned(&instance, task)?;
            Ok::<_, EngineError>(task.apply_output(ops)?)
        })?
    }

    pub fn sub_agent_status(&self, workflow_id: Uuid, task_id: &str) -> Result<SubAgentStatus, EngineError> {
        let instance = self.instance(workflow_id)?;
        self.orchestrator.manager().with_task(task_id, |task| {
            ensure_owned(&instance, task)?;
            Ok::<_, EngineError>(task.status)
        })?
    }

    /// Every task the workflow currently owns, by execution then index.
    pub fn sub_agent_tasks(&self, workflow_id: Uuid) -> Result<Vec<SubAgentSummary>, EngineError> {
        self.instance(workflow_id)?;
        Ok(self.orchestrator.manager().tasks_for_workflow(workflow_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse_workflow_yaml;
    use loomflow_types::config::EngineConfig;
    use loomflow_types::workflow::NextStep;
    use serde_json::{Map, json};

    const RETRYING: &str = r#"
name: fetch-all
inputs:
  urls:
    type: array
    required: true
steps:
  - id: fan
    type: parallel_foreach
    items: "inputs.urls"
    sub_agent_task: fetch
    output_mapping:
      state.bodies: "outputs"
      state.errors: "errors"
sub_agent_tasks:
  fetch:
    inputs:
      url: "item"
    steps:
      - id: get
        type: mcp_call
        tool: http_get
        parameters:
          url: "{{ inputs.url }}"
        save_to: output.body
        error_handler:
          strategy: retry
          retry_count: 1
          retry_delay_ms: 5
      - id: note
        type: user_message
        message: "fetched {{ output.body }}"
"#;

    fn start(exec: &QueueExecutor, urls: Value) -> (Uuid, Vec<String>) {
        let def = parse_workflow_yaml(RETRYING).unwrap();
        let mut inputs = Map::new();
        inputs.insert("urls".into(), urls);
        let id = exec.start(def, inputs).unwrap();
        let NextStep::Batch(batch) = exec.get_next_step(id).unwrap() else {
            panic!("expected a batch");
        };
        (id, batch.task_ids)
    }

    #[test]
    fn test_sub_agent_retry_then_output() {
        let exec = QueueExecutor::new(EngineConfig::default());
        let (id, tasks) = start(&exec, json!(["a"]));
        let task = &tasks[0];

        let get = exec.get_next_sub_agent_step(id, task).unwrap().unwrap();
        assert_eq!(get.definition["parameters"]["url"], "a");
        let outcome = exec
            .report_sub_agent_step_result(id, task, "get", StepResult::failure("timeout", "slow"))
            .unwrap();
        assert_eq!(outcome.retry_delay(), Some(std::time::Duration::from_millis(5)));
        assert_eq!(outcome.task_status, Some(SubAgentStatus::Active));

        let again = exec.get_next_sub_agent_step(id, task).unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        let outcome = exec
            .report_sub_agent_step_result(id, task, "get", StepResult::success(json!("<a>")))
            .unwrap();
        assert_eq!(outcome.state_updates["output.body"], json!("<a>"));

        let note = exec.get_next_sub_agent_step(id, task).unwrap().unwrap();
        assert_eq!(note.definition["message"], "fetched <a>");
        assert!(exec.get_next_sub_agent_step(id, task).unwrap().is_none());
        assert_eq!(exec.sub_agent_status(id, task).unwrap(), SubAgentStatus::Active);

        let progress = exec.complete_sub_agent(id, task, None).unwrap();
        assert!(progress.is_resolved());
        assert!(exec.get_next_step(id).unwrap().is_complete());
        assert_eq!(exec.read(id).unwrap().state["bodies"], json!([{"body": "<a>"}]));
    }

    #[test]
    fn test_sub_agent_failure_stays_local() {
        let exec = QueueExecutor::new(EngineConfig::default());
        let (id, tasks) = start(&exec, json!(["a", "b"]));

        for attempt in 1..=2 {
            let step = exec.get_next_sub_agent_step(id, &tasks[0]).unwrap().unwrap();
            assert_eq!(step.attempt, attempt);
            exec.report_sub_agent_step_result(id, &tasks[0], "get", StepResult::failure("http_500", "boom"))
                .unwrap();
        }
        assert_eq!(exec.sub_agent_status(id, &tasks[0]).unwrap(), SubAgentStatus::Failed);
        assert!(exec.get_next_sub_agent_step(id, &tasks[0]).unwrap().is_none());
        let NextStep::Waiting(waiting) = exec.get_next_step(id).unwrap() else {
            panic!("expected waiting");
        };
        assert_eq!(waiting.pending_tasks, vec![tasks[1].clone()]);
        assert_eq!(exec.get_workflow_status(id).unwrap().status, WorkflowStatus::Waiting);

        exec.get_next_sub_agent_step(id, &tasks[1]).unwrap();
        exec.report_sub_agent_step_result(id, &tasks[1], "get", StepResult::success(json!("<b>")))
            .unwrap();
        exec.complete_sub_agent(id, &tasks[1], Some(json!("done"))).unwrap();

        assert!(exec.get_next_step(id).unwrap().is_complete());
        let state = exec.read(id).unwrap().state;
        assert_eq!(state["bodies"], json!([null, {"body": "<b>", "result": "done"}]));
        assert_eq!(state["errors"][0]["index"], json!(0));
        assert_eq!(exec.get_workflow_status(id).unwrap().status, WorkflowStatus::Completed);
    }

    #[test]
    fn test_reports_are_checked_against_the_pending_step() {
        let exec = QueueExecutor::new(EngineConfig::default());
        let (id, tasks) = start(&exec, json!(["a"]));
        let err = exec
            .report_sub_agent_step_result(id, &tasks[0], "get", StepResult::success(json!(1)))
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_STEP");

        exec.get_next_sub_agent_step(id, &tasks[0]).unwrap();
        let err = exec
            .report_sub_agent_step_result(id, &tasks[0], "note", StepResult::success(json!(1)))
            .unwrap_err();
        assert_eq!(err.to_payload().context["expected"], json!("get"));
    }

    #[test]
    fn test_undispatched_task_cannot_complete() {
        let config = EngineConfig {
            default_max_parallel: 1,
            ..EngineConfig::default()
        };
        let exec = QueueExecutor::new(config);
        let (id, _) = start(&exec, json!(["a", "b"]));
        let tasks = exec.sub_agent_tasks(id).unwrap();
        assert_eq!(tasks.len(), 2);
        let waiting = &tasks[1].task_id;
        assert_eq!(exec.sub_agent_status(id, waiting).unwrap(), SubAgentStatus::Registered);

        let err = exec.complete_sub_agent(id, waiting, Some(json!("early"))).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(exec.sub_agent_status(id, waiting).unwrap(), SubAgentStatus::Registered);
        assert_eq!(exec.orchestrator.progress(tasks[1].execution_id).unwrap().completed, 0);
    }

    #[test]
    fn test_tasks_belong_to_their_workflow() {
        let exec = QueueExecutor::new(EngineConfig::default());
        let (first, tasks) = start(&exec, json!(["a"]));
        let (second, _) = start(&exec, json!(["b"]));

        let err = exec.get_next_sub_agent_step(second, &tasks[0]).unwrap_err();
        assert_eq!(err.code(), "TASK_NOT_FOUND");
        assert_eq!(exec.sub_agent_tasks(first).unwrap().len(), 1);

        exec.cancel(first).unwrap();
        let err = exec.get_next_sub_agent_step(first, &tasks[0]).unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_TERMINATED");
        assert!(exec.sub_agent_tasks(first).unwrap().is_empty());
    }
}
