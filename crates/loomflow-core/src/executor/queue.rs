//! The workflow half of the executor API.
//!
//! Every instance is guarded by its own run lock for the duration of a
//! `get_next_step` or `report_step_result` call; sub-agent reports for the
//! same workflow never take that lock for longer than a status check, so
//! siblings report concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use loomflow_types::config::{EngineConfig, ExecutionMode};
use loomflow_types::error::{ErrorHandler, ErrorPayload, ErrorStrategy, WorkflowError};
use loomflow_types::state::{StateSnapshot, UpdateOperation, UpdateResult};
use loomflow_types::workflow::{
    ExecutableStep, NextStep, StepBatch, StepResult, StepType, WaitingOn, WorkflowDefinition,
    WorkflowStatus, WorkflowStatusReport,
};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::instance::{ActiveParallel, RunState, WorkflowInstance, render_step, resolve_inputs};
use super::subagents::TaskAdvance;
use super::{ReportOutcome, StartOptions};
use crate::definition::ensure_valid;
use crate::error::EngineError;
use crate::expression::{Evaluator, evaluator_for};
use crate::flow::{ForeachMode, LoopState, ParallelPolicy, StepWalker, WalkEnv, WalkEvent};
use crate::library::WorkflowLibrary;
use crate::recovery::{ErrorHandlerRegistry, RecoveryAction, TrackedError};
use crate::state::StateStore;
use crate::subagent::ParallelOrchestrator;

/// Owns every live workflow instance plus the shared recovery and
/// sub-agent machinery.
#[derive(Debug)]
pub struct QueueExecutor {
    pub(super) config: EngineConfig,
    pub(super) evaluator: Arc<dyn Evaluator>,
    pub(super) registry: ErrorHandlerRegistry,
    pub(super) orchestrator: ParallelOrchestrator,
    library: Option<Arc<WorkflowLibrary>>,
    instances: DashMap<Uuid, Arc<WorkflowInstance>>,
}

impl QueueExecutor {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            evaluator: evaluator_for(config.evaluator),
            registry: ErrorHandlerRegistry::new(config.retry.clone(), config.circuit_breaker.clone()),
            orchestrator: ParallelOrchestrator::new(config.default_max_parallel),
            library: None,
            instances: DashMap::new(),
            config,
        }
    }

    /// Workflows reachable through `include_workflow`.
    pub fn with_library(mut self, library: WorkflowLibrary) -> Self {
        self.library = Some(Arc::new(library));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ErrorHandlerRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &ParallelOrchestrator {
        &self.orchestrator
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn start(&self, definition: WorkflowDefinition, inputs: Map<String, Value>) -> Result<Uuid, EngineError> {
        self.start_with(Arc::new(definition), inputs, StartOptions::default())
    }

    /// Create an instance: validate inputs, build the state store (which
    /// rejects cyclic computed schemas) and register it.
    pub fn start_with(
        &self,
        definition: Arc<WorkflowDefinition>,
        inputs: Map<String, Value>,
        options: StartOptions,
    ) -> Result<Uuid, EngineError> {
        if options.validate {
            for issue in ensure_valid(&definition, self.library.as_deref())? {
                tracing::warn!(workflow = %definition.name, "{issue}");
            }
        }
        let inputs = resolve_inputs(&definition, inputs)?;
        let store = StateStore::new(
            &definition.state_schema,
            inputs,
            definition.default_state.clone(),
            Arc::clone(&self.evaluator),
            self.config.conflict_policy,
        )?;

        let id = Uuid::now_v7();
        let mode = options.execution_mode.unwrap_or(self.config.execution_mode);
        tracing::info!(
            workflow_id = %id,
            workflow = %definition.name,
            steps = definition.steps.len(),
            mode = ?mode,
            evaluator = self.evaluator.name(),
            "workflow started"
        );
        self.instances
            .insert(id, Arc::new(WorkflowInstance::new(id, definition, mode, store)));
        Ok(id)
    }

    pub fn instance(&self, workflow_id: Uuid) -> Result<Arc<WorkflowInstance>, EngineError> {
        self.instances
            .get(&workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::WorkflowNotFound { workflow_id })
    }

    pub fn workflow_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.instances.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Stop a workflow. Its final state stays readable until `release`.
    pub fn cancel(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let instance = self.instance(workflow_id)?;
        let mut run = instance.lock();
        if run.status.is_terminal() {
            return Ok(());
        }
        run.finish(WorkflowStatus::Cancelled);
        self.teardown(workflow_id);
        tracing::info!(workflow_id = %workflow_id, "workflow cancelled");
        Ok(())
    }

    /// Drop an instance entirely, returning its final state.
    pub fn release(&self, workflow_id: Uuid) -> Result<StateSnapshot, EngineError> {
        let (_, instance) = self
            .instances
            .remove(&workflow_id)
            .ok_or(EngineError::WorkflowNotFound { workflow_id })?;
        self.orchestrator.forget_workflow(workflow_id);
        self.registry.release(workflow_id);
        tracing::debug!(workflow_id = %workflow_id, "workflow released");
        Ok(instance.store.read())
    }

    fn teardown(&self, workflow_id: Uuid) {
        let executions = self.orchestrator.forget_workflow(workflow_id);
        self.registry.teardown(workflow_id);
        if executions > 0 {
            tracing::debug!(workflow_id = %workflow_id, executions, "parallel executions discarded");
        }
    }

    fn complete(&self, instance: &WorkflowInstance, run: &mut RunState) {
        run.finish(WorkflowStatus::Completed);
        self.teardown(instance.id);
        tracing::info!(
            workflow_id = %instance.id,
            workflow = %instance.definition.name,
            steps = run.cursor.steps_dispatched,
            elapsed_ms = (chrono::Utc::now() - instance.started_at).num_milliseconds(),
            "workflow completed"
        );
    }

    pub(super) fn fail(&self, instance: &WorkflowInstance, run: &mut RunState, payload: ErrorPayload) {
        tracing::warn!(
            workflow_id = %instance.id,
            code = %payload.code,
            "workflow failed: {}",
            payload.message
        );
        run.failure = Some(payload);
        run.finish(WorkflowStatus::Failed);
        self.teardown(instance.id);
    }

    fn ensure_running(instance: &WorkflowInstance, run: &RunState) -> Result<(), EngineError> {
        if run.status.is_terminal() {
            return Err(EngineError::WorkflowTerminated {
                workflow_id: instance.id,
                status: run.status,
            });
        }
        Ok(())
    }

    pub(super) fn walk_env(&self, globals: Value, mode: ExecutionMode, parallel: ParallelPolicy) -> WalkEnv<'_> {
        WalkEnv {
            evaluator: self.evaluator.as_ref(),
            globals,
            library: self.library.as_deref(),
            default_max_iterations: self.config.default_max_iterations,
            max_include_depth: self.config.max_include_depth,
            foreach_mode: match mode {
                ExecutionMode::Concurrent => ForeachMode::Iterative,
                ExecutionMode::Serial => ForeachMode::Expanded,
            },
            parallel,
        }
    }

    // -----------------------------------------------------------------------
    // get_next_step
    // -----------------------------------------------------------------------

    /// Advance the workflow to its next externally executed step.
    ///
    /// A step still awaiting its result is treated as having succeeded with
    /// no output, unless a retry is pending, in which case it is handed out
    /// again. Any error raised while advancing fails the workflow.
    pub fn get_next_step(&self, workflow_id: Uuid) -> Result<NextStep, EngineError> {
        let instance = self.instance(workflow_id)?;
        let mut run = instance.lock();
        match run.status {
            WorkflowStatus::Completed => return Ok(NextStep::Complete),
            WorkflowStatus::Failed | WorkflowStatus::Cancelled => {
                Self::ensure_running(&instance, &run)?;
            }
            WorkflowStatus::Running | WorkflowStatus::Waiting => {}
        }

        match self.next_step(&instance, &mut run) {
            Ok(next) => Ok(next),
            Err(err) => {
                if !run.status.is_terminal() {
                    self.fail(&instance, &mut run, err.to_payload());
                }
                Err(err)
            }
        }
    }

    fn next_step(&self, instance: &WorkflowInstance, run: &mut RunState) -> Result<NextStep, EngineError> {
        if let Some(pending) = run.cursor.dispatched.as_ref() {
            if pending.retry_pending {
                let scope = run.cursor.context.scope(&instance.store.context());
                let Some(pending) = run.cursor.redispatch() else {
                    return Ok(NextStep::Complete);
                };
                tracing::debug!(workflow_id = %instance.id, step_id = %pending.step.id, attempt = pending.attempt, "step retried");
                let step = render_step(&pending.step, &scope, self.evaluator.as_ref(), None, pending.attempt)?;
                run.status = WorkflowStatus::Running;
                return Ok(NextStep::Step(step));
            }
            if let Some(acked) = run.cursor.take_dispatched() {
                tracing::debug!(workflow_id = %instance.id, step_id = %acked.step.id, "step acknowledged without result");
                self.registry.record_success(instance.id, &acked.step.id);
            }
        }

        loop {
            self.reap_detached(instance, run)?;

            if let Some(active) = run.parallel.clone() {
                match self.poll_parallel(instance, run, &active)? {
                    Some(next) => return Ok(next),
                    None => continue,
                }
            }

            let env = self.walk_env(instance.store.context(), instance.mode, ParallelPolicy::Yield);
            match StepWalker::advance(&mut run.cursor.context, &env)? {
                WalkEvent::External { step, scope } => {
                    if let Some(handler) = circuit_handler(step.error_handler.as_ref()) {
                        if !self.registry.check_circuit_breaker(instance.id, &step.id) {
                            self.reject_open_circuit(instance, run, &step.id, step.kind.save_to(), handler)?;
                            continue;
                        }
                    }
                    let rendered = render_step(&step, &scope, self.evaluator.as_ref(), None, 1)?;
                    tracing::debug!(workflow_id = %instance.id, step_id = %step.id, step_type = %rendered.step_type, "step dispatched");
                    run.cursor.dispatch(step);
                    run.status = WorkflowStatus::Running;
                    return Ok(NextStep::Step(rendered));
                }
                WalkEvent::Parallel { step, scope } => {
                    let descriptor = self.orchestrator.process_parallel_foreach(
                        instance.id,
                        &step,
                        &instance.definition.sub_agent_tasks,
                        &scope,
                        self.evaluator.as_ref(),
                    )?;
                    run.cursor.steps_dispatched += 1;
                    run.cursor.last_step_id = Some(step.id.clone());
                    run.parallel = Some(ActiveParallel {
                        execution_id: descriptor.execution_id,
                        step_id: step.id,
                        wait_for_all: descriptor.wait_for_all,
                    });
                }
                WalkEvent::Finished => {
                    if !run.detached.is_empty() {
                        let mut pending_tasks = Vec::new();
                        for execution_id in &run.detached {
                            pending_tasks.extend(self.orchestrator.unresolved_tasks(*execution_id)?);
                        }
                        run.status = WorkflowStatus::Waiting;
                        return Ok(NextStep::Waiting(WaitingOn {
                            waiting_on: "sub_agents".to_string(),
                            step_id: String::new(),
                            pending_tasks,
                        }));
                    }
                    self.complete(instance, run);
                    return Ok(NextStep::Complete);
                }
            }
        }
    }

    /// Drive the active `parallel_foreach`. `None` means it resolved (or was
    /// detached) and the walk may continue.
    fn poll_parallel(
        &self,
        instance: &WorkflowInstance,
        run: &mut RunState,
        active: &ActiveParallel,
    ) -> Result<Option<NextStep>, EngineError> {
        let execution_id = active.execution_id;
        if self.orchestrator.progress(execution_id)?.is_resolved() {
            run.parallel = None;
            run.serial_task = None;
            self.finish_parallel(instance, execution_id)?;
            return Ok(None);
        }

        if instance.mode == ExecutionMode::Serial {
            loop {
                if run.serial_task.is_none() {
                    run.serial_task = self.orchestrator.dispatch_next(execution_id)?;
                }
                let Some(task_id) = run.serial_task.clone() else {
                    return Ok(None);
                };
                match self.advance_task(instance, &task_id)? {
                    TaskAdvance::Step(step) => {
                        run.status = WorkflowStatus::Running;
                        return Ok(Some(NextStep::Step(step)));
                    }
                    TaskAdvance::Finished => {
                        self.orchestrator.complete_task(&task_id, None)?;
                    }
                    TaskAdvance::Failed(message) => {
                        self.orchestrator.fail_task(&task_id, message)?;
                    }
                    TaskAdvance::Resolved => {}
                }
                run.serial_task = None;
                if self.orchestrator.progress(execution_id)?.is_resolved() {
                    return Ok(None);
                }
            }
        }

        let task_ids = self.orchestrator.get_next_available_tasks(execution_id)?;
        let progress = self.orchestrator.progress(execution_id)?;
        if !active.wait_for_all && progress.all_dispatched() {
            tracing::debug!(workflow_id = %instance.id, execution_id = %execution_id, "parallel execution detached");
            run.parallel = None;
            run.detached.push(execution_id);
        }
        if !task_ids.is_empty() {
            let descriptor = self.orchestrator.descriptor(execution_id)?;
            let parent = instance.store.context();
            let mut steps = Vec::with_capacity(task_ids.len());
            for task_id in &task_ids {
                let view = self.orchestrator.manager().view(task_id, &parent)?;
                steps.push(ExecutableStep {
                    id: active.step_id.clone(),
                    step_type: StepType::ParallelForeach,
                    definition: json!({
                        "sub_agent_task": descriptor.template,
                        "execution_id": execution_id,
                        "context": view,
                    }),
                    task_id: Some(task_id.clone()),
                    attempt: 1,
                });
            }
            run.status = WorkflowStatus::Running;
            return Ok(Some(NextStep::Batch(StepBatch {
                step_id: active.step_id.clone(),
                execution_id,
                steps,
                task_ids,
            })));
        }
        if run.parallel.is_none() {
            return Ok(None);
        }
        run.status = WorkflowStatus::Waiting;
        Ok(Some(NextStep::Waiting(WaitingOn {
            waiting_on: "sub_agents".to_string(),
            step_id: active.step_id.clone(),
            pending_tasks: self.orchestrator.unresolved_tasks(execution_id)?,
        })))
    }

    /// Write `output_mapping` results into parent state and drop the
    /// execution.
    fn finish_parallel(&self, instance: &WorkflowInstance, execution_id: Uuid) -> Result<(), EngineError> {
        let updates = self.orchestrator.output_updates(execution_id, self.evaluator.as_ref())?;
        if !updates.is_empty() {
            instance.store.update(&updates)?;
        }
        if let Some(descriptor) = self.orchestrator.discard(execution_id) {
            tracing::info!(
                workflow_id = %instance.id,
                step_id = %descriptor.step_id,
                tasks = descriptor.total(),
                mapped = updates.len(),
                "parallel results merged"
            );
        }
        Ok(())
    }

    fn reap_detached(&self, instance: &WorkflowInstance, run: &mut RunState) -> Result<(), EngineError> {
        let mut still_running = Vec::with_capacity(run.detached.len());
        for execution_id in std::mem::take(&mut run.detached) {
            match self.orchestrator.progress(execution_id) {
                Ok(progress) if progress.is_resolved() => self.finish_parallel(instance, execution_id)?,
                Ok(_) => still_running.push(execution_id),
                Err(_) => {}
            }
        }
        run.detached = still_running;
        Ok(())
    }

    /// A circuit-guarded step whose breaker is open is not dispatched: it
    /// resolves to its fallback value or fails the workflow.
    fn reject_open_circuit(
        &self,
        instance: &WorkflowInstance,
        run: &mut RunState,
        step_id: &str,
        save_to: Option<&str>,
        handler: &ErrorHandler,
    ) -> Result<(), EngineError> {
        let outcome = self.registry.reject_open_circuit(instance.id, step_id, handler);
        if outcome.should_continue {
            if let (Some(path), Some(value)) = (save_to, outcome.fallback_value) {
                instance.store.update(&[UpdateOperation::set(path, value)])?;
            }
            tracing::debug!(workflow_id = %instance.id, step_id, "open circuit skipped step");
            return Ok(());
        }
        apply_error_updates(instance, &outcome.state_updates);
        let retry_after_ms = self
            .registry
            .breakers()
            .remaining_open(instance.id, step_id)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let err = EngineError::CircuitOpen {
            step_id: step_id.to_string(),
            retry_after_ms,
        };
        self.fail(instance, run, err.to_payload());
        Err(err)
    }

    // -----------------------------------------------------------------------
    // report_step_result
    // -----------------------------------------------------------------------

    /// Record the outcome of the step returned by the last `get_next_step`.
    ///
    /// Failures go through the step's error handler (default: `fail`). A
    /// `fail` outcome marks the workflow failed; the call itself still
    /// succeeds and says so in `workflow_status`.
    pub fn report_step_result(
        &self,
        workflow_id: Uuid,
        step_id: &str,
        result: StepResult,
    ) -> Result<ReportOutcome, EngineError> {
        let instance = self.instance(workflow_id)?;
        let mut run = instance.lock();
        Self::ensure_running(&instance, &run)?;

        if let Some(task_id) = run.serial_task.clone() {
            let (mut outcome, failure) = self.report_task_result(&instance, &task_id, step_id, result)?;
            if let Some(message) = failure {
                self.orchestrator.fail_task(&task_id, message)?;
                run.serial_task = None;
            }
            outcome.task_status = self.orchestrator.manager().status(&task_id);
            outcome.workflow_status = run.status;
            return Ok(outcome);
        }

        let Some(pending) = run.cursor.dispatched.clone() else {
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
        let mut outcome = ReportOutcome::new(step_id, run.status);

        match result {
            StepResult::Success { output } => {
                if let Some(path) = save_to {
                    outcome.state_updates = instance.store.update(&[UpdateOperation::set(path, output)])?.state_updates;
                }
                run.cursor.take_dispatched();
                self.registry.record_success(workflow_id, step_id);
                tracing::debug!(workflow_id = %workflow_id, step_id, attempt = pending.attempt, "step succeeded");
            }
            StepResult::Failure {
                error_type,
                message,
                error_data,
            } => {
                let handler = pending.step.error_handler.clone().unwrap_or_default();
                let mut error = WorkflowError::new(workflow_id, step_id, error_type, message)
                    .with_retry_count(pending.attempt.saturating_sub(1));
                if let Some(data) = error_data {
                    error = error.with_data(data);
                }
                let handling = self.registry.handle_error(error, &handler);

                if handling.action == RecoveryAction::Retry {
                    if let Some(dispatched) = run.cursor.dispatched.as_mut() {
                        dispatched.retry_pending = true;
                    }
                } else if handling.should_continue {
                    if let (Some(path), Some(value)) = (save_to, handling.fallback_value.clone()) {
                        outcome.state_updates = instance.store.update(&[UpdateOperation::set(path, value)])?.state_updates;
                    }
                    run.cursor.take_dispatched();
                } else {
                    run.cursor.take_dispatched();
                    apply_error_updates(&instance, &handling.state_updates);
                    let payload = ErrorPayload::new("STEP_FAILED", handling.message.clone())
                        .with_context("step_id", step_id)
                        .with_context("action", handling.action.to_string())
                        .with_context("attempts", pending.attempt);
                    self.fail(&instance, &mut run, payload);
                }
                outcome.handling = Some(handling);
            }
        }
        outcome.workflow_status = run.status;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // State and status
    // -----------------------------------------------------------------------

    /// Apply a batch of state writes atomically.
    pub fn update(&self, workflow_id: Uuid, ops: &[UpdateOperation]) -> Result<UpdateResult, EngineError> {
        let instance = self.instance(workflow_id)?;
        let status = instance.status();
        if status.is_terminal() {
            return Err(EngineError::WorkflowTerminated { workflow_id, status });
        }
        Ok(instance.store.update(ops)?)
    }

    pub fn read(&self, workflow_id: Uuid) -> Result<StateSnapshot, EngineError> {
        Ok(self.instance(workflow_id)?.store.read())
    }

    pub fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatusReport, EngineError> {
        let instance = self.instance(workflow_id)?;
        let run = instance.lock();
        Ok(WorkflowStatusReport {
            workflow_id,
            name: instance.definition.name.clone(),
            status: run.status,
            current_step_index: run.cursor.steps_dispatched,
            current_step_id: run
                .cursor
                .dispatched
                .as_ref()
                .map(|d| d.step.id.clone())
                .or_else(|| run.cursor.last_step_id.clone()),
            frame_depth: run.cursor.context.frame_depth(),
            active_loops: run.cursor.context.loops().iter().map(LoopState::summary).collect(),
            active_sub_agents: self.orchestrator.manager().active_for_workflow(workflow_id),
            error_count: self.registry.tracker().count_for_workflow(workflow_id),
            started_at: instance.started_at,
            completed_at: run.completed_at,
            failure: run.failure.clone(),
        })
    }

    /// Every handled error of this workflow, oldest first.
    pub fn error_history(&self, workflow_id: Uuid) -> Result<Vec<TrackedError>, EngineError> {
        self.instance(workflow_id)?;
        Ok(self.registry.history_for(workflow_id))
    }
}

pub(super) fn circuit_handler(handler: Option<&ErrorHandler>) -> Option<&ErrorHandler> {
    handler.filter(|h| h.strategy == ErrorStrategy::CircuitBreaker)
}

/// Best-effort write of a failure record; the failure itself stands either
/// way.
pub(super) fn apply_error_updates(instance: &WorkflowInstance, updates: &[UpdateOperation]) {
    if updates.is_empty() {
        return;
    }
    if let Err(err) = instance.store.update(updates) {
        tracing::warn!(workflow_id = %instance.id, error = %err, "could not record step failure in state");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use loomflow_types::workflow::SubAgentStatus;

    fn executor() -> QueueExecutor {
        QueueExecutor::new(EngineConfig::default())
    }

    /// Deserialize without structural validation so `start` sees the
    /// definition as written.
    fn def(yaml: &str) -> WorkflowDefinition {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn inputs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn expect_step(next: NextStep) -> ExecutableStep {
        match next {
            NextStep::Step(step) => step,
            other => panic!("expected a step, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Linear execution
    // -----------------------------------------------------------------------

    #[test]
    fn test_linear_workflow_runs_to_completion() {
        let exec = executor();
        let id = exec
            .start(
                def(r#"
name: hello
inputs:
  name:
    type: string
    required: true
steps:
  - id: greet
    type: user_message
    message: "Hello {{ inputs.name }}"
  - id: build
    type: shell_command
    command: "make {{ inputs.name }}"
    save_to: state.build
"#),
                inputs(json!({"name": "Ada"})),
            )
            .unwrap();

        let greet = expect_step(exec.get_next_step(id).unwrap());
        assert_eq!(greet.id, "greet");
        assert_eq!(greet.definition["message"], "Hello Ada");

        // Pulling again acknowledges the user message.
        let build = expect_step(exec.get_next_step(id).unwrap());
        assert_eq!(build.definition["command"], "make Ada");
        let outcome = exec
            .report_step_result(id, "build", StepResult::success(json!({"ok": true})))
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.state_updates["state.build"], json!({"ok": true}));

        assert!(exec.get_next_step(id).unwrap().is_complete());
        assert!(exec.get_next_step(id).unwrap().is_complete());
        let status = exec.get_workflow_status(id).unwrap();
        assert_eq!(status.status, WorkflowStatus::Completed);
        assert_eq!(status.current_step_index, 2);
        assert_eq!(status.frame_depth, 0);
        assert!(status.completed_at.is_some());
        assert_eq!(exec.read(id).unwrap().state["build"], json!({"ok": true}));
    }

    #[test]
    fn test_empty_workflow_completes_immediately() {
        let exec = executor();
        let id = exec
            .start_with(
                Arc::new(crate::definition::parse_workflow_yaml("name: empty\nsteps: []\n").unwrap()),
                Map::new(),
                StartOptions {
                    validate: true,
                    ..StartOptions::default()
                },
            )
            .unwrap();
        assert!(exec.get_next_step(id).unwrap().is_complete());
        assert_eq!(exec.get_workflow_status(id).unwrap().status, WorkflowStatus::Completed);
    }

    #[test]
    fn test_start_rejects_bad_inputs_and_cyclic_schema() {
        let exec = executor();
        let err = exec
            .start(
                def("name: needs-input\ninputs:\n  n:\n    type: number\n    required: true\nsteps: []\n"),
                Map::new(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        let err = exec
            .start(
                def(r#"
name: cyclic
state_schema:
  computed:
    a:
      from: computed.b
      transform: "input"
    b:
      from: computed.a
      transform: "input"
steps: []
"#),
                Map::new(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "CIRCULAR_DEPENDENCY");
        assert!(exec.workflow_ids().is_empty());
    }

    #[test]
    fn test_report_for_wrong_step_names_the_expected_one() {
        let exec = executor();
        let id = exec
            .start(
                def("name: one\nsteps:\n  - id: ask\n    type: user_input\n    prompt: \"?\"\n"),
                Map::new(),
            )
            .unwrap();
        let err = exec
            .report_step_result(id, "ask", StepResult::success(json!(1)))
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_STEP");

        exec.get_next_step(id).unwrap();
        let err = exec
            .report_step_result(id, "asks", StepResult::success(json!(1)))
            .unwrap_err();
        assert_eq!(err.to_payload().context["expected"], json!("ask"));
    }

    #[test]
    fn test_computed_fields_follow_updates() {
        let exec = executor();
        let id = exec
            .start(
                def(r#"
name: computed
default_state:
  value: 1
state_schema:
  computed:
    doubled:
      from: state.value
      transform: "input * 2"
steps: []
"#),
                Map::new(),
            )
            .unwrap();
        exec.update(id, &[UpdateOperation::set("state.value", json!(5))]).unwrap();
        assert_eq!(exec.read(id).unwrap().computed["doubled"], json!(10));
        exec.update(id, &[UpdateOperation::set("state.value", json!(7))]).unwrap();
        assert_eq!(exec.read(id).unwrap().computed["doubled"], json!(14));
    }

    // -----------------------------------------------------------------------
    // Loops
    // -----------------------------------------------------------------------

    #[test]
    fn test_while_loop_runs_until_condition_fails() {
        let exec = executor();
        let id = exec
            .start(
                def(r#"
name: counter
default_state:
  counter: 0
steps:
  - id: loop
    type: while_loop
    condition: "state.counter < 3"
    max_iterations: 10
    body:
      - id: tick
        type: shell_command
        command: "echo {{ state.counter }}"
"#),
                Map::new(),
            )
            .unwrap();

        let mut commands = Vec::new();
        loop {
            match exec.get_next_step(id).unwrap() {
                NextStep::Step(step) => {
                    commands.push(step.definition["command"].clone());
                    exec.update(id, &[UpdateOperation::increment("state.counter", 1)]).unwrap();
                    exec.report_step_result(id, "tick", StepResult::success(Value::Null)).unwrap();
                }
                NextStep::Complete => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(commands, vec![json!("echo 0"), json!("echo 1"), json!("echo 2")]);
        assert_eq!(exec.read(id).unwrap().state["counter"], json!(3));
    }

    #[test]
    fn test_loop_never_exceeds_max_iterations() {
        let exec = executor();
        let id = exec
            .start(
                def(r#"
name: forever
steps:
  - id: loop
    type: while_loop
    condition: "true"
    max_iterations: 4
    body:
      - id: tick
        type: user_message
        message: "tick"
"#),
                Map::new(),
            )
            .unwrap();
        let mut ticks = 0;
        while let NextStep::Step(_) = exec.get_next_step(id).unwrap() {
            ticks += 1;
            assert!(ticks <= 4);
        }
        assert_eq!(ticks, 4);
    }

    #[test]
    fn test_status_reports_active_loop() {
        let exec = executor();
        let id = exec
            .start(
                def(r#"
name: each
steps:
  - id: files
    type: foreach
    items: "['a', 'b']"
    item_var: file
    steps:
      - id: show
        type: user_message
        message: "{{ file }}"
"#),
                Map::new(),
            )
            .unwrap();
        exec.get_next_step(id).unwrap();
        let second = expect_step(exec.get_next_step(id).unwrap());
        assert_eq!(second.definition["message"], "b");
        let status = exec.get_workflow_status(id).unwrap();
        assert_eq!(status.current_step_id.as_deref(), Some("show"));
        assert_eq!(status.active_loops.len(), 1);
        assert_eq!(status.active_loops[0].id, "files");
        assert_eq!(status.active_loops[0].iteration, 1);
    }

    // -----------------------------------------------------------------------
    // Error strategies
    // -----------------------------------------------------------------------

    #[test]
    fn test_retry_then_success_marks_error_recovered() {
        let exec = executor();
        let id = exec
            .start(
                def(r#"
name: flaky
steps:
  - id: fetch
    type: mcp_call
    tool: http_get
    save_to: state.body
    error_handler:
      strategy: retry
      retry_count: 2
      retry_delay_ms: 10
"#),
                Map::new(),
            )
            .unwrap();

        assert_eq!(expect_step(exec.get_next_step(id).unwrap()).attempt, 1);
        let outcome = exec
            .report_step_result(id, "fetch", StepResult::failure("timeout", "no answer"))
            .unwrap();
        assert_eq!(outcome.retry_delay(), Some(std::time::Duration::from_millis(10)));
        assert_eq!(outcome.workflow_status, WorkflowStatus::Running);

        let retried = expect_step(exec.get_next_step(id).unwrap());
        assert_eq!(retried.id, "fetch");
        assert_eq!(retried.attempt, 2);
        exec.report_step_result(id, "fetch", StepResult::success(json!("<html>")))
            .unwrap();
        assert!(exec.get_next_step(id).unwrap().is_complete());

        let history = exec.error_history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, RecoveryAction::Retry);
        assert!(history[0].error.recovered);
    }

    #[test]
    fn test_exhausted_retries_fail_the_workflow() {
        let exec = executor();
        let id = exec
            .start(
                def(r#"
name: doomed
steps:
  - id: fetch
    type: shell_command
    command: "curl example.invalid"
    error_handler:
      strategy: retry
      retry_count: 1
      retry_delay_ms: 1
  - id: never
    type: user_message
    message: "unreachable"
"#),
                Map::new(),
            )
            .unwrap();

        exec.get_next_step(id).unwrap();
        exec.report_step_result(id, "fetch", StepResult::failure("exit_code", "6"))
            .unwrap();
        exec.get_next_step(id).unwrap();
        let outcome = exec
            .report_step_result(id, "fetch", StepResult::failure("exit_code", "6"))
            .unwrap();
        assert_eq!(outcome.workflow_status, WorkflowStatus::Failed);
        assert_eq!(
            outcome.handling.as_ref().map(|h| h.action),
            Some(RecoveryAction::Fail)
        );

        let err = exec.get_next_step(id).unwrap_err();
        assert_eq!(err.code(), "WORKFLOW_TERMINATED");
        let status = exec.get_workflow_status(id).unwrap();
        assert_eq!(status.failure.map(|f| f.code), Some("STEP_FAILED".to_string()));
        assert_eq!(status.error_count, 2);
        assert_eq!(exec.read(id).unwrap().state["last_error"]["step_id"], json!("fetch"));
        assert!(exec.update(id, &[UpdateOperation::set("state.x", json!(1))]).is_err());
    }

    #[test]
    fn test_continue_and_fallback_move_on() {
        let exec = executor();
        let id = exec
            .start(
                def(r#"
name: tolerant
steps:
  - id: optional
    type: shell_command
    command: "lint"
    error_handler:
      strategy: continue
  - id: lookup
    type: mcp_call
    tool: search
    save_to: state.hits
    error_handler:
      strategy: fallback
      fallback_value: []
  - id: done
    type: user_message
    message: "{{ state.hits.length }} hits"
"#),
                Map::new(),
            )
            .unwrap();

        exec.get_next_step(id).unwrap();
        let outcome = exec
            .report_step_result(id, "optional", StepResult::failure("exit_code", "1"))
            .unwrap();
        assert_eq!(outcome.handling.map(|h| h.action), Some(RecoveryAction::Continue));

        assert_eq!(expect_step(exec.get_next_step(id).unwrap()).id, "lookup");
        let outcome = exec
            .report_step_result(id, "lookup", StepResult::failure("unavailable", "503"))
            .unwrap();
        assert_eq!(outcome.state_updates["state.hits"], json!([]));

        let done = expect_step(exec.get_next_step(id).unwrap());
        assert_eq!(done.definition["message"], "0 hits");
        let history = exec.error_history(id).unwrap();
        assert!(history.iter().all(|e| e.error.workflow_id == id));
        assert!(history[1].error.recovered);
    }

    #[test]
    fn test_open_circuit_skips_dispatch_with_fallback() {
        let exec = executor();
        let id = exec
            .start(
                def(r#"
name: breaker
steps:
  - id: poll
    type: while_loop
    condition: "true"
    max_iterations: 4
    body:
      - id: call
        type: mcp_call
        tool: status
        save_to: state.status
        error_handler:
          strategy: circuit_breaker
          failure_threshold: 2
          circuit_timeout_ms: 60000
          delegate: continue
          fallback_value: cached
"#),
                Map::new(),
            )
            .unwrap();

        let mut dispatched = 0;
        while let NextStep::Step(step) = exec.get_next_step(id).unwrap() {
            dispatched += 1;
            exec.report_step_result(id, &step.id, StepResult::failure("unavailable", "down"))
                .unwrap();
        }
        assert_eq!(dispatched, 2, "the open circuit must fail fast without dispatching");
        assert_eq!(exec.read(id).unwrap().state["status"], json!("cached"));
        assert_eq!(exec.error_history(id).unwrap().len(), 4);
    }

    #[test]
    fn test_open_circuit_without_fallback_fails() {
        let exec = executor();
        let id = exec
            .start(
                def(r#"
name: breaker
steps:
  - id: call
    type: mcp_call
    tool: status
    error_handler:
      strategy: circuit_breaker
      failure_threshold: 1
"#),
                Map::new(),
            )
            .unwrap();
        exec.get_next_step(id).unwrap();
        let outcome = exec
            .report_step_result(id, "call", StepResult::failure("unavailable", "down"))
            .unwrap();
        assert_eq!(outcome.workflow_status, WorkflowStatus::Failed);
        let handling = outcome.handling.unwrap();
        assert_eq!(handling.action, RecoveryAction::CircuitBreaker);
        assert!(!handling.should_continue);
    }

    // -----------------------------------------------------------------------
    // Parallel execution
    // -----------------------------------------------------------------------

    const FAN_OUT: &str = r#"
name: review
inputs:
  files:
    type: array
    required: true
default_state:
  config:
    strict: true
steps:
  - id: fan
    type: parallel_foreach
    items: "inputs.files"
    sub_agent_task: lint
    max_parallel: 2
    output_mapping:
      state.results: "outputs"
      state.failed: "failed"
  - id: report
    type: user_message
    message: "{{ state.failed }} failed"
sub_agent_tasks:
  lint:
    inputs:
      path: "item"
    shared_state: [state.config]
    steps:
      - id: run-lint
        type: shell_command
        command: "lint {{ inputs.path }} strict={{ state.config.strict }}"
        save_to: output.lint
"#;

    #[test]
    fn test_parallel_foreach_dispatches_bounded_batches() {
        let exec = executor();
        let id = exec
            .start(def(FAN_OUT), inputs(json!({"files": ["a.rs", "b.rs", "c.rs"]})))
            .unwrap();

        let NextStep::Batch(batch) = exec.get_next_step(id).unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(batch.step_id, "fan");
        assert_eq!(batch.task_ids.len(), 2);
        assert_eq!(batch.steps[0].definition["context"]["inputs"]["path"], "a.rs");
        assert_eq!(batch.steps[0].definition["context"]["state"]["config"]["strict"], true);

        let NextStep::Waiting(waiting) = exec.get_next_step(id).unwrap() else {
            panic!("expected waiting");
        };
        assert_eq!(waiting.pending_tasks.len(), 3);
        assert_eq!(exec.get_workflow_status(id).unwrap().status, WorkflowStatus::Waiting);

        let first = &batch.task_ids[0];
        let step = exec.get_next_sub_agent_step(id, first).unwrap().unwrap();
        assert_eq!(step.task_id.as_deref(), Some(first.as_str()));
        assert_eq!(step.definition["command"], "lint a.rs strict=true");
        exec.report_sub_agent_step_result(id, first, "run-lint", StepResult::success(json!("clean")))
            .unwrap();
        assert!(exec.get_next_sub_agent_step(id, first).unwrap().is_none());
        exec.complete_sub_agent(id, first, None).unwrap();

        exec.fail_sub_agent(id, &batch.task_ids[1], "crashed").unwrap();

        let NextStep::Batch(rest) = exec.get_next_step(id).unwrap() else {
            panic!("expected the last task");
        };
        assert_eq!(rest.task_ids.len(), 1);
        let last = &rest.task_ids[0];
        exec.get_next_sub_agent_step(id, last).unwrap();
        exec.report_sub_agent_step_result(id, last, "run-lint", StepResult::success(json!("warn")))
            .unwrap();
        exec.complete_sub_agent(id, last, Some(json!({"reviewed": true}))).unwrap();

        let report = expect_step(exec.get_next_step(id).unwrap());
        assert_eq!(report.definition["message"], "1 failed");
        let state = exec.read(id).unwrap().state;
        assert_eq!(
            state["results"],
            json!([{"lint": "clean"}, null, {"lint": "warn", "reviewed": true}])
        );
        assert!(exec.orchestrator().manager().is_empty());
    }

    #[test]
    fn test_sub_agent_writes_are_isolated() {
        let exec = executor();
        let id = exec
            .start(def(FAN_OUT), inputs(json!({"files": ["a.rs"]})))
            .unwrap();
        let NextStep::Batch(batch) = exec.get_next_step(id).unwrap() else {
            panic!("expected a batch");
        };
        let task = &batch.task_ids[0];
        let err = exec
            .update_sub_agent(id, task, &[UpdateOperation::set("state.config", json!({}))])
            .unwrap_err();
        assert_eq!(err.code(), "ISOLATION_VIOLATION");
        exec.update_sub_agent(id, task, &[UpdateOperation::set("output.note", json!("hi"))])
            .unwrap();
        assert_eq!(exec.read(id).unwrap().state["config"], json!({"strict": true}));

        let err = exec.get_next_sub_agent_step(id, "nope").unwrap_err();
        assert_eq!(err.code(), "TASK_NOT_FOUND");
    }

    #[test]
    fn test_serial_mode_drives_sub_agents_inline() {
        let exec = executor();
        let id = exec
            .start_with(
                Arc::new(def(FAN_OUT)),
                inputs(json!({"files": ["a.rs", "b.rs"]})),
                StartOptions::serial(),
            )
            .unwrap();

        let mut seen = Vec::new();
        loop {
            match exec.get_next_step(id).unwrap() {
                NextStep::Step(step) if step.task_id.is_some() => {
                    seen.push(step.definition["command"].clone());
                    let status = exec.get_workflow_status(id).unwrap();
                    assert_eq!(status.active_sub_agents.len(), 1);
                    exec.report_step_result(id, &step.id, StepResult::success(json!("ok")))
                        .unwrap();
                }
                NextStep::Step(step) => {
                    assert_eq!(step.id, "report");
                    assert_eq!(step.definition["message"], "0 failed");
                }
                NextStep::Complete => break,
                other => panic!("serial mode never batches or waits: {other:?}"),
            }
        }
        assert_eq!(
            seen,
            vec![json!("lint a.rs strict=true"), json!("lint b.rs strict=true")]
        );
        assert_eq!(
            exec.read(id).unwrap().state["results"],
            json!([{"lint": "ok"}, {"lint": "ok"}])
        );
    }

    #[test]
    fn test_serial_sub_agent_failure_is_isolated() {
        let exec = executor();
        let id = exec
            .start_with(
                Arc::new(def(FAN_OUT)),
                inputs(json!({"files": ["a.rs", "b.rs"]})),
                StartOptions::serial(),
            )
            .unwrap();
        let first = expect_step(exec.get_next_step(id).unwrap());
        let outcome = exec
            .report_step_result(id, &first.id, StepResult::failure("exit_code", "2"))
            .unwrap();
        assert_eq!(outcome.task_status, Some(SubAgentStatus::Failed));
        assert_eq!(outcome.workflow_status, WorkflowStatus::Running);

        let second = expect_step(exec.get_next_step(id).unwrap());
        assert_ne!(second.task_id, first.task_id);
        exec.report_step_result(id, &second.id, StepResult::success(json!("ok")))
            .unwrap();
        let report = expect_step(exec.get_next_step(id).unwrap());
        assert_eq!(report.definition["message"], "1 failed");
    }

    #[test]
    fn test_empty_parallel_collection_continues() {
        let exec = executor();
        let id = exec.start(def(FAN_OUT), inputs(json!({"files": []}))).unwrap();
        let report = expect_step(exec.get_next_step(id).unwrap());
        assert_eq!(report.id, "report");
        assert_eq!(exec.read(id).unwrap().state["results"], json!([]));
    }

    // -----------------------------------------------------------------------
    // Includes and lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn test_include_workflow_binds_inputs() {
        let mut library = WorkflowLibrary::new();
        library.insert(def(r#"
name: greet
inputs:
  who:
    type: string
    default: world
steps:
  - id: say
    type: user_message
    message: "hello {{ inputs.who }} from {{ state.origin }}"
"#));
        let exec = executor().with_library(library);
        let id = exec
            .start(
                def(r#"
name: main
default_state:
  origin: main
steps:
  - id: inc
    type: include_workflow
    workflow: greet
    inputs:
      who: "{{ state.origin }}-user"
"#),
                Map::new(),
            )
            .unwrap();
        let say = expect_step(exec.get_next_step(id).unwrap());
        assert_eq!(say.definition["message"], "hello main-user from main");
        assert!(exec.get_next_step(id).unwrap().is_complete());
    }

    #[test]
    fn test_unknown_include_fails_with_suggestion() {
        let mut library = WorkflowLibrary::new();
        library.insert(def("name: greet\nsteps: []\n"));
        let exec = executor().with_library(library);
        let id = exec
            .start(
                def("name: main\nsteps:\n  - id: inc\n    type: include_workflow\n    workflow: gret\n"),
                Map::new(),
            )
            .unwrap();
        let err = exec.get_next_step(id).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_WORKFLOW");
        let status = exec.get_workflow_status(id).unwrap();
        assert_eq!(status.status, WorkflowStatus::Failed);
        assert_eq!(
            status.failure.unwrap().context["suggestion"],
            json!("greet")
        );
    }

    #[test]
    fn test_cancel_and_release() {
        let exec = executor();
        let id = exec
            .start(
                def("name: c\ndefault_state:\n  n: 1\nsteps:\n  - id: a\n    type: user_input\n    prompt: \"?\"\n"),
                Map::new(),
            )
            .unwrap();
        exec.get_next_step(id).unwrap();
        exec.cancel(id).unwrap();
        assert_eq!(exec.get_workflow_status(id).unwrap().status, WorkflowStatus::Cancelled);
        assert_eq!(exec.get_next_step(id).unwrap_err().code(), "WORKFLOW_TERMINATED");

        let snapshot = exec.release(id).unwrap();
        assert_eq!(snapshot.state["n"], json!(1));
        assert_eq!(exec.read(id).unwrap_err().code(), "WORKFLOW_NOT_FOUND");
    }
}
