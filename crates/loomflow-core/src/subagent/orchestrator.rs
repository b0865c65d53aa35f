//! `parallel_foreach` executions.
//!
//! One [`ParallelExecution`] per invocation: an ordered list of tasks, a
//! concurrency bound and per-slot status. Dispatch never lets more than
//! `max_parallel` tasks run at once; a resolved task frees exactly one slot.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use loomflow_types::state::UpdateOperation;
use loomflow_types::workflow::{StepDefinition, StepKind, SubAgentStatus, SubAgentTaskTemplate};
use serde::Serialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::SubAgentError;
use super::manager::{SubAgentManager, SubAgentTask};
use crate::expression::Evaluator;
use crate::state::{StatePath, json_type_name};
use crate::suggest::closest_match;

// ---------------------------------------------------------------------------
// Public records
// ---------------------------------------------------------------------------

/// What `process_parallel_foreach` created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionDescriptor {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: String,
    pub template: String,
    /// One task per item, in item order.
    pub task_ids: Vec<String>,
    pub max_parallel: usize,
    pub wait_for_all: bool,
}

impl ExecutionDescriptor {
    pub fn total(&self) -> usize {
        self.task_ids.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ExecutionProgress {
    pub fn is_resolved(&self) -> bool {
        self.completed + self.failed == self.total
    }

    pub fn all_dispatched(&self) -> bool {
        self.pending == 0
    }
}

/// Returned when a task resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskResolution {
    pub execution_id: Uuid,
    pub progress: ExecutionProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub index: usize,
    pub error: String,
}

/// Merged results of one execution, the scope of `output_mapping`
/// expressions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelAggregate {
    /// Task outputs by item index; `null` for failed or unresolved tasks.
    pub outputs: Vec<Value>,
    pub errors: Vec<TaskFailure>,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

impl ParallelAggregate {
    pub fn to_context(&self) -> Value {
        json!({
            "outputs": self.outputs,
            "errors": self.errors,
            "completed": self.completed,
            "failed": self.failed,
            "total": self.total,
        })
    }
}

// ---------------------------------------------------------------------------
// ParallelExecution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug)]
struct ParallelExecution {
    descriptor: ExecutionDescriptor,
    output_mapping: BTreeMap<String, String>,
    slots: Vec<Slot>,
    created_at: DateTime<Utc>,
}

impl ParallelExecution {
    fn count(&self, slot: Slot) -> usize {
        self.slots.iter().filter(|s| **s == slot).count()
    }

    fn progress(&self) -> ExecutionProgress {
        ExecutionProgress {
            total: self.slots.len(),
            pending: self.count(Slot::Pending),
            running: self.count(Slot::Running),
            completed: self.count(Slot::Completed),
            failed: self.count(Slot::Failed),
        }
    }
}

// ---------------------------------------------------------------------------
// ParallelOrchestrator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ParallelOrchestrator {
    default_max_parallel: usize,
    manager: SubAgentManager,
    executions: DashMap<Uuid, Mutex<ParallelExecution>>,
}

impl ParallelOrchestrator {
    pub fn new(default_max_parallel: usize) -> Self {
        Self {
            default_max_parallel: default_max_parallel.max(1),
            manager: SubAgentManager::new(),
            executions: DashMap::new(),
        }
    }

    pub fn manager(&self) -> &SubAgentManager {
        &self.manager
    }

    /// Split a `parallel_foreach` step into one registered task per item.
    ///
    /// `scope` is the parent's expression scope; task input expressions see
    /// it plus `item`, `index` and `total`. Nothing is registered unless
    /// every input evaluates.
    pub fn process_parallel_foreach(
        &self,
        workflow_id: Uuid,
        step: &StepDefinition,
        templates: &BTreeMap<String, SubAgentTaskTemplate>,
        scope: &Value,
        evaluator: &dyn Evaluator,
    ) -> Result<ExecutionDescriptor, SubAgentError> {
        let StepKind::ParallelForeach {
            items,
            sub_agent_task,
            max_parallel,
            wait_for_all,
            output_mapping,
        } = &step.kind
        else {
            return Err(SubAgentError::NotParallel {
                step_id: step.id.clone(),
            });
        };
        let template = templates
            .get(sub_agent_task)
            .ok_or_else(|| SubAgentError::UnknownTemplate {
                step_id: step.id.clone(),
                template: sub_agent_task.clone(),
                suggestion: closest_match(sub_agent_task, templates.keys().map(String::as_str)),
            })?;
        let expression_err = |source| SubAgentError::Expression {
            step_id: step.id.clone(),
            source,
        };

        let items = match evaluator.evaluate_json(items, scope).map_err(expression_err)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(SubAgentError::NotIterable {
                    step_id: step.id.clone(),
                    found: json_type_name(&other),
                });
            }
        };
        let shared_paths = template
            .shared_state
            .iter()
            .map(|p| StatePath::parse(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| SubAgentError::SharedPath {
                template: sub_agent_task.clone(),
                source,
            })?;

        let total = items.len();
        let mut prepared = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let mut task_scope = match scope {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            task_scope.insert("item".to_string(), item.clone());
            task_scope.insert("index".to_string(), json!(index));
            task_scope.insert("total".to_string(), json!(total));
            let task_scope = Value::Object(task_scope);

            let mut inputs = Map::new();
            for (name, expr) in &template.inputs {
                inputs.insert(name.clone(), evaluator.evaluate_json(expr, &task_scope).map_err(expression_err)?);
            }
            prepared.push((index, item, inputs));
        }

        let execution_id = Uuid::now_v7();
        let suffix = execution_id.simple().to_string();
        let suffix = &suffix[suffix.len() - 8..];
        let steps: Arc<[StepDefinition]> = Arc::from(template.steps.as_slice());
        let mut task_ids = Vec::with_capacity(total);
        for (index, item, inputs) in prepared {
            let task = SubAgentTask::new(
                format!("{}-{index}-{suffix}", step.id),
                workflow_id,
                execution_id,
                step.id.clone(),
                sub_agent_task.clone(),
            )
            .with_item(index, total, item)
            .with_inputs(inputs)
            .with_steps(Arc::clone(&steps))
            .with_shared_paths(shared_paths.clone());
            task_ids.push(self.manager.register(task));
        }

        let descriptor = ExecutionDescriptor {
            execution_id,
            workflow_id,
            step_id: step.id.clone(),
            template: sub_agent_task.clone(),
            task_ids,
            max_parallel: max_parallel.unwrap_or(self.default_max_parallel).max(1),
            wait_for_all: *wait_for_all,
        };
        tracing::info!(
            workflow_id = %workflow_id,
            step_id = %step.id,
            execution_id = %execution_id,
            tasks = total,
            max_parallel = descriptor.max_parallel,
            "parallel execution started"
        );
        self.executions.insert(
            execution_id,
            Mutex::new(ParallelExecution {
                descriptor: descriptor.clone(),
                output_mapping: output_mapping.clone(),
                slots: vec![Slot::Pending; total],
                created_at: Utc::now(),
            }),
        );
        Ok(descriptor)
    }

    fn with_execution<R>(
        &self,
        execution_id: Uuid,
        f: impl FnOnce(&mut ParallelExecution) -> R,
    ) -> Result<R, SubAgentError> {
        let entry = self
            .executions
            .get(&execution_id)
            .ok_or(SubAgentError::ExecutionNotFound { execution_id })?;
        let mut execution = entry.lock().expect("parallel execution lock poisoned");
        Ok(f(&mut execution))
    }

    /// Dispatch up to `max_parallel - running` pending tasks, in item order.
    pub fn get_next_available_tasks(&self, execution_id: Uuid) -> Result<Vec<String>, SubAgentError> {
        self.dispatch(execution_id, usize::MAX)
    }

    /// Dispatch at most one pending task. Serial mode runs tasks this way.
    pub fn dispatch_next(&self, execution_id: Uuid) -> Result<Option<String>, SubAgentError> {
        Ok(self.dispatch(execution_id, 1)?.into_iter().next())
    }

    fn dispatch(&self, execution_id: Uuid, limit: usize) -> Result<Vec<String>, SubAgentError> {
        let task_ids = self.with_execution(execution_id, |execution| {
            let running = execution.count(Slot::Running);
            let free = execution.descriptor.max_parallel.saturating_sub(running).min(limit);
            let mut picked = Vec::new();
            for (index, slot) in execution.slots.iter_mut().enumerate() {
                if picked.len() == free {
                    break;
                }
                if *slot == Slot::Pending {
                    *slot = Slot::Running;
                    picked.push(index);
                }
            }
            picked
                .into_iter()
                .map(|i| execution.descriptor.task_ids[i].clone())
                .collect::<Vec<_>>()
        })?;
        for task_id in &task_ids {
            self.manager.activate(task_id)?;
        }
        if !task_ids.is_empty() {
            tracing::debug!(execution_id = %execution_id, dispatched = task_ids.len(), "sub-agents dispatched");
        }
        Ok(task_ids)
    }

    pub fn complete_task(&self, task_id: &str, output: Option<Value>) -> Result<TaskResolution, SubAgentError> {
        let (execution_id, index) = self.manager.with_task(task_id, |t| (t.execution_id, t.index))?;
        self.manager.complete(task_id, output)?;
        self.resolve_slot(execution_id, index, Slot::Completed)
    }

    /// Record a task failure. Siblings keep running.
    pub fn fail_task(&self, task_id: &str, error: impl Into<String>) -> Result<TaskResolution, SubAgentError> {
        let (execution_id, index) = self.manager.with_task(task_id, |t| (t.execution_id, t.index))?;
        self.manager.fail(task_id, error)?;
        self.resolve_slot(execution_id, index, Slot::Failed)
    }

    fn resolve_slot(&self, execution_id: Uuid, index: usize, to: Slot) -> Result<TaskResolution, SubAgentError> {
        let progress = self.with_execution(execution_id, |execution| {
            if let Some(slot) = execution.slots.get_mut(index) {
                *slot = to;
            }
            execution.progress()
        })?;
        if progress.is_resolved() {
            tracing::info!(
                execution_id = %execution_id,
                completed = progress.completed,
                failed = progress.failed,
                "parallel execution resolved"
            );
        }
        Ok(TaskResolution { execution_id, progress })
    }

    pub fn progress(&self, execution_id: Uuid) -> Result<ExecutionProgress, SubAgentError> {
        self.with_execution(execution_id, |execution| execution.progress())
    }

    pub fn descriptor(&self, execution_id: Uuid) -> Result<ExecutionDescriptor, SubAgentError> {
        self.with_execution(execution_id, |execution| execution.descriptor.clone())
    }

    /// Tasks not yet completed or failed.
    pub fn unresolved_tasks(&self, execution_id: Uuid) -> Result<Vec<String>, SubAgentError> {
        self.with_execution(execution_id, |execution| {
            execution
                .slots
                .iter()
                .zip(&execution.descriptor.task_ids)
                .filter(|(slot, _)| matches!(slot, Slot::Pending | Slot::Running))
                .map(|(_, id)| id.clone())
                .collect()
        })
    }

    pub fn aggregate(&self, execution_id: Uuid) -> Result<ParallelAggregate, SubAgentError> {
        let task_ids = self.with_execution(execution_id, |e| e.descriptor.task_ids.clone())?;
        let mut aggregate = ParallelAggregate {
            outputs: Vec::with_capacity(task_ids.len()),
            errors: Vec::new(),
            completed: 0,
            failed: 0,
            total: task_ids.len(),
        };
        for task_id in &task_ids {
            let summary = self
                .manager
                .summary(task_id)
                .ok_or_else(|| SubAgentError::TaskNotFound {
                    task_id: task_id.clone(),
                })?;
            match summary.status {
                SubAgentStatus::Completed => {
                    aggregate.completed += 1;
                    aggregate.outputs.push(summary.output);
                }
                SubAgentStatus::Failed => {
                    aggregate.failed += 1;
                    aggregate.outputs.push(Value::Null);
                    aggregate.errors.push(TaskFailure {
                        task_id: summary.task_id,
                        index: summary.index,
                        error: summary.error.unwrap_or_default(),
                    });
                }
                SubAgentStatus::Registered | SubAgentStatus::Active => aggregate.outputs.push(Value::Null),
            }
        }
        Ok(aggregate)
    }

    /// Parent-state writes declared by the step's `output_mapping`, each
    /// expression evaluated over the aggregate.
    pub fn output_updates(
        &self,
        execution_id: Uuid,
        evaluator: &dyn Evaluator,
    ) -> Result<Vec<UpdateOperation>, SubAgentError> {
        let (step_id, mapping) = self.with_execution(execution_id, |e| {
            (e.descriptor.step_id.clone(), e.output_mapping.clone())
        })?;
        if mapping.is_empty() {
            return Ok(Vec::new());
        }
        let context = self.aggregate(execution_id)?.to_context();
        mapping
            .iter()
            .map(|(path, expr)| {
                evaluator
                    .evaluate_json(expr, &context)
                    .map(|value| UpdateOperation::set(path.clone(), value))
                    .map_err(|source| SubAgentError::Expression {
                        step_id: step_id.clone(),
                        source,
                    })
            })
            .collect()
    }

    /// Remove an execution and its tasks.
    pub fn discard(&self, execution_id: Uuid) -> Option<ExecutionDescriptor> {
        let (_, execution) = self.executions.remove(&execution_id)?;
        let execution = execution.into_inner().expect("parallel execution lock poisoned");
        for task_id in &execution.descriptor.task_ids {
            self.manager.remove(task_id);
        }
        tracing::debug!(
            execution_id = %execution_id,
            age_ms = (Utc::now() - execution.created_at).num_milliseconds(),
            "parallel execution discarded"
        );
        Some(execution.descriptor)
    }

    pub fn executions_for_workflow(&self, workflow_id: Uuid) -> Vec<Uuid> {
        self.executions
            .iter()
            .filter(|entry| {
                entry.value().lock().expect("parallel execution lock poisoned").descriptor.workflow_id
                    == workflow_id
            })
            .map(|entry| *entry.key())
            .collect()
    }

    /// Drop every execution and task belonging to a workflow.
    pub fn forget_workflow(&self, workflow_id: Uuid) -> usize {
        let ids = self.executions_for_workflow(workflow_id);
        for id in &ids {
            self.discard(*id);
        }
        self.manager.forget_workflow(workflow_id);
        ids.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ExpressionEngine;
    use loomflow_types::workflow::WorkflowDefinition;

    const DEF: &str = r#"
name: fan-out
steps:
  - id: fan
    type: parallel_foreach
    items: "inputs.files"
    sub_agent_task: review
    max_parallel: 2
    output_mapping:
      state.results: "outputs"
      state.failures: "failed"
sub_agent_tasks:
  review:
    inputs:
      path: "item.path"
      position: "index + 1"
    shared_state: [state.config]
    steps:
      - id: lint
        type: shell_command
        command: "lint {{ inputs.path }}"
"#;

    fn setup(files: usize) -> (ParallelOrchestrator, ExecutionDescriptor) {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(DEF).unwrap();
        let files: Vec<Value> = (0..files).map(|i| json!({"path": format!("f{i}.rs")})).collect();
        let scope = json!({"inputs": {"files": files}, "state": {}});
        let orchestrator = ParallelOrchestrator::new(5);
        let descriptor = orchestrator
            .process_parallel_foreach(
                Uuid::now_v7(),
                &def.steps[0],
                &def.sub_agent_tasks,
                &scope,
                &ExpressionEngine::new(),
            )
            .unwrap();
        (orchestrator, descriptor)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    #[test]
    fn test_one_task_per_item_with_mapped_inputs() {
        let (orchestrator, descriptor) = setup(3);
        assert_eq!(descriptor.total(), 3);
        assert_eq!(descriptor.max_parallel, 2);
        assert!(descriptor.wait_for_all);
        let view = orchestrator
            .manager()
            .view(&descriptor.task_ids[2], &json!({"state": {"config": 1}}))
            .unwrap();
        assert_eq!(view["inputs"], json!({"path": "f2.rs", "position": 3}));
        assert_eq!(view["total"], json!(3));
        assert_eq!(view["state"], json!({"config": 1}));
    }

    #[test]
    fn test_running_never_exceeds_max_parallel() {
        let (orchestrator, descriptor) = setup(5);
        let id = descriptor.execution_id;

        let first = orchestrator.get_next_available_tasks(id).unwrap();
        assert_eq!(first, descriptor.task_ids[..2].to_vec());
        assert!(orchestrator.get_next_available_tasks(id).unwrap().is_empty());

        let mut queue: Vec<String> = first;
        let mut finished = 0;
        while let Some(task_id) = queue.pop() {
            orchestrator.complete_task(&task_id, Some(json!({"ok": true}))).unwrap();
            finished += 1;
            let next = orchestrator.get_next_available_tasks(id).unwrap();
            assert!(next.len() <= 1, "a completion frees exactly one slot");
            queue.extend(next);
            assert!(orchestrator.progress(id).unwrap().running <= 2);
        }
        assert_eq!(finished, 5);
        assert!(orchestrator.progress(id).unwrap().is_resolved());
    }

    #[test]
    fn test_dispatch_next_takes_one_task() {
        let (orchestrator, descriptor) = setup(3);
        let id = descriptor.execution_id;
        let first = orchestrator.dispatch_next(id).unwrap();
        assert_eq!(first.as_deref(), Some(descriptor.task_ids[0].as_str()));
        assert_eq!(orchestrator.progress(id).unwrap().running, 1);
        orchestrator.complete_task(&descriptor.task_ids[0], None).unwrap();
        assert_eq!(
            orchestrator.dispatch_next(id).unwrap().as_deref(),
            Some(descriptor.task_ids[1].as_str())
        );
    }

    #[test]
    fn test_failure_is_isolated_and_aggregated() {
        let (orchestrator, descriptor) = setup(3);
        let id = descriptor.execution_id;
        orchestrator.get_next_available_tasks(id).unwrap();

        let resolution = orchestrator.fail_task(&descriptor.task_ids[0], "lint crashed").unwrap();
        assert!(!resolution.progress.is_resolved());
        let next = orchestrator.get_next_available_tasks(id).unwrap();
        assert_eq!(next, vec![descriptor.task_ids[2].clone()]);

        orchestrator.complete_task(&descriptor.task_ids[1], Some(json!({"n": 1}))).unwrap();
        let last = orchestrator.complete_task(&descriptor.task_ids[2], Some(json!({"n": 2}))).unwrap();
        assert!(last.progress.is_resolved());

        let aggregate = orchestrator.aggregate(id).unwrap();
        assert_eq!(aggregate.outputs, vec![Value::Null, json!({"n": 1}), json!({"n": 2})]);
        assert_eq!((aggregate.completed, aggregate.failed, aggregate.total), (2, 1, 3));
        assert_eq!(aggregate.errors[0].error, "lint crashed");

        let updates = orchestrator.output_updates(id, &ExpressionEngine::new()).unwrap();
        let failures = updates.iter().find(|u| u.path == "state.failures").unwrap();
        assert_eq!(failures.value, json!(1));
        let results = updates.iter().find(|u| u.path == "state.results").unwrap();
        assert_eq!(results.value, json!([null, {"n": 1}, {"n": 2}]));
    }

    #[test]
    fn test_discard_removes_tasks() {
        let (orchestrator, descriptor) = setup(2);
        assert_eq!(orchestrator.manager().len(), 2);
        assert!(orchestrator.discard(descriptor.execution_id).is_some());
        assert!(orchestrator.manager().is_empty());
        assert!(matches!(
            orchestrator.progress(descriptor.execution_id).unwrap_err(),
            SubAgentError::ExecutionNotFound { .. }
        ));
    }

    #[test]
    fn test_empty_collection_is_immediately_resolved() {
        let (orchestrator, descriptor) = setup(0);
        let progress = orchestrator.progress(descriptor.execution_id).unwrap();
        assert!(progress.is_resolved());
        assert!(orchestrator.get_next_available_tasks(descriptor.execution_id).unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    #[test]
    fn test_unknown_template_and_non_array() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(DEF).unwrap();
        let orchestrator = ParallelOrchestrator::new(5);
        let ev = ExpressionEngine::new();

        let mut step = def.steps[0].clone();
        if let StepKind::ParallelForeach { sub_agent_task, .. } = &mut step.kind {
            *sub_agent_task = "reviw".to_string();
        }
        let err = orchestrator
            .process_parallel_foreach(Uuid::now_v7(), &step, &def.sub_agent_tasks, &json!({}), &ev)
            .unwrap_err();
        match err {
            SubAgentError::UnknownTemplate { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("review"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = orchestrator
            .process_parallel_foreach(
                Uuid::now_v7(),
                &def.steps[0],
                &def.sub_agent_tasks,
                &json!({"inputs": {"files": "one.rs"}}),
                &ev,
            )
            .unwrap_err();
        assert_eq!(err.code(), "NOT_ITERABLE");
        assert!(orchestrator.manager().is_empty());
    }
}
