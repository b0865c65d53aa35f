//! Sub-agent task registry.
//!
//! Each task owns a [`StepCursor`] over its template steps, an isolated
//! input namespace (`item`, `index`, `total`, `inputs`) and an `output`
//! namespace that is the only thing it may write. Parent state is visible
//! only through the template's `shared_state` paths.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use loomflow_types::config::ConflictPolicy;
use loomflow_types::state::UpdateOperation;
use loomflow_types::workflow::{StepDefinition, SubAgentStatus};
use serde::Serialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::SubAgentError;
use crate::flow::StepCursor;
use crate::state::store::apply_operation;
use crate::state::{Scope, StateError, StatePath, json_type_name};

// ---------------------------------------------------------------------------
// SubAgentTask
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SubAgentTask {
    pub task_id: String,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    /// The `parallel_foreach` step that created this task.
    pub parent_step_id: String,
    pub template: String,
    pub index: usize,
    pub total: usize,
    pub item: Value,
    pub inputs: Map<String, Value>,
    pub status: SubAgentStatus,
    pub error: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub(crate) cursor: StepCursor,
    shared_paths: Vec<StatePath>,
    output: Map<String, Value>,
}

impl SubAgentTask {
    pub fn new(
        task_id: impl Into<String>,
        workflow_id: Uuid,
        execution_id: Uuid,
        parent_step_id: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_id,
            execution_id,
            parent_step_id: parent_step_id.into(),
            template: template.into(),
            index: 0,
            total: 1,
            item: Value::Null,
            inputs: Map::new(),
            status: SubAgentStatus::Registered,
            error: None,
            registered_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cursor: StepCursor::new(Arc::from(Vec::new())),
            shared_paths: Vec::new(),
            output: Map::new(),
        }
    }

    pub fn with_item(mut self, index: usize, total: usize, item: Value) -> Self {
        self.index = index;
        self.total = total;
        self.item = item;
        self
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_steps(mut self, steps: Arc<[StepDefinition]>) -> Self {
        self.cursor = StepCursor::new(steps);
        self
    }

    pub fn with_shared_paths(mut self, paths: Vec<StatePath>) -> Self {
        self.shared_paths = paths;
        self
    }

    pub fn output(&self) -> &Map<String, Value> {
        &self.output
    }

    pub fn step_count(&self) -> usize {
        self.cursor.steps_dispatched
    }

    /// The task's isolated scope. `parent` is the owning workflow's context
    /// (`{inputs, state, computed}`); only shared paths are copied from it.
    pub fn view(&self, parent: &Value) -> Value {
        let mut inputs = self.inputs.clone();
        let mut state = Map::new();
        let mut computed = Map::new();

        for path in &self.shared_paths {
            let Some(tier) = parent.get(path.scope().as_str()).and_then(Value::as_object) else {
                continue;
            };
            let target = match path.scope() {
                Scope::State => &mut state,
                Scope::Computed => &mut computed,
                Scope::Inputs => {
                    if path.root_key().is_some_and(|k| self.inputs.contains_key(k)) {
                        continue;
                    }
                    &mut inputs
                }
            };
            if path.segments().is_empty() {
                for (k, v) in tier {
                    target.entry(k.clone()).or_insert_with(|| v.clone());
                }
                continue;
            }
            if let Some(value) = path.lookup(tier) {
                if let Ok(slot) = path.slot(target) {
                    *slot = value.clone();
                }
            }
        }

        json!({
            "item": self.item,
            "index": self.index,
            "total": self.total,
            "inputs": inputs,
            "state": state,
            "computed": computed,
            "output": self.output,
        })
    }

    fn transition(&mut self, to: SubAgentStatus) -> Result<(), SubAgentError> {
        use SubAgentStatus::{Active, Completed, Failed, Registered};
        let allowed = matches!(
            (self.status, to),
            (Registered, Active) | (Active, Completed) | (Registered | Active, Failed)
        );
        if !allowed {
            return Err(SubAgentError::InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.status,
                to,
            });
        }
        match to {
            Active => self.started_at = Some(Utc::now()),
            Completed | Failed => self.finished_at = Some(Utc::now()),
            Registered => {}
        }
        self.status = to;
        Ok(())
    }

    /// Apply a batch of writes to `output`. All or nothing.
    pub(crate) fn apply_output(&mut self, ops: &[UpdateOperation]) -> Result<Vec<String>, SubAgentError> {
        let mut staged = Map::new();
        staged.insert("output".to_string(), Value::Object(self.output.clone()));
        let mut written = Vec::with_capacity(ops.len());

        for op in ops {
            let path = op.path.trim();
            let in_output = path == "output" || path.starts_with("output.") || path.starts_with("output[");
            if !in_output {
                return Err(SubAgentError::IsolationViolation {
                    task_id: self.task_id.clone(),
                    path: path.to_string(),
                });
            }
            let output_err = |source: StateError| SubAgentError::Output {
                task_id: self.task_id.clone(),
                path: path.to_string(),
                source,
            };
            let parsed = StatePath::parse(&format!("state.{path}")).map_err(output_err)?;
            apply_operation(&mut staged, &parsed, op, ConflictPolicy::LastWriterWins).map_err(output_err)?;
            written.push(path.to_string());
        }

        match staged.remove("output") {
            Some(Value::Object(map)) => {
                self.output = map;
                Ok(written)
            }
            Some(other) => Err(SubAgentError::Output {
                task_id: self.task_id.clone(),
                path: "output".to_string(),
                source: StateError::TypeMismatch {
                    path: "output".to_string(),
                    operation: "write".to_string(),
                    expected: "object",
                    found: json_type_name(&other).to_string(),
                },
            }),
            None => Ok(written),
        }
    }

    pub fn summary(&self) -> SubAgentSummary {
        SubAgentSummary {
            task_id: self.task_id.clone(),
            execution_id: self.execution_id,
            parent_step_id: self.parent_step_id.clone(),
            template: self.template.clone(),
            index: self.index,
            total: self.total,
            status: self.status,
            step_count: self.step_count(),
            error: self.error.clone(),
            output: Value::Object(self.output.clone()),
        }
    }
}

/// Read-only copy of a task for status reports and aggregation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubAgentSummary {
    pub task_id: String,
    pub execution_id: Uuid,
    pub parent_step_id: String,
    pub template: String,
    pub index: usize,
    pub total: usize,
    pub status: SubAgentStatus,
    pub step_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub output: Value,
}

// ---------------------------------------------------------------------------
// SubAgentManager
// ---------------------------------------------------------------------------

/// Registry of live sub-agent tasks, keyed by task id.
///
/// Entries are individually locked, so reports for sibling tasks never
/// contend with each other.
#[derive(Debug, Default)]
pub struct SubAgentManager {
    tasks: DashMap<String, Mutex<SubAgentTask>>,
}

impl SubAgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task: SubAgentTask) -> String {
        let task_id = task.task_id.clone();
        tracing::debug!(
            task_id = %task_id,
            workflow_id = %task.workflow_id,
            index = task.index,
            "sub-agent registered"
        );
        self.tasks.insert(task_id.clone(), Mutex::new(task));
        task_id
    }

    /// Run `f` with the task locked.
    pub fn with_task<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut SubAgentTask) -> R,
    ) -> Result<R, SubAgentError> {
        let entry = self
            .tasks
            .get(task_id)
            .ok_or_else(|| SubAgentError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        let mut task = entry.lock().expect("sub-agent task lock poisoned");
        Ok(f(&mut task))
    }

    /// `registered -> active`. Activating an active task is a no-op.
    pub fn activate(&self, task_id: &str) -> Result<(), SubAgentError> {
        self.with_task(task_id, |task| {
            if task.status == SubAgentStatus::Active {
                return Ok(());
            }
            task.transition(SubAgentStatus::Active)
        })?
    }

    /// Mark the task completed and return its final output.
    ///
    /// An object `output` is merged into the task's output namespace; any
    /// other non-null value is stored under `output.result`.
    pub fn complete(&self, task_id: &str, output: Option<Value>) -> Result<Value, SubAgentError> {
        self.with_task(task_id, |task| {
            task.transition(SubAgentStatus::Completed)?;
            match output {
                Some(Value::Object(map)) => task.output.extend(map),
                Some(Value::Null) | None => {}
                Some(other) => {
                    task.output.insert("result".to_string(), other);
                }
            }
            tracing::debug!(task_id, steps = task.step_count(), "sub-agent completed");
            Ok(Value::Object(task.output.clone()))
        })?
    }

    pub fn fail(&self, task_id: &str, error: impl Into<String>) -> Result<(), SubAgentError> {
        let error = error.into();
        self.with_task(task_id, |task| {
            task.transition(SubAgentStatus::Failed)?;
            tracing::warn!(task_id, workflow_id = %task.workflow_id, error = %error, "sub-agent failed");
            task.error = Some(error);
            Ok(())
        })?
    }

    /// Write to a task's `output` namespace. Any other path is an isolation
    /// violation and nothing is written.
    pub fn update_output(&self, task_id: &str, ops: &[UpdateOperation]) -> Result<Vec<String>, SubAgentError> {
        self.with_task(task_id, |task| task.apply_output(ops))?
    }

    pub fn view(&self, task_id: &str, parent: &Value) -> Result<Value, SubAgentError> {
        self.with_task(task_id, |task| task.view(parent))
    }

    pub fn status(&self, task_id: &str) -> Option<SubAgentStatus> {
        self.with_task(task_id, |task| task.status).ok()
    }

    pub fn summary(&self, task_id: &str) -> Option<SubAgentSummary> {
        self.with_task(task_id, |task| task.summary()).ok()
    }

    /// Tasks of one workflow, ordered by execution then index.
    pub fn tasks_for_workflow(&self, workflow_id: Uuid) -> Vec<SubAgentSummary> {
        let mut out: Vec<SubAgentSummary> = self
            .tasks
            .iter()
            .filter_map(|entry| {
                let task = entry.value().lock().expect("sub-agent task lock poisoned");
                (task.workflow_id == workflow_id).then(|| task.summary())
            })
            .collect();
        out.sort_by(|a, b| (a.execution_id, a.index).cmp(&(b.execution_id, b.index)));
        out
    }

    pub fn active_for_workflow(&self, workflow_id: Uuid) -> Vec<String> {
        self.tasks_for_workflow(workflow_id)
            .into_iter()
            .filter(|t| t.status == SubAgentStatus::Active)
            .map(|t| t.task_id)
            .collect()
    }

    pub fn remove(&self, task_id: &str) -> Option<SubAgentTask> {
        self.tasks
            .remove(task_id)
            .map(|(_, task)| task.into_inner().expect("sub-agent task lock poisoned"))
    }

    /// Drop every task of a workflow; returns how many were removed.
    pub fn forget_workflow(&self, workflow_id: Uuid) -> usize {
        let before = self.tasks.len();
        self.tasks
            .retain(|_, task| task.get_mut().expect("sub-agent task lock poisoned").workflow_id != workflow_id);
        before - self.tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
