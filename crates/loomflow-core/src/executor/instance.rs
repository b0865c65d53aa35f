//! One running workflow: its definition, state store and cursor.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use loomflow_types::config::ExecutionMode;
use loomflow_types::error::ErrorPayload;
use loomflow_types::workflow::{
    ExecutableStep, StepDefinition, StepKind, WorkflowDefinition, WorkflowStatus,
};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::EngineError;
use crate::expression::Evaluator;
use crate::expression::template::{interpolate_str, interpolate_value};
use crate::flow::{ControlFlowError, ExecutionContext, StepCursor};
use crate::state::{StateStore, json_type_name};

/// A `parallel_foreach` the main cursor is blocked on.
#[derive(Debug, Clone)]
pub(crate) struct ActiveParallel {
    pub execution_id: Uuid,
    pub step_id: String,
    pub wait_for_all: bool,
}

/// Mutable run state, guarded by the instance lock.
#[derive(Debug)]
pub(crate) struct RunState {
    pub status: WorkflowStatus,
    pub cursor: StepCursor,
    pub parallel: Option<ActiveParallel>,
    /// `wait_for_all: false` executions still running after the workflow
    /// moved on.
    pub detached: Vec<Uuid>,
    /// Serial mode: the sub-agent task currently driven inline.
    pub serial_task: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure: Option<ErrorPayload>,
}

impl RunState {
    /// Drop frames, loops and any pending step. Counters survive for
    /// status reports.
    pub fn clear_cursor(&mut self) {
        self.cursor.context = ExecutionContext::default();
        self.cursor.dispatched = None;
        self.parallel = None;
        self.detached.clear();
        self.serial_task = None;
    }

    pub fn finish(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.clear_cursor();
    }
}

#[derive(Debug)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition: Arc<WorkflowDefinition>,
    pub mode: ExecutionMode,
    pub store: StateStore,
    pub started_at: DateTime<Utc>,
    run: Mutex<RunState>,
}

impl WorkflowInstance {
    pub(crate) fn new(
        id: Uuid,
        definition: Arc<WorkflowDefinition>,
        mode: ExecutionMode,
        store: StateStore,
    ) -> Self {
        let cursor = StepCursor::new(Arc::from(definition.steps.as_slice()));
        Self {
            id,
            definition,
            mode,
            store,
            started_at: Utc::now(),
            run: Mutex::new(RunState {
                status: WorkflowStatus::Running,
                cursor,
                parallel: None,
                detached: Vec::new(),
                serial_task: None,
                completed_at: None,
                failure: None,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().expect("workflow run lock poisoned")
    }

    pub fn status(&self) -> WorkflowStatus {
        self.lock().status
    }
}

/// Apply the input schema: fill defaults, reject missing required inputs and
/// type mismatches. Undeclared inputs pass through untouched.
pub(crate) fn resolve_inputs(
    definition: &WorkflowDefinition,
    mut inputs: Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    for (name, spec) in &definition.inputs {
        let invalid = |reason: String| EngineError::InvalidInput {
            workflow: definition.name.clone(),
            input: name.clone(),
            reason,
        };
        match inputs.get(name) {
            Some(value) if !value.is_null() => {
                if !spec.input_type.accepts(value) {
                    return Err(invalid(format!(
                        "expected {}, got {}",
                        spec.input_type,
                        json_type_name(value)
                    )));
                }
            }
            _ => match &spec.default {
                Some(default) => {
                    inputs.insert(name.clone(), default.clone());
                }
                None if spec.required => {
                    return Err(invalid("required input is missing".to_string()));
                }
                None => {}
            },
        }
    }
    Ok(inputs)
}

/// Resolve an external step's templates into the `{ id, type, definition }`
/// record handed to callers.
pub(crate) fn render_step(
    step: &StepDefinition,
    scope: &Value,
    evaluator: &dyn Evaluator,
    task_id: Option<&str>,
    attempt: u32,
) -> Result<ExecutableStep, ControlFlowError> {
    let expression_err = |source| ControlFlowError::Expression {
        step_id: step.id.clone(),
        source,
    };
    let text = |s: &str| interpolate_str(s, scope, evaluator).map_err(expression_err);

    let mut definition = Map::new();
    match &step.kind {
        StepKind::UserMessage { message } => {
            definition.insert("message".into(), text(message)?);
        }
        StepKind::ShellCommand { command, .. } => {
            definition.insert("command".into(), text(command)?);
        }
        StepKind::McpCall { tool, parameters, .. } => {
            definition.insert("tool".into(), text(tool)?);
            definition.insert(
                "parameters".into(),
                interpolate_value(parameters, scope, evaluator).map_err(expression_err)?,
            );
        }
        StepKind::UserInput { prompt, .. } => {
            definition.insert("prompt".into(), text(prompt)?);
        }
        _ => {}
    }
    if let Some(path) = step.kind.save_to() {
        definition.insert("save_to".into(), json!(path));
    }

    Ok(ExecutableStep {
        id: step.id.clone(),
        step_type: step.step_type(),
        definition: Value::Object(definition),
        task_id: task_id.map(str::to_string),
        attempt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ExpressionEngine;
    use loomflow_types::workflow::{InputSpec, InputType, StepType};

    fn definition() -> WorkflowDefinition {
        serde_yaml_ng::from_str(
            r#"
name: inputs-demo
inputs:
  files:
    type: array
    required: true
  mode:
    type: string
    default: quick
steps: []
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_inputs_applies_defaults() {
        let mut inputs = Map::new();
        inputs.insert("files".into(), json!(["a.rs"]));
        inputs.insert("extra".into(), json!(1));
        let resolved = resolve_inputs(&definition(), inputs).unwrap();
        assert_eq!(resolved["mode"], json!("quick"));
        assert_eq!(resolved["extra"], json!(1));
    }

    #[test]
    fn test_resolve_inputs_rejects_missing_and_mistyped() {
        let err = resolve_inputs(&definition(), Map::new()).unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        assert!(err.to_string().contains("files"));

        let mut inputs = Map::new();
        inputs.insert("files".into(), json!("a.rs"));
        let err = resolve_inputs(&definition(), inputs).unwrap_err();
        assert!(err.to_string().contains("expected array, got string"));
    }

    #[test]
    fn test_optional_input_without_default_stays_absent() {
        let mut def = definition();
        def.inputs.insert(
            "label".into(),
            InputSpec {
                input_type: InputType::String,
                ..InputSpec::default()
            },
        );
        let mut inputs = Map::new();
        inputs.insert("files".into(), json!([]));
        let resolved = resolve_inputs(&def, inputs).unwrap();
        assert!(!resolved.contains_key("label"));
    }

    #[test]
    fn test_render_step_resolves_templates_only_in_payload() {
        let step: StepDefinition = serde_yaml_ng::from_str(
            r#"
id: read
type: mcp_call
tool: "{{ state.tool }}"
parameters:
  path: "{{ item }}"
  depth: 2
save_to: state.content
"#,
        )
        .unwrap();
        let scope = json!({"state": {"tool": "read_file"}, "item": "src/lib.rs"});
        let rendered = render_step(&step, &scope, &ExpressionEngine::new(), Some("t-1"), 2).unwrap();
        assert_eq!(rendered.step_type, StepType::McpCall);
        assert_eq!(rendered.task_id.as_deref(), Some("t-1"));
        assert_eq!(rendered.attempt, 2);
        assert_eq!(
            rendered.definition,
            json!({
                "tool": "read_file",
                "parameters": {"path": "src/lib.rs", "depth": 2},
                "save_to": "state.content"
            })
        );
    }

    #[test]
    fn test_render_step_reports_bad_template() {
        let step = StepDefinition::new(
            "greet",
            StepKind::UserMessage {
                message: "hi {{ 1 + }}".into(),
            },
        );
        let err = render_step(&step, &json!({}), &ExpressionEngine::new(), None, 1).unwrap_err();
        assert_eq!(err.step_id(), "greet");
    }
}
