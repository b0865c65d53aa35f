//! Workflow domain types for Loomflow.
//!
//! `WorkflowDefinition` is the immutable declarative description of a
//! workflow: its input schema, default state, computed-field schema, ordered
//! steps and the named sub-agent task templates used by `parallel_foreach`.
//! This module also holds the wire shapes the executor hands to callers
//! (`ExecutableStep`, `NextStep`) and the status records it reports back.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ErrorHandler, ErrorPayload};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The declarative workflow definition.
///
/// Loaded once by a definition loader and never mutated afterwards; every
/// running instance shares it behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name. Also the key used by `include_workflow`.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Declared inputs, validated on `start`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSpec>,
    /// Initial contents of the mutable `state` tier.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub default_state: Map<String, Value>,
    /// Computed-field schema.
    #[serde(default, skip_serializing_if = "StateSchema::is_empty")]
    pub state_schema: StateSchema,
    /// Ordered top-level steps.
    pub steps: Vec<StepDefinition>,
    /// Named templates referenced by `parallel_foreach` steps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_agent_tasks: BTreeMap<String, SubAgentTaskTemplate>,
    /// Extensible metadata (for future use / custom integrations).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Declared type of a workflow input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl InputType {
    /// Whether a JSON value satisfies this declared type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Object => value.is_object(),
            InputType::Any => true,
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::Array => "array",
            InputType::Object => "object",
            InputType::Any => "any",
        };
        write!(f, "{s}")
    }
}

/// Schema entry for one workflow input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Computed-field schema
// ---------------------------------------------------------------------------

/// `state_schema` block: currently only computed fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSchema {
    #[serde(default)]
    pub computed: BTreeMap<String, ComputedFieldDef>,
}

impl StateSchema {
    pub fn is_empty(&self) -> bool {
        self.computed.is_empty()
    }
}

/// A derived value recomputed whenever one of its sources changes.
///
/// ```yaml
/// computed:
///   doubled:
///     from: state.value
///     transform: "input * 2"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedFieldDef {
    pub from: FieldSource,
    pub transform: String,
}

/// One source path, bound as `input`, or a list bound as `input[0..n]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSource {
    Single(String),
    Many(Vec<String>),
}

impl FieldSource {
    /// All declared source paths in declaration order.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            FieldSource::Single(path) => vec![path.as_str()],
            FieldSource::Many(paths) => paths.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_many(&self) -> bool {
        matches!(self, FieldSource::Many(_))
    }
}

// ---------------------------------------------------------------------------
// Sub-agent task templates
// ---------------------------------------------------------------------------

/// Template instantiated once per item by a `parallel_foreach` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTaskTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Task input name -> expression evaluated against the parent snapshot
    /// extended with `item`, `index` and `total`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    /// Parent state paths (e.g. `state.config`) the task may read.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_state: Vec<String>,
    /// Steps executed by each sub-agent.
    pub steps: Vec<StepDefinition>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in a workflow or sub-agent template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step ID (e.g. "fetch-items"). Unique within a workflow.
    pub id: String,
    /// The kind of step and its type-specific fields.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Failure policy for external steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handler: Option<ErrorHandler>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            error_handler: None,
        }
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_index_var() -> String {
    "index".to_string()
}

fn default_true() -> bool {
    true
}

/// Step-specific payload, internally tagged by `type`:
///
/// ```yaml
/// - id: ask
///   type: user_input
///   prompt: "Continue?"
///   save_to: state.answer
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Branch on an expression.
    Conditional {
        condition: String,
        #[serde(default)]
        then_steps: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        else_steps: Vec<StepDefinition>,
    },
    /// Repeat `body` while `condition` holds, never more than `max_iterations`.
    WhileLoop {
        condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        body: Vec<StepDefinition>,
    },
    /// Run `steps` once per element of the `items` expression.
    Foreach {
        items: String,
        #[serde(default = "default_item_var")]
        item_var: String,
        #[serde(default = "default_index_var")]
        index_var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        steps: Vec<StepDefinition>,
    },
    /// Fan the `items` collection out to isolated sub-agents.
    ParallelForeach {
        items: String,
        sub_agent_task: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_parallel: Option<usize>,
        #[serde(default = "default_true")]
        wait_for_all: bool,
        /// Parent state path -> expression over
        /// `{outputs, errors, completed, failed, total}`.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        output_mapping: BTreeMap<String, String>,
    },
    Break,
    Continue,
    UserMessage {
        message: String,
    },
    ShellCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_to: Option<String>,
    },
    McpCall {
        tool: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        parameters: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_to: Option<String>,
    },
    UserInput {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_to: Option<String>,
    },
    /// Inline another named workflow's steps.
    IncludeWorkflow {
        workflow: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, Value>,
    },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Conditional { .. } => StepType::Conditional,
            StepKind::WhileLoop { .. } => StepType::WhileLoop,
            StepKind::Foreach { .. } => StepType::Foreach,
            StepKind::ParallelForeach { .. } => StepType::ParallelForeach,
            StepKind::Break => StepType::Break,
            StepKind::Continue => StepType::Continue,
            StepKind::UserMessage { .. } => StepType::UserMessage,
            StepKind::ShellCommand { .. } => StepType::ShellCommand,
            StepKind::McpCall { .. } => StepType::McpCall,
            StepKind::UserInput { .. } => StepType::UserInput,
            StepKind::IncludeWorkflow { .. } => StepType::IncludeWorkflow,
        }
    }

    /// Where a reported step output is written, if anywhere.
    pub fn save_to(&self) -> Option<&str> {
        match self {
            StepKind::ShellCommand { save_to, .. }
            | StepKind::McpCall { save_to, .. }
            | StepKind::UserInput { save_to, .. } => save_to.as_deref(),
            _ => None,
        }
    }

    /// Nested step lists owned by this step (branches, loop bodies).
    pub fn children(&self) -> Vec<&[StepDefinition]> {
        match self {
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => vec![then_steps.as_slice(), else_steps.as_slice()],
            StepKind::WhileLoop { body, .. } => vec![body.as_slice()],
            StepKind::Foreach { steps, .. } => vec![steps.as_slice()],
            _ => Vec::new(),
        }
    }
}

/// The step type tag as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Conditional,
    WhileLoop,
    Foreach,
    ParallelForeach,
    Break,
    Continue,
    UserMessage,
    ShellCommand,
    McpCall,
    UserInput,
    IncludeWorkflow,
}

impl StepType {
    /// Steps executed by the caller rather than by the engine itself.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            StepType::UserMessage | StepType::ShellCommand | StepType::McpCall | StepType::UserInput
        )
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, StepType::WhileLoop | StepType::Foreach)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Conditional => "conditional",
            StepType::WhileLoop => "while_loop",
            StepType::Foreach => "foreach",
            StepType::ParallelForeach => "parallel_foreach",
            StepType::Break => "break",
            StepType::Continue => "continue",
            StepType::UserMessage => "user_message",
            StepType::ShellCommand => "shell_command",
            StepType::McpCall => "mcp_call",
            StepType::UserInput => "user_input",
            StepType::IncludeWorkflow => "include_workflow",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Executor wire shapes
// ---------------------------------------------------------------------------

/// A step handed to the caller for execution: `{ id, type, definition }`.
///
/// `definition` is the step's payload with every `{{ expr }}` template
/// already resolved against the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub definition: Value,
    /// Set when the step belongs to a sub-agent task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// 1-based attempt number; greater than 1 after a retry.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

fn default_attempt() -> u32 {
    1
}

/// A batch of sub-agent tasks dispatched by a `parallel_foreach` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepBatch {
    pub step_id: String,
    pub execution_id: Uuid,
    pub steps: Vec<ExecutableStep>,
    pub task_ids: Vec<String>,
}

/// Result of `get_next_step`.
///
/// Serialises as a step object, a `{ steps: [...] }` batch, a waiting marker
/// or `null` on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextStep {
    Step(ExecutableStep),
    Batch(StepBatch),
    Waiting(WaitingOn),
    Complete,
}

impl NextStep {
    pub fn is_complete(&self) -> bool {
        matches!(self, NextStep::Complete)
    }
}

/// Why the main workflow cannot advance right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingOn {
    pub waiting_on: String,
    pub step_id: String,
    pub pending_tasks: Vec<String>,
}

/// Outcome of an external step, reported back by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    Success {
        #[serde(default)]
        output: Value,
    },
    Failure {
        error_type: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_data: Option<Value>,
    },
}

impl StepResult {
    pub fn success(output: Value) -> Self {
        StepResult::Success { output }
    }

    pub fn failure(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        StepResult::Failure {
            error_type: error_type.into(),
            message: message.into(),
            error_data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Waiting => "waiting",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of a sub-agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Registered,
    Active,
    Completed,
    Failed,
}

impl SubAgentStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, SubAgentStatus::Completed | SubAgentStatus::Failed)
    }
}

/// Summary of an active loop, innermost last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSummary {
    pub id: String,
    pub kind: String,
    pub iteration: u32,
    pub max_iterations: u32,
}

/// Snapshot returned by `get_workflow_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    /// Number of steps dispatched so far.
    pub current_step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub frame_depth: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_loops: Vec<LoopSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_sub_agents: Vec<String>,
    pub error_count: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorPayload>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
