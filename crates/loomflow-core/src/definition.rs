//! Workflow definition parsing and structural validation.
//!
//! Converts YAML (or JSON, which YAML accepts) into the canonical
//! `WorkflowDefinition` and reports every structural problem at once:
//! duplicate ids, misplaced break/continue, unknown task templates and
//! includes, unparsable expressions, invalid result paths, unresolvable
//! state references and computed-field cycles.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use loomflow_types::error::ErrorPayload;
use loomflow_types::workflow::{StepDefinition, StepKind, WorkflowDefinition};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::expression::{parser, template};
use crate::library::WorkflowLibrary;
use crate::state::{ComputedGraph, Scope, Segment, StatePath};
use crate::suggest::closest_match;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to parse workflow{}: {message}", at(.source_name))]
    Parse {
        source_name: Option<String>,
        message: String,
    },

    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workflow '{name}' is invalid: {}", summary(.issues))]
    Invalid {
        name: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("unknown workflow '{name}'{}", hint(.suggestion))]
    UnknownWorkflow {
        name: String,
        suggestion: Option<String>,
    },
}

fn at(source_name: &Option<String>) -> String {
    source_name
        .as_ref()
        .map(|s| format!(" '{s}'"))
        .unwrap_or_default()
}

fn hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{s}'?)"))
        .unwrap_or_default()
}

fn summary(issues: &[ValidationIssue]) -> String {
    let errors: Vec<String> = issues
        .iter()
        .filter(|i| i.severity == IssueSeverity::Error)
        .map(ToString::to_string)
        .collect();
    errors.join("; ")
}

impl DefinitionError {
    pub fn code(&self) -> &'static str {
        match self {
            DefinitionError::Parse { .. } => "DEFINITION_PARSE",
            DefinitionError::Io { .. } => "DEFINITION_IO",
            DefinitionError::Invalid { .. } => "DEFINITION_INVALID",
            DefinitionError::UnknownWorkflow { .. } => "UNKNOWN_WORKFLOW",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let payload = ErrorPayload::new(self.code(), self.to_string());
        match self {
            DefinitionError::Invalid { issues, .. } => payload.with_context(
                "issues",
                serde_json::to_value(issues).unwrap_or(Value::Null),
            ),
            DefinitionError::UnknownWorkflow {
                suggestion: Some(s),
                ..
            } => payload.with_context("suggestion", s.clone()),
            DefinitionError::Io { path, .. } => payload.with_context("file", path.clone()),
            _ => payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation issues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    fn error(code: &'static str, step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            code,
            step_id: step_id.map(str::to_string),
            message: message.into(),
            suggestion: None,
        }
    }

    fn warning(code: &'static str, step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            ..Self::error(code, step_id, message)
        }
    }

    fn suggest(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(step) = &self.step_id {
            write!(f, "step '{step}': ")?;
        }
        f.write_str(&self.message)?;
        if let Some(s) = &self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML or JSON document into a `WorkflowDefinition`, rejecting it
/// when validation reports any error.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    parse_named(yaml, None)
}

fn parse_named(text: &str, source_name: Option<String>) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(text).map_err(|e| DefinitionError::Parse {
            source_name,
            message: e.to_string(),
        })?;
    ensure_valid(&def, None)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse {
        source_name: Some(def.name.clone()),
        message: e.to_string(),
    })
}

/// Read and parse a workflow file with blocking I/O.
///
/// For synchronous callers such as [`WorkflowLibrary::load_files`]; async
/// code should use [`load_workflow_file_async`].
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path).map_err(|source| io_error(path, source))?;
    parse_named(&content, Some(path.display().to_string()))
}

/// Read and parse a workflow file through `tokio::fs`.
pub async fn load_workflow_file_async(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| io_error(path, source))?;
    parse_named(&content, Some(path.display().to_string()))
}

fn io_error(path: &Path, source: std::io::Error) -> DefinitionError {
    DefinitionError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Fail with every issue when validation finds at least one error.
pub fn ensure_valid(
    def: &WorkflowDefinition,
    library: Option<&WorkflowLibrary>,
) -> Result<Vec<ValidationIssue>, DefinitionError> {
    let issues = validate_definition(def, library);
    if issues.iter().any(|i| i.severity == IssueSeverity::Error) {
        return Err(DefinitionError::Invalid {
            name: def.name.clone(),
            issues,
        });
    }
    Ok(issues)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check a definition's structure. Includes are only resolved when a
/// library is supplied.
pub fn validate_definition(
    def: &WorkflowDefinition,
    library: Option<&WorkflowLibrary>,
) -> Vec<ValidationIssue> {
    let mut v = Validator {
        def,
        library,
        issues: Vec::new(),
        known_state: known_state_keys(def),
    };
    v.run();
    v.issues.sort_by(|a, b| b.severity.cmp(&a.severity));
    v.issues
}

/// Top-level state keys that exist at start or are written by some step.
fn known_state_keys(def: &WorkflowDefinition) -> BTreeSet<String> {
    let mut keys: BTreeSet<String> = def.default_state.keys().cloned().collect();
    let mut add_root = |path: &str| {
        if let Ok(p) = StatePath::parse(path) {
            if p.scope() == Scope::State {
                if let Some(root) = p.root_key() {
                    keys.insert(root.to_string());
                }
            }
        }
    };
    for_each_step(&def.steps, &mut |step| {
        if let Some(save_to) = step.kind.save_to() {
            add_root(save_to);
        }
        if let Some(handler) = &step.error_handler {
            add_root(&handler.error_state_path);
        }
        if let StepKind::ParallelForeach { output_mapping, .. } = &step.kind {
            output_mapping.keys().for_each(|k| add_root(k));
        }
    });
    keys.insert("last_error".to_string());
    keys
}

fn for_each_step<'a>(steps: &'a [StepDefinition], f: &mut impl FnMut(&'a StepDefinition)) {
    for step in steps {
        f(step);
        for child in step.kind.children() {
            for_each_step(child, f);
        }
    }
}

struct Validator<'a> {
    def: &'a WorkflowDefinition,
    library: Option<&'a WorkflowLibrary>,
    issues: Vec<ValidationIssue>,
    known_state: BTreeSet<String>,
}

/// Where a step list lives.
#[derive(Clone, Copy, PartialEq, Eq)]
enum StepScope {
    Workflow,
    SubAgent,
}

impl Validator<'_> {
    fn run(&mut self) {
        let def = self.def;
        if def.name.trim().is_empty() {
            self.issues
                .push(ValidationIssue::error("EMPTY_NAME", None, "workflow name must not be empty"));
        }
        if def.steps.is_empty() {
            self.issues
                .push(ValidationIssue::warning("NO_STEPS", None, "workflow has no steps and completes immediately"));
        }

        if let Err(err) = ComputedGraph::compile(&def.state_schema) {
            self.issues
                .push(ValidationIssue::error(err.code(), None, err.to_string()));
        }
        for (name, field) in &def.state_schema.computed {
            for path in field.from.paths() {
                if let Err(err) = StatePath::parse(path) {
                    self.issues.push(ValidationIssue::error(
                        "INVALID_PATH",
                        None,
                        format!("computed field '{name}': {err}"),
                    ));
                }
            }
            if let Err(err) = parser::parse(&field.transform) {
                self.issues.push(ValidationIssue::error(
                    err.code(),
                    None,
                    format!("computed field '{name}': {err}"),
                ));
            }
        }

        let mut seen = HashSet::new();
        self.check_steps(&def.steps, false, StepScope::Workflow, &mut seen);

        for (task_name, task) in &def.sub_agent_tasks {
            if task.steps.is_empty() {
                self.issues.push(ValidationIssue::warning(
                    "EMPTY_TASK",
                    None,
                    format!("sub-agent task '{task_name}' has no steps"),
                ));
            }
            for (key, expr) in &task.inputs {
                self.check_expression(None, expr, &format!("input '{key}' of task '{task_name}'"), true);
            }
            let mut task_seen = HashSet::new();
            self.check_steps(&task.steps, false, StepScope::SubAgent, &mut task_seen);
        }
    }

    fn check_steps<'s>(
        &mut self,
        steps: &'s [StepDefinition],
        in_loop: bool,
        scope: StepScope,
        seen: &mut HashSet<&'s str>,
    ) {
        for step in steps {
            let id = Some(step.id.as_str());
            if step.id.trim().is_empty() {
                self.issues
                    .push(ValidationIssue::error("EMPTY_STEP_ID", None, "step id must not be empty"));
            } else if !seen.insert(step.id.as_str()) {
                self.issues.push(ValidationIssue::error(
                    "DUPLICATE_STEP_ID",
                    id,
                    format!("duplicate step id '{}'", step.id),
                ));
            }

            match &step.kind {
                StepKind::Conditional {
                    condition,
                    then_steps,
                    else_steps,
                } => {
                    self.check_expression(id, condition, "condition", false);
                    self.check_steps(then_steps, in_loop, scope, seen);
                    self.check_steps(else_steps, in_loop, scope, seen);
                }
                StepKind::WhileLoop {
                    condition,
                    max_iterations,
                    body,
                } => {
                    self.check_expression(id, condition, "condition", false);
                    if *max_iterations == Some(0) {
                        self.issues.push(ValidationIssue::warning(
                            "ZERO_ITERATIONS",
                            id,
                            "max_iterations is 0, the loop never runs",
                        ));
                    }
                    self.check_steps(body, true, scope, seen);
                }
                StepKind::Foreach { items, steps, .. } => {
                    self.check_expression(id, items, "items", false);
                    self.check_steps(steps, true, scope, seen);
                }
                StepKind::ParallelForeach {
                    items,
                    sub_agent_task,
                    output_mapping,
                    max_parallel,
                    ..
                } => {
                    self.check_expression(id, items, "items", false);
                    if scope == StepScope::SubAgent {
                        self.issues.push(ValidationIssue::warning(
                            "NESTED_PARALLEL",
                            id,
                            "parallel_foreach inside a sub-agent task is skipped at runtime",
                        ));
                    }
                    if *max_parallel == Some(0) {
                        self.issues
                            .push(ValidationIssue::error("ZERO_PARALLEL", id, "max_parallel must be at least 1"));
                    }
                    if !self.def.sub_agent_tasks.contains_key(sub_agent_task) {
                        let suggestion = closest_match(
                            sub_agent_task,
                            self.def.sub_agent_tasks.keys().map(String::as_str),
                        );
                        self.issues.push(
                            ValidationIssue::error(
                                "UNKNOWN_TASK",
                                id,
                                format!("unknown sub-agent task '{sub_agent_task}'"),
                            )
                            .suggest(suggestion),
                        );
                    }
                    for (path, expr) in output_mapping {
                        self.check_write_path(id, path, StepScope::Workflow);
                        if let Err(err) = parser::parse(expr) {
                            self.issues.push(ValidationIssue::error(
                                err.code(),
                                id,
                                format!("output_mapping '{path}': {err}"),
                            ));
                        }
                    }
                }
                StepKind::Break | StepKind::Continue if !in_loop => {
                    self.issues.push(ValidationIssue::error(
                        "CONTROL_FLOW",
                        id,
                        format!("'{}' outside of a loop", step.step_type()),
                    ));
                }
                StepKind::Break | StepKind::Continue => {}
                StepKind::UserMessage { message } => self.check_template(id, message),
                StepKind::ShellCommand { command, .. } => self.check_template(id, command),
                StepKind::UserInput { prompt, .. } => self.check_template(id, prompt),
                StepKind::McpCall { parameters, .. } => self.check_value_templates(id, parameters),
                StepKind::IncludeWorkflow { workflow, inputs } => {
                    for value in inputs.values() {
                        self.check_value_templates(id, value);
                    }
                    if let Some(library) = self.library {
                        if library.get(workflow).is_none() {
                            self.issues.push(
                                ValidationIssue::error(
                                    "UNKNOWN_WORKFLOW",
                                    id,
                                    format!("included workflow '{workflow}' is not in the library"),
                                )
                                .suggest(closest_match(workflow, library.names())),
                            );
                        }
                    }
                }
            }

            if let Some(save_to) = step.kind.save_to() {
                self.check_write_path(id, save_to, scope);
            }
            if let Some(handler) = &step.error_handler {
                if !step.step_type().is_external() {
                    self.issues.push(ValidationIssue::warning(
                        "UNUSED_HANDLER",
                        id,
                        "error_handler only applies to external steps",
                    ));
                }
                if scope == StepScope::Workflow {
                    self.check_write_path(id, &handler.error_state_path, StepScope::Workflow);
                }
            }
        }
    }

    fn check_write_path(&mut self, step_id: Option<&str>, path: &str, scope: StepScope) {
        if scope == StepScope::SubAgent {
            if path != "output" && !path.starts_with("output.") {
                self.issues.push(ValidationIssue::error(
                    "INVALID_PATH",
                    step_id,
                    format!("sub-agent steps may only write below 'output', got '{path}'"),
                ));
            }
            return;
        }
        match StatePath::parse(path) {
            Ok(p) if p.scope() == Scope::State && p.root_key().is_some() => {}
            Ok(_) => self.issues.push(ValidationIssue::error(
                "INVALID_PATH",
                step_id,
                format!("'{path}' is not a writable state path"),
            )),
            Err(err) => self.issues.push(ValidationIssue::error("INVALID_PATH", step_id, err.to_string())),
        }
    }

    fn check_template(&mut self, step_id: Option<&str>, text: &str) {
        for expr in template::template_expressions(text) {
            self.check_expression(step_id, expr, "template", false);
        }
    }

    fn check_value_templates(&mut self, step_id: Option<&str>, value: &Value) {
        match value {
            Value::String(s) => self.check_template(step_id, s),
            Value::Array(items) => items.iter().for_each(|v| self.check_value_templates(step_id, v)),
            Value::Object(map) => map.values().for_each(|v| self.check_value_templates(step_id, v)),
            _ => {}
        }
    }

    /// Parse an expression and warn about references that cannot resolve.
    fn check_expression(&mut self, step_id: Option<&str>, expr: &str, what: &str, in_task_inputs: bool) {
        let parsed = match parser::parse(expr) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.issues
                    .push(ValidationIssue::error(err.code(), step_id, format!("{what}: {err}")));
                return;
            }
        };
        for path in parsed.referenced_paths() {
            let Ok(sp) = StatePath::parse(&path) else {
                continue;
            };
            let Some(Segment::Key(root)) = sp.segments().first() else {
                continue;
            };
            let (known, candidates): (bool, Vec<&str>) = match sp.scope() {
                Scope::State => (
                    self.known_state.contains(root),
                    self.known_state.iter().map(String::as_str).collect(),
                ),
                Scope::Inputs => (
                    self.def.inputs.contains_key(root),
                    self.def.inputs.keys().map(String::as_str).collect(),
                ),
                Scope::Computed => (
                    self.def.state_schema.computed.contains_key(root),
                    self.def.state_schema.computed.keys().map(String::as_str).collect(),
                ),
            };
            if !known && !in_task_inputs {
                self.issues.push(
                    ValidationIssue::warning(
                        "UNRESOLVED_REFERENCE",
                        step_id,
                        format!("{what} references '{path}', which is never set"),
                    )
                    .suggest(closest_match(root, candidates).map(|s| format!("{}.{s}", sp.scope()))),
                );
            }
        }
    }
}
