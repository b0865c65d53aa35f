//! Named workflow library for `include_workflow`, plus depth-bounded call
//! tracing over include chains.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use loomflow_types::workflow::{StepDefinition, StepKind, WorkflowDefinition};
use serde::Serialize;

use crate::definition::{DefinitionError, load_workflow_file};
use crate::suggest::closest_match;

#[derive(Debug, Clone, Default)]
pub struct WorkflowLibrary {
    workflows: BTreeMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under its name, replacing any previous one.
    pub fn insert(&mut self, def: WorkflowDefinition) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.insert(def.name.clone(), Arc::new(def))
    }

    /// Load and register each file.
    pub fn load_files<P: AsRef<Path>>(
        &mut self,
        paths: impl IntoIterator<Item = P>,
    ) -> Result<usize, DefinitionError> {
        let mut loaded = 0;
        for path in paths {
            let def = load_workflow_file(path.as_ref())?;
            tracing::debug!(workflow = %def.name, path = %path.as_ref().display(), "library workflow loaded");
            self.insert(def);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    pub fn suggest(&self, name: &str) -> Option<String> {
        closest_match(name, self.names())
    }

    /// Walk the include graph from `entry`.
    ///
    /// The entry point is depth 0 and nothing deeper than `max_depth` is
    /// visited, so `max_depth_reached <= max_depth` always holds.
    pub fn get_call_trace(&self, entry: &str, max_depth: usize) -> Result<CallTrace, DefinitionError> {
        let root = self.get(entry).ok_or_else(|| DefinitionError::UnknownWorkflow {
            name: entry.to_string(),
            suggestion: self.suggest(entry),
        })?;
        let mut trace = CallTrace {
            entry: entry.to_string(),
            max_depth,
            max_depth_reached: 0,
            truncated: false,
            calls: vec![CallTraceEntry {
                workflow: entry.to_string(),
                depth: 0,
                caller: None,
                via_step: None,
            }],
            cycles: Vec::new(),
            missing: Vec::new(),
        };
        let mut path = vec![entry.to_string()];
        self.trace_into(&root, 0, &mut path, &mut trace);
        Ok(trace)
    }

    fn trace_into(
        &self,
        def: &WorkflowDefinition,
        depth: usize,
        path: &mut Vec<String>,
        trace: &mut CallTrace,
    ) {
        for (step_id, target) in includes_of(def) {
            let child_depth = depth + 1;
            if child_depth > trace.max_depth {
                trace.truncated = true;
                continue;
            }
            if let Some(start) = path.iter().position(|w| w == target) {
                let mut cycle = path[start..].to_vec();
                cycle.push(target.to_string());
                trace.cycles.push(cycle);
                continue;
            }
            let Some(child) = self.get(target) else {
                trace.missing.push(MissingInclude {
                    workflow: target.to_string(),
                    caller: def.name.clone(),
                    via_step: step_id.to_string(),
                    suggestion: self.suggest(target),
                });
                continue;
            };
            trace.calls.push(CallTraceEntry {
                workflow: target.to_string(),
                depth: child_depth,
                caller: Some(def.name.clone()),
                via_step: Some(step_id.to_string()),
            });
            trace.max_depth_reached = trace.max_depth_reached.max(child_depth);
            path.push(target.to_string());
            self.trace_into(&child, child_depth, path, trace);
            path.pop();
        }
    }
}

/// `(step_id, workflow)` for every include in a definition, including those
/// nested in branches, loop bodies and sub-agent templates.
fn includes_of(def: &WorkflowDefinition) -> Vec<(&str, &str)> {
    fn collect<'a>(steps: &'a [StepDefinition], out: &mut Vec<(&'a str, &'a str)>) {
        for step in steps {
            if let StepKind::IncludeWorkflow { workflow, .. } = &step.kind {
                out.push((step.id.as_str(), workflow.as_str()));
            }
            for child in step.kind.children() {
                collect(child, out);
            }
        }
    }
    let mut out = Vec::new();
    collect(&def.steps, &mut out);
    for task in def.sub_agent_tasks.values() {
        collect(&task.steps, &mut out);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallTraceEntry {
    pub workflow: String,
    pub depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_step: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingInclude {
    pub workflow: String,
    pub caller: String,
    pub via_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallTrace {
    pub entry: String,
    pub max_depth: usize,
    pub max_depth_reached: usize,
    /// Some include lay beyond `max_depth` and was not visited.
    pub truncated: bool,
    /// Visited workflows in depth-first order, the entry first.
    pub calls: Vec<CallTraceEntry>,
    /// Include chains that lead back to a workflow already on the path.
    pub cycles: Vec<Vec<String>>,
    pub missing: Vec<MissingInclude>,
}
