//! Execution frames and loop state.
//!
//! An [`ExecutionContext`] is an explicit cursor: a stack of frames (each a
//! step list plus position) and a stack of active loops, innermost last.
//! Nothing else is needed to resume a workflow between calls.

use std::fmt;
use std::sync::Arc;

use loomflow_types::workflow::{LoopSummary, StepDefinition};
use serde::Serialize;
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Loop state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    While,
    Foreach,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopKind::While => f.write_str("while"),
            LoopKind::Foreach => f.write_str("foreach"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Break,
    Continue,
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlSignal::Break => f.write_str("break"),
            ControlSignal::Continue => f.write_str("continue"),
        }
    }
}

/// Why a loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExit {
    Condition,
    MaxIterations,
    Break,
    Exhausted,
}

/// Runtime record of one active loop.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub id: String,
    pub kind: LoopKind,
    /// Iterations completed so far; the 0-based index of the running one.
    pub iteration: u32,
    pub max_iterations: u32,
    pub items: Option<Vec<Value>>,
    pub control_signal: Option<ControlSignal>,
    pub(crate) condition: Option<String>,
    pub(crate) item_var: String,
    pub(crate) index_var: String,
    pub(crate) body: Arc<[StepDefinition]>,
    pub(crate) expanded: bool,
}

impl LoopState {
    pub fn while_loop(
        id: impl Into<String>,
        condition: impl Into<String>,
        max_iterations: u32,
        body: Arc<[StepDefinition]>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: LoopKind::While,
            iteration: 0,
            max_iterations,
            items: None,
            control_signal: None,
            condition: Some(condition.into()),
            item_var: String::new(),
            index_var: String::new(),
            body,
            expanded: false,
        }
    }

    /// `max_iterations` is clamped to the collection length.
    pub fn foreach(
        id: impl Into<String>,
        items: Vec<Value>,
        item_var: impl Into<String>,
        index_var: impl Into<String>,
        max_iterations: u32,
        body: Arc<[StepDefinition]>,
    ) -> Self {
        let len = u32::try_from(items.len()).unwrap_or(u32::MAX);
        Self {
            id: id.into(),
            kind: LoopKind::Foreach,
            iteration: 0,
            max_iterations: max_iterations.min(len),
            items: Some(items),
            control_signal: None,
            condition: None,
            item_var: item_var.into(),
            index_var: index_var.into(),
            body,
            expanded: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.iteration >= self.max_iterations || self.control_signal == Some(ControlSignal::Break)
    }

    /// Move to the next iteration. A pending `continue` is consumed here.
    pub fn advance(&mut self) {
        self.iteration = self.iteration.saturating_add(1);
        if self.control_signal == Some(ControlSignal::Continue) {
            self.control_signal = None;
        }
    }

    pub fn current_item(&self) -> Option<&Value> {
        self.items.as_ref()?.get(self.iteration as usize)
    }

    pub fn exit_reason(&self) -> LoopExit {
        if self.control_signal == Some(ControlSignal::Break) {
            return LoopExit::Break;
        }
        if let Some(items) = &self.items {
            if self.iteration as usize >= items.len() {
                return LoopExit::Exhausted;
            }
        }
        if self.iteration >= self.max_iterations {
            LoopExit::MaxIterations
        } else {
            LoopExit::Condition
        }
    }

    /// Frame variables for one foreach iteration (`item`, `index` by default).
    pub fn bindings_for(&self, iteration: u32) -> Map<String, Value> {
        let mut vars = Map::new();
        if let Some(items) = &self.items {
            let item = items.get(iteration as usize).cloned().unwrap_or(Value::Null);
            vars.insert(self.item_var.clone(), item);
            vars.insert(self.index_var.clone(), json!(iteration));
        }
        vars
    }

    pub fn summary(&self) -> LoopSummary {
        LoopSummary {
            id: self.id.clone(),
            kind: self.kind.to_string(),
            iteration: self.iteration,
            max_iterations: self.max_iterations,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Root,
    Branch { step_id: String },
    /// One iteration of the innermost loop's body.
    LoopBody { step_id: String },
    /// Every iteration of a foreach, materialised up front.
    Expanded { step_id: String },
    Include { step_id: String, workflow: String },
}

impl FrameKind {
    pub fn is_loop(&self) -> bool {
        matches!(self, FrameKind::LoopBody { .. } | FrameKind::Expanded { .. })
    }
}

#[derive(Debug, Clone)]
pub struct StackFrame {
    pub kind: FrameKind,
    steps: Arc<[StepDefinition]>,
    cursor: usize,
    variables: Map<String, Value>,
    /// Loop iteration of each entry; only set on expanded frames.
    entry_iterations: Vec<u32>,
}

impl StackFrame {
    pub fn new(kind: FrameKind, steps: Arc<[StepDefinition]>) -> Self {
        Self {
            kind,
            steps,
            cursor: 0,
            variables: Map::new(),
            entry_iterations: Vec::new(),
        }
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub(crate) fn expanded(
        step_id: String,
        steps: Vec<StepDefinition>,
        entry_iterations: Vec<u32>,
    ) -> Self {
        Self {
            kind: FrameKind::Expanded { step_id },
            steps: steps.into(),
            cursor: 0,
            variables: Map::new(),
            entry_iterations,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.steps.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub(crate) fn set_variables(&mut self, variables: Map<String, Value>) {
        self.variables = variables;
    }

    /// Take the step under the cursor and move past it.
    pub(crate) fn take(&mut self) -> Option<(StepDefinition, Option<u32>)> {
        let step = self.steps.get(self.cursor)?.clone();
        let iteration = self.entry_iterations.get(self.cursor).copied();
        self.cursor += 1;
        Some((step, iteration))
    }

    /// Skip the rest of the current expanded iteration.
    pub(crate) fn skip_iteration(&mut self, iteration: u32) {
        while self
            .entry_iterations
            .get(self.cursor)
            .is_some_and(|it| *it == iteration)
        {
            self.cursor += 1;
        }
    }

    pub(crate) fn exhaust(&mut self) {
        self.cursor = self.steps.len();
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Completed loops kept for status reporting.
const COMPLETED_LOOP_HISTORY: usize = 64;

/// A loop that has exited.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedLoop {
    pub id: String,
    pub kind: LoopKind,
    pub iterations: u32,
    pub exit: LoopExit,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    frames: Vec<StackFrame>,
    loops: Vec<LoopState>,
    completed: Vec<CompletedLoop>,
}

impl ExecutionContext {
    pub fn new(root: Arc<[StepDefinition]>) -> Self {
        Self {
            frames: vec![StackFrame::new(FrameKind::Root, root)],
            loops: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn push_frame(&mut self, frame: StackFrame) {
        tracing::debug!(depth = self.frames.len() + 1, kind = ?frame.kind, "frame pushed");
        self.frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        self.frames.pop()
    }

    pub fn top_frame(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    pub fn top_frame_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn push_loop(&mut self, state: LoopState) {
        self.loops.push(state);
    }

    pub fn pop_loop(&mut self) -> Option<LoopState> {
        self.loops.pop()
    }

    /// The innermost active loop. Break and continue only ever touch this.
    pub fn current_loop(&self) -> Option<&LoopState> {
        self.loops.last()
    }

    pub fn current_loop_mut(&mut self) -> Option<&mut LoopState> {
        self.loops.last_mut()
    }

    pub fn loops(&self) -> &[LoopState] {
        &self.loops
    }

    /// Pop the innermost loop and remember how it ended.
    pub fn exit_loop(&mut self) -> Option<CompletedLoop> {
        let state = self.loops.pop()?;
        let done = CompletedLoop {
            id: state.id.clone(),
            kind: state.kind,
            iterations: state.iteration,
            exit: state.exit_reason(),
        };
        if done.exit == LoopExit::MaxIterations {
            tracing::warn!(
                loop_id = %done.id,
                iterations = done.iterations,
                "loop stopped at max_iterations"
            );
        } else {
            tracing::debug!(loop_id = %done.id, iterations = done.iterations, exit = ?done.exit, "loop exited");
        }
        if self.completed.len() == COMPLETED_LOOP_HISTORY {
            self.completed.remove(0);
        }
        self.completed.push(done.clone());
        Some(done)
    }

    /// Most recent loop exits, oldest first.
    pub fn completed_loops(&self) -> &[CompletedLoop] {
        &self.completed
    }

    /// Number of `include_workflow` frames on the stack.
    pub fn include_depth(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| matches!(f.kind, FrameKind::Include { .. }))
            .count()
    }

    pub fn is_finished(&self) -> bool {
        self.frames.is_empty()
    }

    /// Expression scope: `globals` overlaid with frame variables, inner
    /// frames shadowing outer ones.
    pub fn scope(&self, globals: &Value) -> Value {
        let mut scope = match globals {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for frame in &self.frames {
            for (k, v) in &frame.variables {
                scope.insert(k.clone(), v.clone());
            }
        }
        Value::Object(scope)
    }

    /// Drop all frames and loops.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.loops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomflow_types::workflow::StepKind;

    fn steps(ids: &[&str]) -> Arc<[StepDefinition]> {
        ids.iter()
            .map(|id| {
                StepDefinition::new(
                    *id,
                    StepKind::UserMessage {
                        message: id.to_string(),
                    },
                )
            })
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn test_loop_completion_rules() {
        let mut l = LoopState::while_loop("w", "true", 2, steps(&["a"]));
        assert!(!l.is_complete());
        l.advance();
        l.advance();
        assert!(l.is_complete());
        assert_eq!(l.exit_reason(), LoopExit::MaxIterations);

        let mut b = LoopState::while_loop("w", "true", 10, steps(&["a"]));
        b.control_signal = Some(ControlSignal::Break);
        assert!(b.is_complete());
        assert_eq!(b.exit_reason(), LoopExit::Break);
    }

    #[test]
    fn test_advance_consumes_continue() {
        let mut l = LoopState::while_loop("w", "true", 10, steps(&["a"]));
        l.control_signal = Some(ControlSignal::Continue);
        l.advance();
        assert_eq!(l.control_signal, None);
        assert_eq!(l.iteration, 1);
    }

    #[test]
    fn test_foreach_bindings_and_clamp() {
        let l = LoopState::foreach("f", vec![json!("a"), json!("b")], "file", "i", 100, steps(&["x"]));
        assert_eq!(l.max_iterations, 2);
        assert_eq!(l.current_item(), Some(&json!("a")));
        let vars = l.bindings_for(1);
        assert_eq!(vars["file"], json!("b"));
        assert_eq!(vars["i"], json!(1));
    }

    #[test]
    fn test_scope_shadows_outer_frames() {
        let mut ctx = ExecutionContext::new(steps(&["a"]));
        let mut outer = Map::new();
        outer.insert("item".into(), json!(1));
        outer.insert("outer_only".into(), json!(true));
        ctx.push_frame(StackFrame::new(FrameKind::LoopBody { step_id: "l1".into() }, steps(&[])).with_variables(outer));
        let mut inner = Map::new();
        inner.insert("item".into(), json!(2));
        ctx.push_frame(StackFrame::new(FrameKind::LoopBody { step_id: "l2".into() }, steps(&[])).with_variables(inner));

        let scope = ctx.scope(&json!({"state": {"n": 1}, "item": 0}));
        assert_eq!(scope["item"], json!(2));
        assert_eq!(scope["outer_only"], json!(true));
        assert_eq!(scope["state"]["n"], json!(1));
    }

    #[test]
    fn test_expanded_frame_skip_iteration() {
        let body: Vec<StepDefinition> = steps(&["a", "b", "a", "b"]).to_vec();
        let mut frame = StackFrame::expanded("f".into(), body, vec![0, 0, 1, 1]);
        let (_, it) = frame.take().unwrap();
        assert_eq!(it, Some(0));
        frame.skip_iteration(0);
        let (step, it) = frame.take().unwrap();
        assert_eq!((step.id.as_str(), it), ("a", Some(1)));
    }
}
