//! The step cursor shared by workflow instances and sub-agents.
//!
//! [`StepWalker::advance`] pops steps until it reaches one the engine cannot
//! run by itself (an external step or a `parallel_foreach`) or the frame
//! stack empties. Control-flow steps are consumed along the way.

use std::sync::Arc;

use loomflow_types::workflow::{StepDefinition, StepKind};
use serde_json::{Map, Value};

use super::context::{ControlSignal, ExecutionContext, FrameKind, LoopKind, StackFrame};
use super::processors::{self, ForeachArgs, ForeachMode, ProcessOutcome};
use super::ControlFlowError;
use crate::expression::Evaluator;
use crate::expression::template::interpolate_value;
use crate::library::WorkflowLibrary;

/// What a walker does with a `parallel_foreach` it reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelPolicy {
    /// Hand it to the caller.
    Yield,
    /// Skip it with a warning; used where nobody can drive the sub-agents.
    Skip,
}

/// Everything a walk needs besides the context itself.
#[derive(Debug)]
pub struct WalkEnv<'a> {
    pub evaluator: &'a dyn Evaluator,
    /// `state` / `inputs` / `computed` (or a sub-agent view) at walk time.
    pub globals: Value,
    pub library: Option<&'a WorkflowLibrary>,
    pub default_max_iterations: u32,
    pub max_include_depth: usize,
    pub foreach_mode: ForeachMode,
    pub parallel: ParallelPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalkEvent {
    /// A step the caller must execute. `scope` is what its templates resolve
    /// against.
    External { step: StepDefinition, scope: Value },
    Parallel { step: StepDefinition, scope: Value },
    Finished,
}

pub struct StepWalker;

impl StepWalker {
    pub fn advance(ctx: &mut ExecutionContext, env: &WalkEnv<'_>) -> Result<WalkEvent, ControlFlowError> {
        loop {
            let Some(frame) = ctx.top_frame_mut() else {
                return Ok(WalkEvent::Finished);
            };
            if frame.is_exhausted() {
                Self::finish_frame(ctx, env)?;
                continue;
            }
            let Some((step, iteration)) = frame.take() else {
                continue;
            };
            if let Some(iteration) = iteration {
                Self::enter_expanded_iteration(ctx, iteration);
            }

            let scope = ctx.scope(&env.globals);
            tracing::debug!(step_id = %step.id, step_type = %step.step_type(), depth = ctx.frame_depth(), "step reached");
            match &step.kind {
                StepKind::Conditional {
                    condition,
                    then_steps,
                    else_steps,
                } => {
                    processors::process_conditional(
                        ctx,
                        &step.id,
                        condition,
                        then_steps,
                        else_steps,
                        env.evaluator,
                        &scope,
                    )?;
                }
                StepKind::WhileLoop {
                    condition,
                    max_iterations,
                    body,
                } => {
                    let outcome = processors::process_while(
                        ctx,
                        &step.id,
                        condition,
                        max_iterations.unwrap_or(env.default_max_iterations),
                        body,
                        env.evaluator,
                        &scope,
                    )?;
                    log_skip(&step.id, &outcome);
                }
                StepKind::Foreach {
                    items,
                    item_var,
                    index_var,
                    max_iterations,
                    steps,
                } => {
                    let args = ForeachArgs {
                        items,
                        item_var,
                        index_var,
                        max_iterations: max_iterations.unwrap_or(env.default_max_iterations),
                        steps,
                    };
                    let outcome = processors::process_foreach(
                        ctx,
                        &step.id,
                        args,
                        env.foreach_mode,
                        env.evaluator,
                        &scope,
                    )?;
                    log_skip(&step.id, &outcome);
                }
                StepKind::Break => {
                    processors::process_break(ctx, &step.id)?;
                    Self::unwind(ctx, ControlSignal::Break);
                }
                StepKind::Continue => {
                    processors::process_continue(ctx, &step.id)?;
                    Self::unwind(ctx, ControlSignal::Continue);
                }
                StepKind::IncludeWorkflow { workflow, inputs } => {
                    Self::include(ctx, env, &step.id, workflow, inputs, &scope)?;
                }
                StepKind::ParallelForeach { .. } => match env.parallel {
                    ParallelPolicy::Yield => return Ok(WalkEvent::Parallel { step, scope }),
                    ParallelPolicy::Skip => {
                        tracing::warn!(step_id = %step.id, "nested parallel_foreach skipped");
                    }
                },
                StepKind::UserMessage { .. }
                | StepKind::ShellCommand { .. }
                | StepKind::McpCall { .. }
                | StepKind::UserInput { .. } => {
                    return Ok(WalkEvent::External { step, scope });
                }
            }
        }
    }

    /// Pop an exhausted frame; at a loop body this is the iteration boundary.
    fn finish_frame(ctx: &mut ExecutionContext, env: &WalkEnv<'_>) -> Result<(), ControlFlowError> {
        let Some(frame) = ctx.pop_frame() else {
            return Ok(());
        };
        match frame.kind {
            FrameKind::LoopBody { step_id } => {
                let Some(current) = ctx.current_loop_mut() else {
                    return Ok(());
                };
                current.advance();
                if current.is_complete() {
                    ctx.exit_loop();
                    return Ok(());
                }
                let kind = current.kind;
                let condition = current.condition.clone();
                let body = Arc::clone(&current.body);
                let vars = current.bindings_for(current.iteration);

                if kind == LoopKind::While {
                    let scope = ctx.scope(&env.globals);
                    let condition = condition.unwrap_or_default();
                    let holds = env
                        .evaluator
                        .evaluate_bool(&condition, &scope)
                        .map_err(|source| ControlFlowError::Expression {
                            step_id: step_id.clone(),
                            source,
                        })?;
                    if !holds {
                        ctx.exit_loop();
                        return Ok(());
                    }
                }
                ctx.push_frame(StackFrame::new(FrameKind::LoopBody { step_id }, body).with_variables(vars));
            }
            FrameKind::Expanded { .. } => {
                if let Some(current) = ctx.current_loop_mut() {
                    if current.control_signal != Some(ControlSignal::Break) {
                        current.iteration = current.max_iterations;
                    }
                }
                ctx.exit_loop();
            }
            FrameKind::Root | FrameKind::Branch { .. } | FrameKind::Include { .. } => {}
        }
        Ok(())
    }

    fn enter_expanded_iteration(ctx: &mut ExecutionContext, iteration: u32) {
        let Some(current) = ctx.current_loop_mut() else {
            return;
        };
        current.iteration = iteration;
        let vars = current.bindings_for(iteration);
        if let Some(frame) = ctx.top_frame_mut() {
            frame.set_variables(vars);
        }
    }

    /// Drop frames above the innermost loop's frame and apply the signal.
    fn unwind(ctx: &mut ExecutionContext, signal: ControlSignal) {
        while ctx.top_frame().is_some_and(|f| !f.kind.is_loop()) {
            ctx.pop_frame();
        }
        let expanded_iteration = ctx
            .current_loop()
            .filter(|l| l.expanded)
            .map(|l| l.iteration);
        let Some(frame) = ctx.top_frame_mut() else {
            return;
        };
        match (signal, expanded_iteration) {
            (ControlSignal::Continue, Some(iteration)) => {
                frame.skip_iteration(iteration);
                if let Some(current) = ctx.current_loop_mut() {
                    current.control_signal = None;
                }
            }
            _ => frame.exhaust(),
        }
    }

    fn include(
        ctx: &mut ExecutionContext,
        env: &WalkEnv<'_>,
        step_id: &str,
        workflow: &str,
        inputs: &std::collections::BTreeMap<String, Value>,
        scope: &Value,
    ) -> Result<(), ControlFlowError> {
        let Some(library) = env.library else {
            return Err(ControlFlowError::UnknownWorkflow {
                step_id: step_id.to_string(),
                workflow: workflow.to_string(),
                suggestion: None,
            });
        };
        let def = library.get(workflow).ok_or_else(|| ControlFlowError::UnknownWorkflow {
            step_id: step_id.to_string(),
            workflow: workflow.to_string(),
            suggestion: library.suggest(workflow),
        })?;
        if ctx.include_depth() >= env.max_include_depth {
            return Err(ControlFlowError::IncludeDepthExceeded {
                step_id: step_id.to_string(),
                workflow: workflow.to_string(),
                max_depth: env.max_include_depth,
            });
        }

        let mut bound = Map::new();
        for (name, spec) in &def.inputs {
            if let Some(default) = &spec.default {
                bound.insert(name.clone(), default.clone());
            }
        }
        for (name, value) in inputs {
            let resolved = interpolate_value(value, scope, env.evaluator).map_err(|source| {
                ControlFlowError::Expression {
                    step_id: step_id.to_string(),
                    source,
                }
            })?;
            bound.insert(name.clone(), resolved);
        }
        let mut vars = Map::new();
        vars.insert("inputs".to_string(), Value::Object(bound));

        tracing::debug!(step_id, workflow, depth = ctx.include_depth() + 1, "workflow included");
        ctx.push_frame(
            StackFrame::new(
                FrameKind::Include {
                    step_id: step_id.to_string(),
                    workflow: workflow.to_string(),
                },
                Arc::from(def.steps.as_slice()),
            )
            .with_variables(vars),
        );
        Ok(())
    }
}

fn log_skip(step_id: &str, outcome: &ProcessOutcome) {
    if let ProcessOutcome::Skipped { reason } = outcome {
        tracing::debug!(step_id, reason = %reason, "loop skipped");
    }
}
