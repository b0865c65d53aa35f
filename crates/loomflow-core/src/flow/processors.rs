//! Control-flow step processors.
//!
//! Each processor evaluates its expression against the caller's scope and
//! mutates the [`ExecutionContext`]: pushing a frame, pushing a loop, or
//! signalling the innermost loop.

use std::sync::Arc;

use loomflow_types::workflow::StepDefinition;
use serde_json::Value;

use super::context::{ControlSignal, ExecutionContext, FrameKind, LoopState, StackFrame};
use super::ControlFlowError;
use crate::expression::Evaluator;
use crate::state::json_type_name;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// A frame (and possibly a loop) was pushed.
    Entered,
    /// Nothing was pushed.
    Skipped { reason: String },
    /// A signal was set on the innermost loop.
    Signalled(ControlSignal),
}

/// How a foreach materialises its iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForeachMode {
    /// One body frame per iteration, pushed as the previous one finishes.
    #[default]
    Iterative,
    /// All iteration x body-step combinations pushed up front.
    Expanded,
}

/// Borrowed fields of a `foreach` step.
#[derive(Debug, Clone, Copy)]
pub struct ForeachArgs<'a> {
    pub items: &'a str,
    pub item_var: &'a str,
    pub index_var: &'a str,
    pub max_iterations: u32,
    pub steps: &'a [StepDefinition],
}

fn eval_bool(
    evaluator: &dyn Evaluator,
    step_id: &str,
    expression: &str,
    scope: &Value,
) -> Result<bool, ControlFlowError> {
    evaluator
        .evaluate_bool(expression, scope)
        .map_err(|source| ControlFlowError::Expression {
            step_id: step_id.to_string(),
            source,
        })
}

pub fn process_conditional(
    ctx: &mut ExecutionContext,
    step_id: &str,
    condition: &str,
    then_steps: &[StepDefinition],
    else_steps: &[StepDefinition],
    evaluator: &dyn Evaluator,
    scope: &Value,
) -> Result<ProcessOutcome, ControlFlowError> {
    let taken = eval_bool(evaluator, step_id, condition, scope)?;
    let branch = if taken { then_steps } else { else_steps };
    if branch.is_empty() {
        return Ok(ProcessOutcome::Skipped {
            reason: format!("{} branch is empty", if taken { "then" } else { "else" }),
        });
    }
    ctx.push_frame(StackFrame::new(
        FrameKind::Branch {
            step_id: step_id.to_string(),
        },
        Arc::from(branch),
    ));
    Ok(ProcessOutcome::Entered)
}

/// The condition is checked once here; later checks happen at iteration
/// boundaries. A false condition never enters the loop.
pub fn process_while(
    ctx: &mut ExecutionContext,
    step_id: &str,
    condition: &str,
    max_iterations: u32,
    body: &[StepDefinition],
    evaluator: &dyn Evaluator,
    scope: &Value,
) -> Result<ProcessOutcome, ControlFlowError> {
    if max_iterations == 0 {
        return Ok(ProcessOutcome::Skipped {
            reason: "max_iterations is 0".to_string(),
        });
    }
    if !eval_bool(evaluator, step_id, condition, scope)? {
        return Ok(ProcessOutcome::Skipped {
            reason: "condition is false".to_string(),
        });
    }
    let body: Arc<[StepDefinition]> = Arc::from(body);
    ctx.push_loop(LoopState::while_loop(step_id, condition, max_iterations, Arc::clone(&body)));
    ctx.push_frame(StackFrame::new(
        FrameKind::LoopBody {
            step_id: step_id.to_string(),
        },
        body,
    ));
    Ok(ProcessOutcome::Entered)
}

pub fn process_foreach(
    ctx: &mut ExecutionContext,
    step_id: &str,
    args: ForeachArgs<'_>,
    mode: ForeachMode,
    evaluator: &dyn Evaluator,
    scope: &Value,
) -> Result<ProcessOutcome, ControlFlowError> {
    let items = match evaluator.evaluate_json(args.items, scope) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Null) => Vec::new(),
        Ok(other) => {
            return Err(ControlFlowError::NotIterable {
                step_id: step_id.to_string(),
                found: json_type_name(&other),
            });
        }
        Err(source) => {
            return Err(ControlFlowError::Expression {
                step_id: step_id.to_string(),
                source,
            });
        }
    };
    if items.is_empty() {
        return Ok(ProcessOutcome::Skipped {
            reason: "collection is empty".to_string(),
        });
    }
    if args.max_iterations == 0 || args.steps.is_empty() {
        return Ok(ProcessOutcome::Skipped {
            reason: "nothing to iterate".to_string(),
        });
    }
    if items.len() > args.max_iterations as usize {
        tracing::warn!(
            step_id,
            items = items.len(),
            max_iterations = args.max_iterations,
            "foreach collection truncated to max_iterations"
        );
    }

    let body: Arc<[StepDefinition]> = Arc::from(args.steps);
    let mut state = LoopState::foreach(
        step_id,
        items,
        args.item_var,
        args.index_var,
        args.max_iterations,
        Arc::clone(&body),
    );
    match mode {
        ForeachMode::Iterative => {
            let vars = state.bindings_for(0);
            ctx.push_loop(state);
            ctx.push_frame(
                StackFrame::new(
                    FrameKind::LoopBody {
                        step_id: step_id.to_string(),
                    },
                    body,
                )
                .with_variables(vars),
            );
        }
        ForeachMode::Expanded => {
            state.expanded = true;
            let (steps, iterations) = expand_iterations(&state);
            let vars = state.bindings_for(0);
            ctx.push_loop(state);
            ctx.push_frame(
                StackFrame::expanded(step_id.to_string(), steps, iterations).with_variables(vars),
            );
        }
    }
    Ok(ProcessOutcome::Entered)
}

/// Every (iteration, body step) pair of a foreach, in execution order.
pub fn expand_iterations(state: &LoopState) -> (Vec<StepDefinition>, Vec<u32>) {
    let mut steps = Vec::with_capacity(state.body.len() * state.max_iterations as usize);
    let mut iterations = Vec::with_capacity(steps.capacity());
    for iteration in 0..state.max_iterations {
        for step in state.body.iter() {
            steps.push(step.clone());
            iterations.push(iteration);
        }
    }
    (steps, iterations)
}

pub fn process_break(
    ctx: &mut ExecutionContext,
    step_id: &str,
) -> Result<ProcessOutcome, ControlFlowError> {
    signal(ctx, step_id, ControlSignal::Break)
}

pub fn process_continue(
    ctx: &mut ExecutionContext,
    step_id: &str,
) -> Result<ProcessOutcome, ControlFlowError> {
    signal(ctx, step_id, ControlSignal::Continue)
}

fn signal(
    ctx: &mut ExecutionContext,
    step_id: &str,
    signal: ControlSignal,
) -> Result<ProcessOutcome, ControlFlowError> {
    let current = ctx
        .current_loop_mut()
        .ok_or_else(|| ControlFlowError::NoActiveLoop {
            step_id: step_id.to_string(),
            signal,
        })?;
    current.control_signal = Some(signal);
    tracing::debug!(step_id, loop_id = %current.id, %signal, "loop signalled");
    Ok(ProcessOutcome::Signalled(signal))
}
