//! Workflow engine core for Loomflow.
//!
//! Definitions are parsed and validated in `definition`, evaluated through
//! the pluggable `expression` layer, and executed by the pull-model
//! `executor`. State lives in `state`; loops, branches and includes are
//! walked by `flow`; failures go through `recovery`; `parallel_foreach`
//! fan-out is handled by `subagent`.
//!
//! Depends only on `loomflow-types` plus pure libraries -- no IO beyond
//! reading workflow files.

pub mod definition;
pub mod error;
pub mod executor;
pub mod expression;
pub mod flow;
pub mod library;
pub mod recovery;
pub mod state;
pub mod subagent;
pub mod suggest;

pub use error::EngineError;
pub use executor::{QueueExecutor, StartOptions, StepHandler, WorkflowDriver};
