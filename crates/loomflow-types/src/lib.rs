//! Shared domain types for Loomflow.
//!
//! This crate contains the declarative workflow model, runtime state records,
//! error records and engine configuration used across the Loomflow crates.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod state;
pub mod workflow;
