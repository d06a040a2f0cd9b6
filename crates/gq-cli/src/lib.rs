//! genqueue CLI
//!
//! Provides the `genqueue` command for submitting generation jobs,
//! following the queue and managing results, on top of the shared
//! orchestrator from `gq-orchestrator`.

pub mod commands;
pub mod output;
pub mod session;
