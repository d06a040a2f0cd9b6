//! gq-core: Domain types and configuration for genqueue
//!
//! This crate provides the job and result models, status/progress
//! normalization, result validation, error types and client configuration
//! shared by the transport, orchestrator and CLI crates.

pub mod config;
pub mod error;
pub mod job;
pub mod result;
pub mod time;
pub mod types;

pub use error::{ActionError, ConfigError, GqError, TransportError, ValidationError};
pub use job::{Job, JobInput};
pub use result::{GenerationResult, MAX_RESULTS};
pub use types::{
    is_cancellation, new_local_id, normalize_progress, JobStatus, Notification,
    NotificationLevel,
};
