//! Core error types for genqueue

use gq_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the genqueue ecosystem
#[derive(Error, Debug)]
pub enum GqError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Action error
    #[error("{0}")]
    Action(#[from] ActionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised at the REST / push-channel boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Base URL cannot be used
    #[error("Invalid base URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Identifier that cannot be used as a path segment
    #[error("Invalid identifier `{0}`")]
    InvalidId(String),

    /// Connection refused, timeout, DNS failure...
    #[error("Request failed: {message}")]
    Network { message: String },

    /// Non-2xx response
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Response body could not be decoded
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Backend answered 2xx but refused the operation
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Push channel failure
    #[error("Push channel error: {0}")]
    Channel(String),
}

impl TransportError {
    /// HTTP status, when the failure came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether an idempotent request may be retried after this error
    ///
    /// Only network failures and 5xx responses qualify; 4xx never does.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network { .. } => true,
            TransportError::Http { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}

/// A record failed schema validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Result record rejected
    #[error("Invalid result {id}: {reason}")]
    InvalidResult { id: String, reason: String },

    /// Job record rejected
    #[error("Invalid job record: {0}")]
    InvalidJob(String),
}

/// A user action could not be performed locally
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Job not tracked
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Result not cached
    #[error("Result not found: {0}")]
    ResultNotFound(String),

    /// Job is already terminal
    #[error("Job {id} cannot be cancelled in state {status}")]
    NotCancellable { id: String, status: String },

    /// Input rejected before any request was made
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The orchestrator was torn down
    #[error("Orchestrator has been shut down")]
    ShutDown,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
