//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding wire payloads
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame is not valid JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Frame decoded but is not a JSON object
    #[error("Frame is not a JSON object")]
    NotAnObject,

    /// Frame has no string `type` discriminator
    #[error("Frame is missing a `type` field")]
    MissingType,

    /// Known message kind whose payload does not match the expected shape
    #[error("Invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// REST body has an unexpected top-level shape
    #[error("Unexpected response shape: {0}")]
    UnexpectedShape(String),
}
