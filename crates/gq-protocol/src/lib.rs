//! gq-protocol: Wire types for genqueue
//!
//! This crate defines the JSON frames pushed over the progress websocket and
//! the request/response bodies of the generation backend's REST API.

pub mod error;
pub mod lenient;
pub mod message;
pub mod rest;

pub use error::ProtocolError;
pub use message::{
    decode_frame, decode_value, CompletionUpdate, ErrorUpdate, MessageKind, ProgressUpdate,
    PushMessage, QueueUpdate, StartedUpdate,
};
pub use rest::{
    records_from_body, CancelAck, GenerationParameters, GenerationRequest, JobStatusRecord,
    ResultPatch, ResultRecord, StartAck, SystemStatus,
};
