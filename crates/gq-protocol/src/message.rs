//! Push channel messages
//!
//! The backend pushes JSON text frames shaped `{ "type": "...", ...payload }`
//! over the `/ws/progress` websocket. Frames are decoded into [`PushMessage`],
//! a tagged union with one variant per known `type` plus an explicit
//! [`PushMessage::Unknown`] arm so that new server-side message kinds are
//! surfaced to the caller instead of failing the stream.
//!
//! # Message kinds
//!
//! | `type`                | variant                     |
//! |-----------------------|-----------------------------|
//! | `generation_progress` | [`PushMessage::Progress`]   |
//! | `generation_complete` | [`PushMessage::Complete`]   |
//! | `generation_error`    | [`PushMessage::Error`]      |
//! | `queue_update`        | [`PushMessage::QueueUpdate`]|
//! | `system_status`       | [`PushMessage::SystemStatus`]|
//! | `generation_started`  | [`PushMessage::Started`]    |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::lenient;
use crate::rest::{GenerationParameters, ResultRecord, SystemStatus};

/// Push message kind, as carried in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Progress,
    Complete,
    Error,
    QueueUpdate,
    SystemStatus,
    Started,
}

impl MessageKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Progress => "generation_progress",
            MessageKind::Complete => "generation_complete",
            MessageKind::Error => "generation_error",
            MessageKind::QueueUpdate => "queue_update",
            MessageKind::SystemStatus => "system_status",
            MessageKind::Started => "generation_started",
        }
    }

    /// Parse a wire name
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "generation_progress" => Some(Self::Progress),
            "generation_complete" => Some(Self::Complete),
            "generation_error" => Some(Self::Error),
            "queue_update" => Some(Self::QueueUpdate),
            "system_status" => Some(Self::SystemStatus),
            "generation_started" => Some(Self::Started),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `generation_progress` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    #[serde(deserialize_with = "lenient::id_string")]
    pub job_id: String,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub progress: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub step: Option<u32>,
    #[serde(default)]
    pub total_steps: Option<u32>,
}

impl ProgressUpdate {
    /// Bare progress update, mostly useful in tests
    pub fn new(job_id: impl Into<String>, progress: f64) -> Self {
        Self {
            job_id: job_id.into(),
            progress: Some(progress),
            status: None,
            message: None,
            step: None,
            total_steps: None,
        }
    }
}

/// `generation_complete` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionUpdate {
    #[serde(deserialize_with = "lenient::id_string")]
    pub job_id: String,
    #[serde(default, deserialize_with = "lenient::string_list")]
    pub images: Vec<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    /// Full result record, when the backend includes it
    #[serde(default)]
    pub result: Option<ResultRecord>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub parameters: Option<GenerationParameters>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl CompletionUpdate {
    /// Completion carrying only image locators
    pub fn with_images(job_id: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            images,
            image_url: None,
            thumbnail_url: None,
            result: None,
            prompt: None,
            negative_prompt: None,
            parameters: None,
            created_at: None,
            message: None,
        }
    }
}

/// `generation_error` payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorUpdate {
    #[serde(default, deserialize_with = "lenient::opt_id_string")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `generation_started` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartedUpdate {
    #[serde(deserialize_with = "lenient::id_string")]
    pub job_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub parameters: Option<GenerationParameters>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// `queue_update` payload
///
/// Records are kept as raw JSON so that the receiver can validate them one
/// at a time and drop only the malformed ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueUpdate {
    pub records: Vec<Value>,
    pub queue_length: Option<u64>,
}

/// A decoded push frame
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Progress(ProgressUpdate),
    Complete(CompletionUpdate),
    Error(ErrorUpdate),
    QueueUpdate(QueueUpdate),
    SystemStatus(SystemStatus),
    Started(StartedUpdate),
    /// A well-formed frame with a `type` this client does not know
    Unknown { kind: String, payload: Value },
}

impl PushMessage {
    /// Wire name of the frame's `type`
    pub fn kind_name(&self) -> &str {
        match self {
            PushMessage::Progress(_) => MessageKind::Progress.as_str(),
            PushMessage::Complete(_) => MessageKind::Complete.as_str(),
            PushMessage::Error(_) => MessageKind::Error.as_str(),
            PushMessage::QueueUpdate(_) => MessageKind::QueueUpdate.as_str(),
            PushMessage::SystemStatus(_) => MessageKind::SystemStatus.as_str(),
            PushMessage::Started(_) => MessageKind::Started.as_str(),
            PushMessage::Unknown { kind, .. } => kind,
        }
    }
}

/// Decode one text frame
pub fn decode_frame(text: &str) -> Result<PushMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    decode_value(value)
}

/// Decode an already-parsed frame
pub fn decode_value(value: Value) -> Result<PushMessage, ProtocolError> {
    let mut map = match value {
        Value::Object(map) => map,
        _ => return Err(ProtocolError::NotAnObject),
    };

    let kind = match map.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(ProtocolError::MissingType),
    };

    let Some(known) = MessageKind::from_wire(&kind) else {
        return Ok(PushMessage::Unknown {
            kind,
            payload: Value::Object(map),
        });
    };

    let message = match known {
        MessageKind::Progress => PushMessage::Progress(payload(known, map)?),
        MessageKind::Complete => PushMessage::Complete(payload(known, map)?),
        MessageKind::Error => PushMessage::Error(payload(known, map)?),
        MessageKind::Started => PushMessage::Started(payload(known, map)?),
        MessageKind::SystemStatus => {
            // Status may be inline or wrapped under `data`
            let body = match map.remove("data") {
                Some(Value::Object(inner)) => inner,
                Some(other) => {
                    map.insert("data".to_string(), other);
                    map
                }
                None => map,
            };
            PushMessage::SystemStatus(payload(known, body)?)
        }
        MessageKind::QueueUpdate => PushMessage::QueueUpdate(queue_update(map)?),
    };

    Ok(message)
}

fn payload<T>(kind: MessageKind, map: Map<String, Value>) -> Result<T, ProtocolError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(Value::Object(map)).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.as_str(),
        source,
    })
}

fn queue_update(mut map: Map<String, Value>) -> Result<QueueUpdate, ProtocolError> {
    let queue_length = map.get("queue_length").and_then(Value::as_u64);

    let records = match map.remove("jobs") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => {
            // A single-job update carries the record inline
            if map.contains_key("job_id") {
                map.remove("queue_length");
                vec![Value::Object(map)]
            } else {
                Vec::new()
            }
        }
        Some(other) => {
            return Err(ProtocolError::UnexpectedShape(format!(
                "queue_update `jobs` is not an array: {}",
                other
            )))
        }
    };

    Ok(QueueUpdate {
        records,
        queue_length,
    })
}
