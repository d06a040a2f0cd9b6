//! REST request and response bodies
//!
//! Response types are deliberately permissive (`#[serde(default)]` on every
//! optional field, lenient scalars). Semantic validation happens in
//! `gq-core` when records are turned into domain values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::lenient;

/// Body of `POST /generation/generate`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Text prompt
    pub prompt: String,
    /// Negative prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Image width in pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Image height in pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    /// Number of denoising steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    /// Classifier-free guidance scale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f64>,
    /// RNG seed (`None` lets the backend pick)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Model identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl GenerationRequest {
    /// Create a request with only a prompt set
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// The parameters echoed onto a tracked job
    pub fn parameters(&self) -> GenerationParameters {
        GenerationParameters {
            width: self.width,
            height: self.height,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            seed: self.seed,
            model: self.model.clone(),
        }
    }
}

/// Generation parameters as reported by the backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(
        default,
        alias = "guidance_scale",
        deserialize_with = "lenient::opt_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub cfg_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl GenerationParameters {
    /// Fill unset fields from `other`
    pub fn or(self, other: &GenerationParameters) -> GenerationParameters {
        GenerationParameters {
            width: self.width.or(other.width),
            height: self.height.or(other.height),
            steps: self.steps.or(other.steps),
            cfg_scale: self.cfg_scale.or(other.cfg_scale),
            seed: self.seed.or(other.seed),
            model: self.model.or_else(|| other.model.clone()),
        }
    }
}

/// Response of `POST /generation/generate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartAck {
    #[serde(alias = "id", deserialize_with = "lenient::id_string")]
    pub job_id: String,
    #[serde(default = "default_start_status")]
    pub status: String,
    #[serde(
        default,
        deserialize_with = "lenient::opt_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_start_status() -> String {
    "queued".to_string()
}

/// Response of `POST /generation/jobs/{id}/cancel`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `PATCH /generation/results/{id}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
}

/// One entry of `GET /generation/jobs/active`, also used by push
/// `queue_update` frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    #[serde(alias = "id", deserialize_with = "lenient::id_string")]
    pub job_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub progress: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub parameters: Option<GenerationParameters>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub position: Option<u32>,
}

/// One entry of `GET /generation/results`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(alias = "result_id", deserialize_with = "lenient::id_string")]
    pub id: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, alias = "images", deserialize_with = "lenient::string_list")]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub parameters: Option<GenerationParameters>,
    /// Parameters some endpoints inline at the top level
    #[serde(flatten)]
    pub inline_parameters: GenerationParameters,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub rating: Option<f64>,
    #[serde(default, alias = "favorite")]
    pub is_favorite: Option<bool>,
}

impl ResultRecord {
    /// Nested parameters with top-level ones as fallback
    pub fn merged_parameters(&self) -> GenerationParameters {
        self.parameters
            .clone()
            .unwrap_or_default()
            .or(&self.inline_parameters)
    }
}

/// Snapshot returned by `GET /system/status`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub gpu_available: Option<bool>,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub gpu_memory_used: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub gpu_memory_total: Option<f64>,
    #[serde(default)]
    pub queue_length: Option<u64>,
    #[serde(default)]
    pub active_jobs: Option<u64>,
    #[serde(default)]
    pub model_loaded: Option<String>,
    /// Fields this client does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Extract the record list from a REST body that is either a bare array or
/// an object wrapping the array under `key`
pub fn records_from_body(body: Value, key: &str) -> Result<Vec<Value>, ProtocolError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(ProtocolError::UnexpectedShape(format!(
                "`{}` is not an array: {}",
                key, other
            ))),
            None => Err(ProtocolError::UnexpectedShape(format!(
                "object without `{}` array",
                key
            ))),
        },
        other => Err(ProtocolError::UnexpectedShape(format!(
            "expected array, got {}",
            other
        ))),
    }
}
