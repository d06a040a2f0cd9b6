//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a tracked generation job
///
/// `Queued -> Processing -> {Completed | Failed}`; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting for a worker
    Queued,
    /// Running on a worker
    Processing,
    /// Finished with a result
    Completed,
    /// Finished without a result (error or cancellation)
    Failed,
}

impl JobStatus {
    /// Normalize a backend status string
    ///
    /// Unrecognized values map to `Processing`: a job we cannot classify is
    /// still a job, and dropping it would hide it from the queue.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" | "complete" | "succeeded" | "success" | "done" => JobStatus::Completed,
            "failed" | "error" | "cancelled" | "canceled" => JobStatus::Failed,
            "queued" | "pending" | "waiting" => JobStatus::Queued,
            _ => JobStatus::Processing,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a cancel request makes sense
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing)
    }

    /// Position in the lifecycle, used to refuse backwards transitions
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a raw backend status reports a user cancellation
pub fn is_cancellation(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "cancelled" | "canceled"
    )
}

/// Normalize a progress value to an integer percentage
///
/// Values `<= 1` are fractions and are scaled by 100; larger values are
/// already percentages. The result is clamped to `[0, 100]`; NaN maps to 0.
pub fn normalize_progress(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    let percent = if raw <= 1.0 { raw * 100.0 } else { raw };
    percent.round().clamp(0.0, 100.0) as u8
}

/// Generate a fresh UI-local job id
pub fn new_local_id() -> String {
    format!("local-{}", uuid::Uuid::new_v4().simple())
}

/// Severity of a consumer-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationLevel::Info => write!(f, "info"),
            NotificationLevel::Success => write!(f, "success"),
            NotificationLevel::Warning => write!(f, "warning"),
            NotificationLevel::Error => write!(f, "error"),
        }
    }
}

/// A message for every consumer of the shared orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Success,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
        }
    }
}
