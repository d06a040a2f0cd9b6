//! Tracked generation jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gq_protocol::{GenerationParameters, GenerationRequest, JobStatusRecord};

use crate::result::GenerationResult;
use crate::time::instant_or;
use crate::types::{new_local_id, normalize_progress, JobStatus};

/// A generation request the client is tracking until it reaches a
/// terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// UI-local id, stable for the lifetime of the job
    pub local_id: String,
    /// Backend id, once the backend has accepted the request
    pub backend_id: Option<String>,
    pub status: JobStatus,
    /// Percentage in `[0, 100]`
    pub progress: u8,
    pub prompt: String,
    pub parameters: GenerationParameters,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub result: Option<GenerationResult>,
    pub error: Option<String>,
    /// Queue position reported by the backend
    pub position: Option<u32>,
}

impl Job {
    /// Canonical lookup key: the backend id once assigned, the local id
    /// before that
    pub fn key(&self) -> &str {
        self.backend_id.as_deref().unwrap_or(&self.local_id)
    }

    /// Whether `id` names this job under either identity
    pub fn matches(&self, id: &str) -> bool {
        self.local_id == id || self.backend_id.as_deref() == Some(id)
    }

    pub fn is_cancellable(&self) -> bool {
        self.status.is_cancellable()
    }

    /// Update status and progress together
    ///
    /// `Completed` always carries 100%. Returns whether anything changed.
    pub fn set_state(&mut self, status: JobStatus, progress: u8) -> bool {
        let progress = if status == JobStatus::Completed {
            100
        } else {
            progress.min(100)
        };
        let changed = self.status != status || self.progress != progress;
        self.status = status;
        self.progress = progress;
        changed
    }
}

/// Everything needed to start tracking a job
#[derive(Debug, Clone, Default)]
pub struct JobInput {
    pub local_id: Option<String>,
    pub backend_id: Option<String>,
    /// Raw backend status; `None` means queued
    pub status: Option<String>,
    /// Raw progress (fraction or percentage)
    pub progress: Option<f64>,
    pub prompt: String,
    pub parameters: GenerationParameters,
    pub message: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub position: Option<u32>,
}

impl JobInput {
    /// Optimistic job for a request that has not been acknowledged yet
    pub fn from_request(request: &GenerationRequest) -> Self {
        Self {
            local_id: Some(new_local_id()),
            prompt: request.prompt.clone(),
            parameters: request.parameters(),
            ..Default::default()
        }
    }

    /// Job reported by an active-jobs fetch or a queue update
    pub fn from_record(record: &JobStatusRecord) -> Self {
        Self {
            backend_id: Some(record.job_id.clone()),
            status: record.status.clone(),
            progress: record.progress,
            prompt: record.prompt.clone().unwrap_or_default(),
            parameters: record.parameters.clone().unwrap_or_default(),
            message: record.message.clone(),
            created_at: record
                .created_at
                .as_deref()
                .map(|raw| instant_or(Some(raw), Utc::now())),
            position: record.position,
            ..Default::default()
        }
    }

    /// Build the job, normalizing status and progress
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        let status = self
            .status
            .as_deref()
            .map(JobStatus::normalize)
            .unwrap_or(JobStatus::Queued);
        let progress = self.progress.map(normalize_progress).unwrap_or(0);

        let mut job = Job {
            local_id: self.local_id.unwrap_or_else(new_local_id),
            backend_id: self.backend_id,
            status,
            progress: 0,
            prompt: self.prompt,
            parameters: self.parameters,
            message: self.message,
            created_at: self.created_at.unwrap_or(now),
            result: None,
            error: None,
            position: self.position,
        };
        job.set_state(status, progress);
        job
    }
}
