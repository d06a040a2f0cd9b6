//! REST surface of the generation backend

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use gq_core::TransportError;
use gq_protocol::{GenerationRequest, ResultPatch, StartAck, SystemStatus};

/// Parameters of a recent-results fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsQuery {
    pub limit: usize,
    /// Free-text prompt filter
    pub search: Option<String>,
    pub favorites_only: bool,
}

impl ResultsQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            search: None,
            favorites_only: false,
        }
    }

    /// Query-string pairs, skipping unset filters
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("limit", self.limit.to_string())];
        if let Some(search) = self.search.as_deref().map(str::trim) {
            if !search.is_empty() {
                pairs.push(("search", search.to_string()));
            }
        }
        if self.favorites_only {
            pairs.push(("favorites", "true".to_string()));
        }
        pairs
    }
}

/// A downloaded image
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Bytes,
    /// From `Content-Disposition`, or `{id}.png`
    pub filename: String,
    pub content_type: Option<String>,
}

/// Calls the generation backend understands
///
/// List endpoints return raw records so that callers can validate each one
/// independently.
#[async_trait]
pub trait GenerationApi: Send + Sync {
    /// `GET /system/status`
    async fn system_status(&self) -> Result<SystemStatus, TransportError>;

    /// `GET /generation/jobs/active`
    async fn active_jobs(&self) -> Result<Vec<Value>, TransportError>;

    /// `GET /generation/results`
    async fn recent_results(&self, query: &ResultsQuery) -> Result<Vec<Value>, TransportError>;

    /// `POST /generation/generate`
    async fn start_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<StartAck, TransportError>;

    /// `POST /generation/jobs/{id}/cancel`
    async fn cancel_job(&self, job_id: &str) -> Result<(), TransportError>;

    /// `DELETE /generation/results/{id}`
    async fn delete_result(&self, result_id: &str) -> Result<(), TransportError>;

    /// `PATCH /generation/results/{id}`
    async fn update_result(&self, result_id: &str, patch: &ResultPatch)
        -> Result<(), TransportError>;

    /// `GET /generation/results/{id}/download`
    async fn download_result(&self, result_id: &str) -> Result<Download, TransportError>;
}
