//! Read-only view handed to consumers

use serde::Serialize;

use gq_client::ResultsQuery;
use gq_core::{GenerationResult, Job};
use gq_protocol::SystemStatus;

/// Search/favourites filter applied to the results fetch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResultsFilter {
    pub search: Option<String>,
    pub favorites_only: bool,
}

impl ResultsFilter {
    pub fn search(text: impl Into<String>) -> Self {
        Self {
            search: Some(text.into()),
            favorites_only: false,
        }
    }

    pub fn favorites() -> Self {
        Self {
            search: None,
            favorites_only: true,
        }
    }

    /// Trim the search text; blank means no search
    pub fn normalized(self) -> Self {
        let search = self
            .search
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self { search, ..self }
    }

    pub fn is_active(&self) -> bool {
        self.search.is_some() || self.favorites_only
    }

    pub fn to_query(&self, limit: usize) -> ResultsQuery {
        let mut query = ResultsQuery::new(limit);
        query.search = self.search.clone();
        query.favorites_only = self.favorites_only;
        query
    }
}

/// Everything a consumer renders
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// Active jobs, `processing` first, then oldest first
    pub jobs: Vec<Job>,
    /// Recent results, newest first
    pub results: Vec<GenerationResult>,
    pub system_status: Option<SystemStatus>,
    /// Push channel is open
    pub connected: bool,
    /// First full refresh succeeded
    pub initialized: bool,
    pub base_url: String,
    pub history_limit: usize,
    pub filter: ResultsFilter,
    /// Backend-reported queue length, when known
    pub queue_length: Option<u64>,
}

impl Snapshot {
    pub fn find_job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.matches(id))
    }

    pub fn find_result(&self, id: &str) -> Option<&GenerationResult> {
        self.results.iter().find(|r| r.id == id)
    }

    pub fn has_active_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }
}

/// Outcome of `clear_queue`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearSummary {
    pub cancelled: usize,
    pub failed: usize,
}
