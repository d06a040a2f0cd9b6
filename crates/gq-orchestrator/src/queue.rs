//! Job queue: the client-side view of jobs in flight
//!
//! Jobs are keyed by their canonical id: the backend id once the backend
//! has accepted the request, the UI-local id before that. An alias table
//! maps both ids to the canonical key so either can be used for lookup.
//!
//! Every source of job information (REST acknowledgement, poll snapshot,
//! push frames) funnels into the same monotonic update: within the
//! non-terminal states status never moves backwards and progress never
//! decreases, so a late poll cannot undo a fresher push update. Terminal
//! jobs leave the map immediately; their ids are remembered for a while so
//! duplicate or late messages are no-ops.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use gq_core::{
    is_cancellation, normalize_progress, GenerationResult, Job, JobInput, JobStatus,
};
use gq_protocol::{
    CompletionUpdate, ErrorUpdate, GenerationRequest, JobStatusRecord, ProgressUpdate,
    ResultRecord, StartAck, StartedUpdate,
};

/// How many finished job ids are remembered
pub const FINISHED_MEMORY: usize = 256;

/// Fallback when a failure carries neither an error nor a status
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Result of ingesting one job record
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Job was not tracked and now is
    Inserted(Job),
    /// Tracked job changed
    Updated(Job),
    /// Nothing changed
    Unchanged,
    /// Record refers to a job that already finished, or is otherwise unusable
    Ignored,
    /// Record reports the job as completed; it left the queue
    Completed(Job),
    /// Record reports the job as failed; it left the queue
    Failed(JobFailure),
}

/// A job that ended without a result
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub job_id: Option<String>,
    /// The tracked job, when there was one
    pub job: Option<Job>,
    pub error: String,
    /// User cancellation rather than a real failure
    pub cancelled: bool,
}

/// Result of a completion message
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    Completed {
        /// The tracked job, when there was one
        job: Option<Job>,
        /// `None` when the completion carried no usable result
        result: Option<GenerationResult>,
    },
    /// The job already finished; nothing happened
    Duplicate,
}

/// Result of reconciling against a full active-jobs snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled {
    pub outcomes: Vec<ApplyOutcome>,
    /// Jobs the backend no longer reports as active
    pub dropped: Vec<Job>,
}

impl Reconciled {
    pub fn changed(&self) -> bool {
        !self.dropped.is_empty()
            || self
                .outcomes
                .iter()
                .any(|o| !matches!(o, ApplyOutcome::Unchanged | ApplyOutcome::Ignored))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    /// Insertion order, the final sort tie-breaker
    seq: u64,
    job: Job,
    /// When the backend id became known locally
    backend_known_at: Option<DateTime<Utc>>,
}

/// Bounded memory of finished job ids
#[derive(Debug, Default)]
struct FinishedIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl FinishedIds {
    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > FINISHED_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ids.clear();
    }
}

/// Map of in-flight jobs
#[derive(Debug, Default)]
pub struct JobQueue {
    entries: HashMap<String, Entry>,
    aliases: HashMap<String, String>,
    finished: FinishedIds,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look a job up by local or backend id
    pub fn get(&self, id: &str) -> Option<&Job> {
        self.resolve(id)
            .and_then(|key| self.entries.get(&key))
            .map(|entry| &entry.job)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resolve(id).is_some()
    }

    /// Whether `id` finished recently
    pub fn is_finished(&self, id: &str) -> bool {
        self.finished.contains(id)
    }

    /// Forget everything, including finished ids
    pub fn clear(&mut self) {
        self.entries.clear();
        self.aliases.clear();
        self.finished.clear();
    }

    fn resolve(&self, id: &str) -> Option<String> {
        if self.entries.contains_key(id) {
            return Some(id.to_string());
        }
        self.aliases
            .get(id)
            .filter(|key| self.entries.contains_key(*key))
            .cloned()
    }

    fn insert_entry(&mut self, entry: Entry) -> Job {
        let key = entry.job.key().to_string();
        self.aliases
            .insert(entry.job.local_id.clone(), key.clone());
        if let Some(backend_id) = &entry.job.backend_id {
            self.aliases.insert(backend_id.clone(), key.clone());
        }
        let job = entry.job.clone();
        self.entries.insert(key, entry);
        job
    }

    fn take_entry(&mut self, id: &str) -> Option<Entry> {
        let key = self.resolve(id)?;
        let entry = self.entries.remove(&key)?;
        self.aliases.remove(&entry.job.local_id);
        if let Some(backend_id) = &entry.job.backend_id {
            self.aliases.remove(backend_id);
        }
        Some(entry)
    }

    fn mark_finished(&mut self, job: &Job) {
        self.finished.insert(&job.local_id);
        if let Some(backend_id) = &job.backend_id {
            self.finished.insert(backend_id);
        }
    }

    /// Start tracking a job
    ///
    /// Returns `None` when a job with any of the same ids is already
    /// tracked or recently finished.
    pub fn enqueue_job(&mut self, input: JobInput, now: DateTime<Utc>) -> Option<Job> {
        let known = |id: &Option<String>| {
            id.as_deref()
                .is_some_and(|id| self.contains(id) || self.is_finished(id))
        };
        if known(&input.local_id) || known(&input.backend_id) {
            return None;
        }

        let has_backend_id = input.backend_id.is_some();
        let job = input.into_job(now);
        if job.status.is_terminal() {
            self.mark_finished(&job);
            return None;
        }

        self.next_seq += 1;
        Some(self.insert_entry(Entry {
            seq: self.next_seq,
            job,
            backend_known_at: has_backend_id.then_some(now),
        }))
    }

    /// Track an optimistic job for a request that has not been sent yet
    pub fn enqueue_request(&mut self, request: &GenerationRequest, now: DateTime<Utc>) -> Job {
        let input = JobInput::from_request(request);
        match self.enqueue_job(input.clone(), now) {
            Some(job) => job,
            // Fresh uuids never collide; build the job anyway
            None => input.into_job(now),
        }
    }

    /// Attach the backend id from a start acknowledgement
    ///
    /// When the backend id is already tracked (the push channel announced
    /// the job before the REST call returned), the optimistic entry is
    /// merged into the tracked one. Returns the resulting job, or `None`
    /// when the job already finished or the local id is unknown.
    pub fn assign_backend_id(
        &mut self,
        local_id: &str,
        ack: &StartAck,
        now: DateTime<Utc>,
    ) -> Option<Job> {
        let backend_id = ack.job_id.trim().to_string();
        let mut entry = self.take_entry(local_id)?;

        if self.finished.contains(&backend_id) {
            self.finished.insert(local_id);
            return None;
        }

        let status = active_status(JobStatus::normalize(&ack.status));
        let progress = ack.progress.map(normalize_progress);

        if let Some(existing_key) = self.resolve(&backend_id) {
            let existing = self.entries.get_mut(&existing_key)?;
            let pushed_local_id =
                std::mem::replace(&mut existing.job.local_id, entry.job.local_id.clone());
            if pushed_local_id != existing_key {
                self.aliases.remove(&pushed_local_id);
            }
            if existing.job.prompt.is_empty() {
                existing.job.prompt = std::mem::take(&mut entry.job.prompt);
            }
            existing.job.parameters = existing.job.parameters.clone().or(&entry.job.parameters);
            existing.job.created_at = existing.job.created_at.min(entry.job.created_at);
            existing.seq = existing.seq.min(entry.seq);
            advance(&mut existing.job, status, progress);

            let job = existing.job.clone();
            self.aliases.insert(job.local_id.clone(), existing_key);
            tracing::debug!(job_id = %backend_id, "Merged optimistic job into pushed job");
            return Some(job);
        }

        entry.job.backend_id = Some(backend_id);
        entry.backend_known_at = Some(now);
        if ack.message.is_some() {
            entry.job.message = ack.message.clone();
        }
        advance(&mut entry.job, status, progress);
        Some(self.insert_entry(entry))
    }

    /// Stop tracking a job without marking it finished
    pub fn remove_job(&mut self, id: &str) -> Option<Job> {
        self.take_entry(id).map(|entry| entry.job)
    }

    /// Ingest one job record (poll snapshot, push `queue_update`, initial
    /// fetch)
    pub fn apply_record(&mut self, record: &JobStatusRecord, now: DateTime<Utc>) -> ApplyOutcome {
        let id = record.job_id.trim();
        if id.is_empty() || self.finished.contains(id) {
            return ApplyOutcome::Ignored;
        }
        let status = record.status.as_deref().map(JobStatus::normalize);
        let progress = record.progress.map(normalize_progress);

        let Some(key) = self.resolve(id) else {
            let input = JobInput::from_record(record);
            if status.is_some_and(|s| s.is_terminal()) {
                // Finished before we ever saw it
                self.finished.insert(id);
                return ApplyOutcome::Ignored;
            }
            return match self.enqueue_job(input, now) {
                Some(job) => ApplyOutcome::Inserted(job),
                None => ApplyOutcome::Ignored,
            };
        };

        let Some(entry) = self.entries.get_mut(&key) else {
            return ApplyOutcome::Ignored;
        };
        let job = &mut entry.job;
        let current = job.status;
        let mut changed = advance(job, status.unwrap_or(current), progress);

        if job.prompt.is_empty() {
            if let Some(prompt) = record.prompt.as_ref().filter(|p| !p.is_empty()) {
                job.prompt = prompt.clone();
                changed = true;
            }
        }
        if let Some(parameters) = &record.parameters {
            let merged = job.parameters.clone().or(parameters);
            if merged != job.parameters {
                job.parameters = merged;
                changed = true;
            }
        }
        if record.message.is_some() && record.message != job.message {
            job.message = record.message.clone();
            changed = true;
        }
        if record.position != job.position {
            job.position = record.position;
            changed = true;
        }

        match job.status {
            JobStatus::Completed => {
                let entry = self.take_entry(&key);
                match entry {
                    Some(entry) => {
                        self.mark_finished(&entry.job);
                        ApplyOutcome::Completed(entry.job)
                    }
                    None => ApplyOutcome::Ignored,
                }
            }
            JobStatus::Failed => {
                let raw_status = record.status.clone().unwrap_or_default();
                let error = failure_text(record.error.as_deref(), record.status.as_deref());
                match self.finish_failed(&key, error.clone()) {
                    Some(job) => ApplyOutcome::Failed(JobFailure {
                        job_id: Some(job.key().to_string()),
                        job: Some(job),
                        error,
                        cancelled: is_cancellation(&raw_status),
                    }),
                    None => ApplyOutcome::Ignored,
                }
            }
            _ if changed => ApplyOutcome::Updated(job.clone()),
            _ => ApplyOutcome::Unchanged,
        }
    }

    /// Ingest a `generation_started` push message
    pub fn apply_started(&mut self, update: &StartedUpdate, now: DateTime<Utc>) -> ApplyOutcome {
        let record = JobStatusRecord {
            job_id: update.job_id.clone(),
            status: Some(
                update
                    .status
                    .clone()
                    .unwrap_or_else(|| "processing".to_string()),
            ),
            progress: None,
            message: update.message.clone(),
            prompt: update.prompt.clone(),
            parameters: update.parameters.clone(),
            created_at: update.created_at.clone(),
            error: None,
            position: None,
        };
        self.apply_record(&record, now)
    }

    /// Apply a full active-jobs snapshot
    ///
    /// Jobs whose backend id was known before `requested_at` but are absent
    /// from the snapshot are dropped. Optimistic jobs without a backend id
    /// are kept.
    pub fn reconcile_snapshot(
        &mut self,
        records: &[JobStatusRecord],
        requested_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Reconciled {
        let outcomes = records
            .iter()
            .map(|record| self.apply_record(record, now))
            .collect();

        let reported: HashSet<&str> = records.iter().map(|r| r.job_id.trim()).collect();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                let Some(backend_id) = entry.job.backend_id.as_deref() else {
                    return false;
                };
                let known_before = entry
                    .backend_known_at
                    .is_some_and(|known| known <= requested_at);
                known_before && !reported.contains(backend_id)
            })
            .map(|(key, _)| key.clone())
            .collect();

        let dropped = stale
            .iter()
            .filter_map(|key| self.take_entry(key))
            .map(|entry| entry.job)
            .collect::<Vec<_>>();
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Dropped jobs no longer active on backend");
        }

        Reconciled { outcomes, dropped }
    }

    /// Apply a progress frame
    ///
    /// Unknown jobs are not fabricated from a bare progress message.
    pub fn handle_progress_message(&mut self, update: &ProgressUpdate) -> Option<Job> {
        let key = self.resolve(update.job_id.trim())?;
        let entry = self.entries.get_mut(&key)?;

        let status = update
            .status
            .as_deref()
            .map(JobStatus::normalize)
            .map(active_status)
            .unwrap_or(JobStatus::Processing);
        advance(
            &mut entry.job,
            status,
            update.progress.map(normalize_progress),
        );
        if update.message.is_some() {
            entry.job.message = update.message.clone();
        }
        Some(entry.job.clone())
    }

    /// Apply a completion frame
    ///
    /// Builds the result, removes the job and remembers its id. A second
    /// completion for the same id is a no-op.
    pub fn handle_completion_message(
        &mut self,
        update: &CompletionUpdate,
        now: DateTime<Utc>,
    ) -> CompletionOutcome {
        let id = update.job_id.trim();
        if self.finished.contains(id) {
            return CompletionOutcome::Duplicate;
        }

        let job = self.take_entry(id).map(|entry| {
            let mut job = entry.job;
            job.set_state(JobStatus::Completed, 100);
            job
        });
        match &job {
            Some(job) => self.mark_finished(job),
            None => self.finished.insert(id),
        }

        let record = completion_record(update, job.as_ref());
        let result = match GenerationResult::from_record(record, now) {
            Ok(mut result) => {
                result.job_id = Some(id.to_string());
                Some(result)
            }
            Err(e) => {
                tracing::warn!(job_id = %id, "Completion without a usable result: {}", e);
                None
            }
        };

        let job = job.map(|mut job| {
            job.result = result.clone();
            job
        });
        CompletionOutcome::Completed { job, result }
    }

    /// Apply an error frame
    ///
    /// Returns `None` for a duplicate error on an already finished job.
    pub fn handle_error_message(&mut self, update: &ErrorUpdate) -> Option<JobFailure> {
        let error = failure_text(update.error.as_deref(), update.status.as_deref());
        let cancelled = update.status.as_deref().is_some_and(is_cancellation)
            || is_cancellation(&error);

        let Some(id) = update
            .job_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            return Some(JobFailure {
                job_id: None,
                job: None,
                error,
                cancelled,
            });
        };

        if self.finished.contains(id) {
            return None;
        }
        let job = self.finish_failed(id, error.clone());
        if job.is_none() {
            self.finished.insert(id);
        }
        Some(JobFailure {
            job_id: Some(id.to_string()),
            job,
            error,
            cancelled,
        })
    }

    /// Remove a job the user cancelled
    pub fn finish_cancelled(&mut self, id: &str) -> Option<Job> {
        self.finish_failed(id, "cancelled".to_string())
    }

    fn finish_failed(&mut self, id: &str, error: String) -> Option<Job> {
        let mut job = self.take_entry(id)?.job;
        job.status = JobStatus::Failed;
        job.error = Some(error);
        self.mark_finished(&job);
        Some(job)
    }

    /// Active jobs, `processing` before `queued`, then oldest first
    pub fn sorted_active_jobs(&self) -> Vec<Job> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            status_order(a.job.status)
                .cmp(&status_order(b.job.status))
                .then(a.job.created_at.cmp(&b.job.created_at))
                .then(a.seq.cmp(&b.seq))
        });
        entries.into_iter().map(|entry| entry.job.clone()).collect()
    }

    /// Jobs a cancel request makes sense for
    pub fn cancellable_jobs(&self) -> Vec<Job> {
        self.sorted_active_jobs()
            .into_iter()
            .filter(is_job_cancellable)
            .collect()
    }
}

/// True iff the job is queued or processing
pub fn is_job_cancellable(job: &Job) -> bool {
    job.status.is_cancellable()
}

/// Monotonic update of a non-terminal job
fn advance(job: &mut Job, status: JobStatus, progress: Option<u8>) -> bool {
    if job.status.is_terminal() {
        return false;
    }
    let status = if status.rank() < job.status.rank() {
        job.status
    } else {
        status
    };
    let progress = progress.map_or(job.progress, |p| p.max(job.progress));
    job.set_state(status, progress)
}

/// Terminal states only arrive through completion and error frames
fn active_status(status: JobStatus) -> JobStatus {
    if status.is_terminal() {
        JobStatus::Processing
    } else {
        status
    }
}

fn status_order(status: JobStatus) -> u8 {
    match status {
        JobStatus::Processing => 0,
        JobStatus::Queued => 1,
        JobStatus::Completed | JobStatus::Failed => 2,
    }
}

fn failure_text(error: Option<&str>, status: Option<&str>) -> String {
    [error, status]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|text| !text.is_empty())
        .unwrap_or(UNKNOWN_ERROR)
        .to_string()
}

/// Result record for a completion frame, filling gaps from the tracked job
fn completion_record(update: &CompletionUpdate, job: Option<&Job>) -> ResultRecord {
    let mut record = update.result.clone().unwrap_or_else(|| ResultRecord {
        id: update.job_id.trim().to_string(),
        prompt: None,
        negative_prompt: None,
        image_url: None,
        image_urls: Vec::new(),
        thumbnail_url: None,
        parameters: None,
        inline_parameters: Default::default(),
        created_at: None,
        rating: None,
        is_favorite: None,
    });

    if record.image_url.is_none() {
        record.image_url = update.image_url.clone();
    }
    if record.image_urls.is_empty() {
        record.image_urls = update.images.clone();
    }
    if record.thumbnail_url.is_none() {
        record.thumbnail_url = update.thumbnail_url.clone();
    }
    if record.created_at.is_none() {
        record.created_at = update.created_at.clone();
    }
    if record.negative_prompt.is_none() {
        record.negative_prompt = update.negative_prompt.clone();
    }
    if record.prompt.as_deref().map_or(true, str::is_empty) {
        record.prompt = update
            .prompt
            .clone()
            .or_else(|| job.map(|job| job.prompt.clone()));
    }

    let mut parameters = record.merged_parameters();
    if let Some(pushed) = &update.parameters {
        parameters = parameters.or(pushed);
    }
    if let Some(job) = job {
        parameters = parameters.or(&job.parameters);
    }
    record.parameters = Some(parameters);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(id: &str, status: &str) -> JobStatusRecord {
        JobStatusRecord {
            job_id: id.to_string(),
            status: Some(status.to_string()),
            progress: None,
            message: None,
            prompt: None,
            parameters: None,
            created_at: None,
            error: None,
            position: None,
        }
    }

    fn ack(id: &str) -> StartAck {
        StartAck {
            job_id: id.to_string(),
            status: "queued".to_string(),
            progress: None,
            message: None,
        }
    }

    fn backend_job(queue: &mut JobQueue, id: &str, status: &str, created: i64) -> Job {
        queue
            .enqueue_job(
                JobInput {
                    backend_id: Some(id.to_string()),
                    status: Some(status.to_string()),
                    created_at: Some(at(created)),
                    ..Default::default()
                },
                at(100),
            )
            .unwrap()
    }

    #[test]
    fn test_sorted_processing_before_queued() {
        let mut queue = JobQueue::new();
        backend_job(&mut queue, "a", "queued", 1);
        backend_job(&mut queue, "b", "processing", 2);
        backend_job(&mut queue, "c", "processing", 0);

        let order: Vec<_> = queue
            .sorted_active_jobs()
            .into_iter()
            .map(|job| (job.key().to_string(), job.status))
            .collect();
        assert_eq!(
            order,
            vec![
                ("c".to_string(), JobStatus::Processing),
                ("b".to_string(), JobStatus::Processing),
                ("a".to_string(), JobStatus::Queued),
            ]
        );
        // Reading does not mutate
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_sort_ties_keep_insertion_order() {
        let mut queue = JobQueue::new();
        for id in ["x", "y", "z"] {
            backend_job(&mut queue, id, "queued", 5);
        }
        let keys: Vec<_> = queue
            .sorted_active_jobs()
            .iter()
            .map(|job| job.key().to_string())
            .collect();
        assert_eq!(keys, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_enqueue_is_idempotent_by_id() {
        let mut queue = JobQueue::new();
        backend_job(&mut queue, "j1", "queued", 0);
        let again = queue.enqueue_job(
            JobInput {
                backend_id: Some("j1".into()),
                ..Default::default()
            },
            at(1),
        );
        assert!(again.is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_optimistic_job_gets_backend_id() {
        let mut queue = JobQueue::new();
        let mut request = GenerationRequest::new("x");
        request.steps = Some(20);
        let job = queue.enqueue_request(&request, at(0));
        assert_eq!(job.status, JobStatus::Queued);

        let job = queue.assign_backend_id(&job.local_id, &ack("j1"), at(1)).unwrap();
        assert_eq!(job.key(), "j1");
        assert_eq!(queue.get("j1").unwrap().local_id, job.local_id);
        assert_eq!(queue.get(&job.local_id).unwrap().key(), "j1");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_started_before_ack_is_merged() {
        let mut queue = JobQueue::new();
        let optimistic = queue.enqueue_request(&GenerationRequest::new("a fox"), at(0));

        let started = StartedUpdate {
            job_id: "j9".into(),
            status: Some("processing".into()),
            prompt: None,
            parameters: None,
            created_at: None,
            message: None,
        };
        let pushed = match queue.apply_started(&started, at(1)) {
            ApplyOutcome::Inserted(job) => job,
            other => panic!("expected insert, got {:?}", other),
        };
        assert_eq!(queue.len(), 2);

        let merged = queue
            .assign_backend_id(&optimistic.local_id, &ack("j9"), at(2))
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(merged.local_id, optimistic.local_id);
        assert_eq!(merged.prompt, "a fox");
        // The ack says queued, but the push already said processing
        assert_eq!(merged.status, JobStatus::Processing);
        assert!(queue.get(&optimistic.local_id).is_some());

        // Only the surviving local id and the backend id stay aliased
        assert!(queue.get(&pushed.local_id).is_none());
        assert_eq!(queue.aliases.len(), 2);

        queue.remove_job("j9").unwrap();
        assert!(queue.aliases.is_empty());
    }

    #[test]
    fn test_ack_after_completion_drops_optimistic_job() {
        let mut queue = JobQueue::new();
        let optimistic = queue.enqueue_request(&GenerationRequest::new("x"), at(0));
        queue.handle_completion_message(
            &CompletionUpdate::with_images("j1", vec!["u".into()]),
            at(1),
        );

        assert!(queue
            .assign_backend_id(&optimistic.local_id, &ack("j1"), at(2))
            .is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_progress_updates_known_jobs_only() {
        let mut queue = JobQueue::new();
        assert!(queue
            .handle_progress_message(&ProgressUpdate::new("ghost", 0.5))
            .is_none());
        assert!(queue.is_empty());

        backend_job(&mut queue, "j1", "queued", 0);
        let job = queue
            .handle_progress_message(&ProgressUpdate::new("j1", 0.5))
            .unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 50);
    }

    #[test]
    fn test_late_poll_cannot_regress_push() {
        let mut queue = JobQueue::new();
        backend_job(&mut queue, "j1", "queued", 0);
        queue.handle_progress_message(&ProgressUpdate::new("j1", 0.6));

        let mut stale = record("j1", "queued");
        stale.progress = Some(0.2);
        assert_eq!(queue.apply_record(&stale, at(5)), ApplyOutcome::Unchanged);

        let job = queue.get("j1").unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 60);
    }

    #[test]
    fn test_completion_is_idempotent() {
        let mut queue = JobQueue::new();
        backend_job(&mut queue, "j1", "processing", 0);
        let update = CompletionUpdate::with_images("j1", vec!["url".into()]);

        let first = queue.handle_completion_message(&update, at(3));
        let CompletionOutcome::Completed { job, result } = first else {
            panic!("expected completion");
        };
        let result = result.unwrap();
        assert_eq!(result.image_url, "url");
        assert_eq!(result.job_id.as_deref(), Some("j1"));
        assert_eq!(result.created_at, at(3));
        assert_eq!(job.unwrap().progress, 100);
        assert!(queue.is_empty());

        assert_eq!(
            queue.handle_completion_message(&update, at(4)),
            CompletionOutcome::Duplicate
        );
        // A late poll must not resurrect it either
        assert_eq!(
            queue.apply_record(&record("j1", "processing"), at(5)),
            ApplyOutcome::Ignored
        );
    }

    #[test]
    fn test_completion_fills_prompt_from_job() {
        let mut queue = JobQueue::new();
        let optimistic = queue.enqueue_request(&GenerationRequest::new("a red barn"), at(0));
        queue.assign_backend_id(&optimistic.local_id, &ack("j1"), at(1));

        let CompletionOutcome::Completed { result, .. } = queue.handle_completion_message(
            &CompletionUpdate::with_images("j1", vec!["u".into()]),
            at(2),
        ) else {
            panic!("expected completion");
        };
        assert_eq!(result.unwrap().prompt, "a red barn");
    }

    #[test]
    fn test_completion_without_image_removes_job() {
        let mut queue = JobQueue::new();
        backend_job(&mut queue, "j1", "processing", 0);
        let outcome = queue.handle_completion_message(&CompletionUpdate::with_images("j1", vec![]), at(1));
        assert!(matches!(
            outcome,
            CompletionOutcome::Completed { result: None, job: Some(_) }
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_error_text_priority() {
        let mut queue = JobQueue::new();
        backend_job(&mut queue, "a", "processing", 0);
        backend_job(&mut queue, "b", "processing", 0);
        backend_job(&mut queue, "c", "processing", 0);

        let failure = queue
            .handle_error_message(&ErrorUpdate {
                job_id: Some("a".into()),
                error: Some("CUDA out of memory".into()),
                status: Some("failed".into()),
                message: None,
            })
            .unwrap();
        assert_eq!(failure.error, "CUDA out of memory");
        assert!(!failure.cancelled);
        assert_eq!(failure.job.unwrap().status, JobStatus::Failed);

        let failure = queue
            .handle_error_message(&ErrorUpdate {
                job_id: Some("b".into()),
                status: Some("cancelled".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failure.error, "cancelled");
        assert!(failure.cancelled);

        let failure = queue
            .handle_error_message(&ErrorUpdate {
                job_id: Some("c".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failure.error, UNKNOWN_ERROR);

        assert!(queue.is_empty());
        assert!(queue
            .handle_error_message(&ErrorUpdate {
                job_id: Some("c".into()),
                ..Default::default()
            })
            .is_none());
    }

    #[test]
    fn test_poll_reports_failure() {
        let mut queue = JobQueue::new();
        backend_job(&mut queue, "j1", "processing", 0);
        let mut failed = record("j1", "error");
        failed.error = Some("bad seed".into());

        match queue.apply_record(&failed, at(1)) {
            ApplyOutcome::Failed(failure) => assert_eq!(failure.error, "bad seed"),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reconcile_drops_vanished_backend_jobs() {
        let mut queue = JobQueue::new();
        backend_job(&mut queue, "gone", "processing", 0);
        backend_job(&mut queue, "kept", "queued", 0);
        let optimistic = queue.enqueue_request(&GenerationRequest::new("x"), at(0));

        let reconciled = queue.reconcile_snapshot(
            &[record("kept", "running"), record("new", "queued")],
            at(200),
            at(201),
        );
        assert!(reconciled.changed());
        assert_eq!(reconciled.dropped.len(), 1);
        assert_eq!(reconciled.dropped[0].key(), "gone");

        assert!(queue.get("gone").is_none());
        assert_eq!(queue.get("kept").unwrap().status, JobStatus::Processing);
        assert!(queue.get("new").is_some());
        assert!(queue.get(&optimistic.local_id).is_some());
    }

    #[test]
    fn test_reconcile_keeps_jobs_acknowledged_after_request() {
        let mut queue = JobQueue::new();
        let optimistic = queue.enqueue_request(&GenerationRequest::new("x"), at(0));
        queue.assign_backend_id(&optimistic.local_id, &ack("j1"), at(10));

        let reconciled = queue.reconcile_snapshot(&[], at(5), at(11));
        assert!(reconciled.dropped.is_empty());
        assert!(queue.get("j1").is_some());
    }

    #[test]
    fn test_cancellable_jobs() {
        let mut queue = JobQueue::new();
        backend_job(&mut queue, "a", "queued", 0);
        backend_job(&mut queue, "b", "processing", 1);
        assert_eq!(queue.cancellable_jobs().len(), 2);

        let job = queue.finish_cancelled("a").unwrap();
        assert!(!is_job_cancellable(&job));
        assert_eq!(queue.cancellable_jobs().len(), 1);
    }

    #[test]
    fn test_finished_memory_is_bounded() {
        let mut queue = JobQueue::new();
        for n in 0..(FINISHED_MEMORY + 10) {
            queue.handle_error_message(&ErrorUpdate {
                job_id: Some(format!("j{}", n)),
                ..Default::default()
            });
        }
        assert!(!queue.is_finished("j0"));
        assert!(queue.is_finished(&format!("j{}", FINISHED_MEMORY + 9)));
    }
}
