//! Transport adapter
//!
//! Wraps the REST client and the push channel behind one object. Refreshes
//! validate every record independently and hand normalized data to a
//! [`TransportCallbacks`] implementation; nothing here holds business state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use gq_core::config::ClientConfig;
use gq_core::{GenerationResult, TransportError, ValidationError};
use gq_protocol::{
    CompletionUpdate, ErrorUpdate, GenerationRequest, JobStatusRecord, ProgressUpdate,
    PushMessage, ResultPatch, ResultRecord, StartAck, StartedUpdate, SystemStatus,
};

use crate::api::{Download, GenerationApi, ResultsQuery};
use crate::connection::ConnectionState;
use crate::endpoint::Endpoint;
use crate::push::{PushChannel, PushEnvelope, PushEvent};
use crate::rest::RestClient;

/// Where a batch of job records came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobsSource {
    /// Full active-jobs fetch; jobs missing from it are no longer active
    Snapshot,
    /// Push `queue_update`; may be partial
    Push,
}

/// Validated job records
#[derive(Debug, Clone, PartialEq)]
pub struct JobsUpdate {
    pub source: JobsSource,
    pub records: Vec<JobStatusRecord>,
    pub queue_length: Option<u64>,
    /// When the request (or frame) that produced the records was issued
    pub requested_at: DateTime<Utc>,
}

/// Receiver of everything the transport learns
///
/// Called from background tasks; implementations must not block.
pub trait TransportCallbacks: Send + Sync {
    fn on_system_status(&self, status: SystemStatus);

    fn on_jobs_update(&self, update: JobsUpdate);

    /// `epoch` is the value passed to the refresh that produced the list
    fn on_recent_results(&self, results: Vec<GenerationResult>, epoch: u64);

    fn on_progress(&self, update: ProgressUpdate);

    fn on_complete(&self, update: CompletionUpdate);

    fn on_error(&self, update: ErrorUpdate);

    fn on_started(&self, update: StartedUpdate);

    fn on_connection_change(&self, live: bool);
}

/// REST + push transport for one backend at a time
pub struct TransportAdapter {
    endpoint: Arc<Endpoint>,
    api: Arc<dyn GenerationApi>,
    push: PushChannel,
    callbacks: Arc<dyn TransportCallbacks>,
    /// Bumped on every base-URL change; responses from older generations
    /// are discarded
    generation: AtomicU64,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PushEnvelope>>>,
    shutdown: CancellationToken,
}

impl TransportAdapter {
    /// Adapter talking to the backend described by `config`
    pub fn new(
        config: &ClientConfig,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> Result<Self, TransportError> {
        let endpoint = Arc::new(Endpoint::new(&config.base_url, config.api_key.clone())?);
        let api = Arc::new(RestClient::new(Arc::clone(&endpoint), config)?);
        Ok(Self::with_api(endpoint, api, config, callbacks))
    }

    /// Adapter with a custom REST implementation
    pub fn with_api(
        endpoint: Arc<Endpoint>,
        api: Arc<dyn GenerationApi>,
        config: &ClientConfig,
        callbacks: Arc<dyn TransportCallbacks>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let push = PushChannel::new(Arc::clone(&endpoint), config, events_tx);

        Self {
            endpoint,
            api,
            push,
            callbacks,
            generation: AtomicU64::new(0),
            events_rx: Mutex::new(Some(events_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn base_url(&self) -> String {
        self.endpoint.base_url()
    }

    /// Point at a different backend
    ///
    /// In-flight responses from the old backend are discarded and an open
    /// push channel is reconnected. Returns whether the URL changed.
    pub fn set_base_url(&self, raw: &str) -> Result<bool, TransportError> {
        if !self.endpoint.set_base_url(raw)? {
            return Ok(false);
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        tracing::info!(base_url = %self.endpoint.base_url(), "Backend changed");
        if self.push.is_running() {
            self.push.reconnect();
        }
        Ok(true)
    }

    /// Current backend generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64, what: &str) -> bool {
        let current = self.generation();
        if generation != current {
            tracing::debug!(
                stale = generation,
                current,
                "Discarding {} from previous backend",
                what
            );
        }
        generation == current
    }

    // --- refreshes ---

    pub async fn refresh_system_status(&self) -> Result<(), TransportError> {
        let generation = self.generation();
        let status = self.api.system_status().await?;
        if self.is_current(generation, "system status") {
            self.callbacks.on_system_status(status);
        }
        Ok(())
    }

    pub async fn refresh_active_jobs(&self) -> Result<(), TransportError> {
        let generation = self.generation();
        let requested_at = Utc::now();
        let raw = self.api.active_jobs().await?;
        if !self.is_current(generation, "active jobs") {
            return Ok(());
        }
        self.callbacks.on_jobs_update(JobsUpdate {
            source: JobsSource::Snapshot,
            records: parse_job_records(raw),
            queue_length: None,
            requested_at,
        });
        Ok(())
    }

    pub async fn refresh_recent_results(
        &self,
        query: &ResultsQuery,
        epoch: u64,
    ) -> Result<(), TransportError> {
        let generation = self.generation();
        let raw = self.api.recent_results(query).await?;
        if !self.is_current(generation, "recent results") {
            return Ok(());
        }
        self.callbacks
            .on_recent_results(parse_results(raw, Utc::now()), epoch);
        Ok(())
    }

    /// Run the three refreshes concurrently; the first error is reported
    /// once all have settled
    pub async fn refresh_all(&self, query: &ResultsQuery, epoch: u64) -> Result<(), TransportError> {
        let (status, jobs, results) = futures::join!(
            self.refresh_system_status(),
            self.refresh_active_jobs(),
            self.refresh_recent_results(query, epoch),
        );
        status.and(jobs).and(results)
    }

    // --- actions ---

    pub async fn start_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<StartAck, TransportError> {
        let ack = self.api.start_generation(request).await?;
        if ack.job_id.trim().is_empty() {
            return Err(TransportError::Decode(
                "start acknowledgement without a job id".to_string(),
            ));
        }
        tracing::info!(job_id = %ack.job_id, status = %ack.status, "Generation accepted");
        Ok(ack)
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<(), TransportError> {
        self.api.cancel_job(job_id).await
    }

    pub async fn delete_result(&self, result_id: &str) -> Result<(), TransportError> {
        self.api.delete_result(result_id).await
    }

    pub async fn rate_result(&self, result_id: &str, rating: u8) -> Result<(), TransportError> {
        let patch = ResultPatch {
            rating: Some(rating),
            is_favorite: None,
        };
        self.api.update_result(result_id, &patch).await
    }

    pub async fn set_favorite(&self, result_id: &str, favorite: bool) -> Result<(), TransportError> {
        let patch = ResultPatch {
            rating: None,
            is_favorite: Some(favorite),
        };
        self.api.update_result(result_id, &patch).await
    }

    pub async fn download_result(&self, result_id: &str) -> Result<Download, TransportError> {
        self.api.download_result(result_id).await
    }

    // --- push channel ---

    /// Open the push channel and start dispatching its events
    pub fn start_push(&self) {
        if let Some(rx) = self.events_rx.lock().take() {
            let dispatcher = Dispatcher {
                callbacks: Arc::clone(&self.callbacks),
                session: self.push.session_counter(),
            };
            tokio::spawn(dispatcher.run(rx, self.shutdown.clone()));
        }
        self.push.start();
    }

    pub fn stop_push(&self) {
        self.push.stop();
    }

    pub fn reconnect_push(&self) {
        self.push.reconnect();
    }

    pub fn is_live(&self) -> bool {
        self.push.is_live()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.push.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.push.state()
    }

    /// Stop the push channel and the dispatcher for good
    pub fn shutdown(&self) {
        self.push.stop();
        self.shutdown.cancel();
    }
}

impl Drop for TransportAdapter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Routes push events to the callbacks
struct Dispatcher {
    callbacks: Arc<dyn TransportCallbacks>,
    session: Arc<AtomicU64>,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PushEnvelope>, token: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                _ = token.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            match envelope.event {
                PushEvent::Opened => self.callbacks.on_connection_change(true),
                PushEvent::Closed { .. } => self.callbacks.on_connection_change(false),
                PushEvent::Message(message) => {
                    if envelope.session != self.session.load(Ordering::SeqCst) {
                        tracing::debug!(
                            kind = message.kind_name(),
                            "Dropping frame from a previous push session"
                        );
                        continue;
                    }
                    dispatch(self.callbacks.as_ref(), message);
                }
            }
        }
    }
}

/// Hand one push message to the matching callback
pub fn dispatch(callbacks: &dyn TransportCallbacks, message: PushMessage) {
    match message {
        PushMessage::Progress(update) => callbacks.on_progress(update),
        PushMessage::Complete(update) => callbacks.on_complete(update),
        PushMessage::Error(update) => callbacks.on_error(update),
        PushMessage::Started(update) => callbacks.on_started(update),
        PushMessage::SystemStatus(status) => callbacks.on_system_status(status),
        PushMessage::QueueUpdate(update) => callbacks.on_jobs_update(JobsUpdate {
            source: JobsSource::Push,
            records: parse_job_records(update.records),
            queue_length: update.queue_length,
            requested_at: Utc::now(),
        }),
        PushMessage::Unknown { kind, .. } => {
            tracing::debug!(kind = %kind, "Ignoring unknown push message");
        }
    }
}

/// Validate job records one by one, dropping the bad ones
pub fn parse_job_records(raw: Vec<Value>) -> Vec<JobStatusRecord> {
    raw.into_iter()
        .filter_map(|value| match parse_job_record(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Dropping job record: {}", e);
                None
            }
        })
        .collect()
}

fn parse_job_record(value: Value) -> Result<JobStatusRecord, ValidationError> {
    let record: JobStatusRecord = serde_json::from_value(value)
        .map_err(|e| ValidationError::InvalidJob(e.to_string()))?;
    if record.job_id.trim().is_empty() {
        return Err(ValidationError::InvalidJob("empty job id".to_string()));
    }
    Ok(record)
}

/// Validate result records one by one, dropping the bad ones
pub fn parse_results(raw: Vec<Value>, now: chrono::DateTime<Utc>) -> Vec<GenerationResult> {
    raw.into_iter()
        .filter_map(|value| {
            let parsed = serde_json::from_value::<ResultRecord>(value)
                .map_err(|e| ValidationError::InvalidResult {
                    id: "?".to_string(),
                    reason: e.to_string(),
                })
                .and_then(|record| GenerationResult::from_record(record, now));
            match parsed {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::warn!("Dropping result record: {}", e);
                    None
                }
            }
        })
        .collect()
}
