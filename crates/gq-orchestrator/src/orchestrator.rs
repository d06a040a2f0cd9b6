//! The orchestrator: one coherent view of jobs and results
//!
//! An [`Orchestrator`] owns a [`TransportAdapter`] and the client-side
//! state built from everything the transport reports: the [`JobQueue`],
//! the [`ResultCache`], the latest system status and the push channel's
//! connectivity. Consumers never mutate that state directly; they call the
//! action surface and read [`Snapshot`]s from a `watch` channel.
//!
//! # State model
//!
//! All mutation happens inside short synchronous critical sections on a
//! `parking_lot::Mutex`, which is never held across an `.await`. Every
//! mutation publishes a fresh snapshot before the lock is released, so
//! subscribers observe mutations in the order they were applied.
//! Notifications and debug lines are delivered after the lock is dropped.
//!
//! # Staleness
//!
//! Three independent guards keep late responses from overwriting fresher
//! state:
//! - the transport drops responses that started before a base-URL change;
//! - every results fetch takes a new epoch from an [`EpochGuard`] and its
//!   response is applied only if no newer fetch was started since;
//! - after [`Orchestrator::cleanup`], every callback is ignored.
//!
//! # Background tasks
//!
//! [`Orchestrator::initialize`] opens the push channel and starts two
//! periodic tasks: the queue poller (see [`crate::poller`]) and the system
//! status refresh. Both hold only a weak reference to the orchestrator and
//! stop on cleanup.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;

use gq_client::{
    ConnectionState, Download, Endpoint, GenerationApi, JobsSource, JobsUpdate, ResultsQuery,
    TransportAdapter, TransportCallbacks,
};
use gq_core::config::ClientConfig;
use gq_core::{
    ActionError, GenerationResult, GqError, Job, Notification, NotificationLevel, TransportError,
};
use gq_protocol::{
    CompletionUpdate, ErrorUpdate, GenerationRequest, ProgressUpdate, StartedUpdate, SystemStatus,
};

use crate::debounce::Debouncer;
use crate::epoch::EpochGuard;
use crate::poller::{run_periodic, should_poll_queue, PollGuard, PollOutcome};
use crate::queue::{is_job_cancellable, ApplyOutcome, CompletionOutcome, JobFailure, JobQueue};
use crate::results::ResultCache;
use crate::snapshot::{ClearSummary, ResultsFilter, Snapshot};
use crate::tentative::Tentative;

/// Where notifications and debug lines go
///
/// Implementations are called outside any orchestrator lock and may call
/// back into the orchestrator.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);

    fn debug(&self, line: &str);
}

/// Sink for standalone use; the orchestrator's own `tracing` output is all
/// that remains
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, _notification: &Notification) {}

    fn debug(&self, _line: &str) {}
}

struct State {
    queue: JobQueue,
    results: ResultCache,
    system_status: Option<SystemStatus>,
    connected: bool,
    initialized: bool,
    base_url: String,
    filter: ResultsFilter,
    queue_length: Option<u64>,
}

impl State {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            jobs: self.queue.sorted_active_jobs(),
            results: self.results.list().to_vec(),
            system_status: self.system_status.clone(),
            connected: self.connected,
            initialized: self.initialized,
            base_url: self.base_url.clone(),
            history_limit: self.results.history_limit(),
            filter: self.filter.clone(),
            queue_length: self.queue_length,
        }
    }
}

/// State plus everything the transport callbacks need
struct Shared {
    state: Mutex<State>,
    snapshot_tx: watch::Sender<Snapshot>,
    epoch: EpochGuard,
    disposed: AtomicBool,
    /// Set when the cached results may lag behind the backend
    results_stale: AtomicBool,
    sink: Arc<dyn NotificationSink>,
}

impl Shared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Mutate the state and publish the result
    fn update<R>(&self, mutate: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock();
        let out = mutate(&mut state);
        let next = state.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        out
    }

    fn read<R>(&self, inspect: impl FnOnce(&State) -> R) -> R {
        inspect(&self.state.lock())
    }

    fn results_query(&self) -> ResultsQuery {
        self.read(|state| state.filter.to_query(state.results.history_limit()))
    }

    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Error => tracing::warn!("{}", notification.message),
            _ => tracing::info!("{}", notification.message),
        }
        self.sink.notify(&notification);
    }

    fn debug(&self, line: String) {
        tracing::debug!("{}", line);
        self.sink.debug(&line);
    }

    fn notify_failure(&self, failure: &JobFailure) {
        let id = failure.job_id.as_deref().unwrap_or("unknown");
        if failure.cancelled {
            self.notify(Notification::info(format!("Job {} cancelled", id)));
        } else if failure.job_id.is_some() {
            self.notify(Notification::error(format!(
                "Generation {} failed: {}",
                id, failure.error
            )));
        } else {
            self.notify(Notification::error(format!(
                "Backend error: {}",
                failure.error
            )));
        }
    }

    fn notify_completed(&self, job: Option<&Job>, result: Option<&GenerationResult>) {
        let subject = job
            .map(|job| job.prompt.as_str())
            .or(result.map(|r| r.prompt.as_str()))
            .filter(|prompt| !prompt.is_empty());
        let message = match subject {
            Some(prompt) => format!("Generation complete: {}", truncate(prompt, 60)),
            None => "Generation complete".to_string(),
        };
        self.notify(Notification::success(message));
    }
}

impl TransportCallbacks for Shared {
    fn on_system_status(&self, status: SystemStatus) {
        if self.is_disposed() {
            return;
        }
        self.update(|state| {
            if status.queue_length.is_some() {
                state.queue_length = status.queue_length;
            }
            state.system_status = Some(status);
        });
    }

    fn on_jobs_update(&self, update: JobsUpdate) {
        if self.is_disposed() {
            return;
        }
        let now = Utc::now();
        let (outcomes, dropped) = self.update(|state| {
            if update.queue_length.is_some() {
                state.queue_length = update.queue_length;
            }
            match update.source {
                JobsSource::Snapshot => {
                    let reconciled =
                        state
                            .queue
                            .reconcile_snapshot(&update.records, update.requested_at, now);
                    (reconciled.outcomes, reconciled.dropped.len())
                }
                JobsSource::Push => {
                    let outcomes = update
                        .records
                        .iter()
                        .map(|record| state.queue.apply_record(record, now))
                        .collect();
                    (outcomes, 0)
                }
            }
        });

        if dropped > 0 {
            // Most likely finished while we were not listening
            self.results_stale.store(true, Ordering::SeqCst);
            self.debug(format!("{} job(s) no longer active on backend", dropped));
        }
        for outcome in outcomes {
            match outcome {
                ApplyOutcome::Completed(job) => {
                    self.results_stale.store(true, Ordering::SeqCst);
                    self.notify_completed(Some(&job), None);
                }
                ApplyOutcome::Failed(failure) => self.notify_failure(&failure),
                ApplyOutcome::Inserted(job) => {
                    self.debug(format!("Tracking job {} reported by backend", job.key()))
                }
                ApplyOutcome::Updated(_) | ApplyOutcome::Unchanged | ApplyOutcome::Ignored => {}
            }
        }
    }

    fn on_recent_results(&self, results: Vec<GenerationResult>, epoch: u64) {
        if self.is_disposed() {
            return;
        }
        let count = results.len();
        // Checked under the state lock so a completion cannot slip in
        // between the check and the replace
        let applied = self.update(|state| {
            if !self.epoch.is_current(epoch) {
                return false;
            }
            state.results.set_results(results);
            true
        });
        if applied {
            self.debug(format!("Loaded {} result(s)", count));
        } else {
            self.debug(format!(
                "Discarding results from superseded fetch (epoch {}, current {})",
                epoch,
                self.epoch.current()
            ));
        }
    }

    fn on_progress(&self, update: ProgressUpdate) {
        if self.is_disposed() {
            return;
        }
        let applied = self.update(|state| state.queue.handle_progress_message(&update));
        if applied.is_none() {
            self.debug(format!("Progress for unknown job {} ignored", update.job_id));
        }
    }

    fn on_complete(&self, update: CompletionUpdate) {
        if self.is_disposed() {
            return;
        }
        let now = Utc::now();
        let outcome = self.update(|state| {
            let outcome = state.queue.handle_completion_message(&update, now);
            if let CompletionOutcome::Completed {
                result: Some(result),
                ..
            } = &outcome
            {
                // A filtered view only gets results from a fetch
                if !state.filter.is_active() {
                    state.results.add_result(result.clone());
                    // Any fetch already in flight predates this result
                    self.epoch.next();
                }
            }
            outcome
        });

        match outcome {
            CompletionOutcome::Duplicate => {
                self.debug(format!("Duplicate completion for {} ignored", update.job_id));
            }
            CompletionOutcome::Completed { job, result } => {
                // Also refetch what a superseded in-flight fetch would
                // have delivered
                self.results_stale.store(true, Ordering::SeqCst);
                if result.is_none() {
                    self.notify(Notification::warning(format!(
                        "Generation {} finished without a usable image",
                        update.job_id
                    )));
                } else {
                    self.notify_completed(job.as_ref(), result.as_ref());
                }
            }
        }
    }

    fn on_error(&self, update: ErrorUpdate) {
        if self.is_disposed() {
            return;
        }
        match self.update(|state| state.queue.handle_error_message(&update)) {
            Some(failure) => self.notify_failure(&failure),
            None => self.debug(format!(
                "Duplicate error for {} ignored",
                update.job_id.as_deref().unwrap_or("unknown job")
            )),
        }
    }

    fn on_started(&self, update: StartedUpdate) {
        if self.is_disposed() {
            return;
        }
        let outcome = self.update(|state| state.queue.apply_started(&update, Utc::now()));
        if let ApplyOutcome::Inserted(job) = outcome {
            self.debug(format!("Job {} started", job.key()));
        }
    }

    fn on_connection_change(&self, live: bool) {
        if self.is_disposed() {
            return;
        }
        self.update(|state| state.connected = live);
        self.debug(format!(
            "Push channel {}",
            if live { "connected" } else { "disconnected" }
        ));
    }
}

struct Core {
    config: ClientConfig,
    shared: Arc<Shared>,
    transport: TransportAdapter,
    tasks: CancellationToken,
    debouncer: Debouncer,
    poll_guard: PollGuard,
    init: OnceCell<()>,
    background_started: AtomicBool,
}

impl Drop for Core {
    fn drop(&mut self) {
        self.tasks.cancel();
    }
}

impl Core {
    async fn fetch_results(&self) -> Result<(), TransportError> {
        let epoch = self.shared.epoch.next();
        let query = self.shared.results_query();
        self.transport.refresh_recent_results(&query, epoch).await
    }

    async fn refresh_all(&self) -> Result<(), TransportError> {
        let epoch = self.shared.epoch.next();
        let query = self.shared.results_query();
        self.transport.refresh_all(&query, epoch).await
    }

    async fn poll_once(&self) -> PollOutcome {
        let Some(_permit) = self.poll_guard.try_begin() else {
            self.shared.debug("Queue poll skipped: previous poll in flight".to_string());
            return PollOutcome::Busy;
        };
        match self.transport.refresh_active_jobs().await {
            Ok(()) => PollOutcome::Completed,
            Err(e) => {
                self.shared.debug(format!("Queue poll failed: {}", e));
                PollOutcome::Failed
            }
        }
    }

    async fn poll_tick(&self) {
        if self.shared.is_disposed() {
            return;
        }
        if self.shared.results_stale.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.fetch_results().await {
                self.shared.results_stale.store(true, Ordering::SeqCst);
                self.shared.debug(format!("Results refresh failed: {}", e));
            }
        }
        let has_jobs = self.shared.read(|state| !state.queue.is_empty());
        if should_poll_queue(has_jobs, self.transport.is_live()) {
            self.poll_once().await;
        }
    }

    async fn status_tick(&self) {
        if self.shared.is_disposed() {
            return;
        }
        if let Err(e) = self.transport.refresh_system_status().await {
            self.shared.debug(format!("System status refresh failed: {}", e));
        }
    }
}

/// Open the push channel and spawn the periodic tasks, once
fn start_background(core: &Arc<Core>) {
    if core.background_started.swap(true, Ordering::SeqCst) {
        return;
    }
    core.transport.start_push();

    let weak = Arc::downgrade(core);
    tokio::spawn(run_periodic(
        "queue poller",
        core.config.poll_interval,
        core.tasks.clone(),
        move || tick_with(weak.clone(), |core| async move { core.poll_tick().await }),
    ));

    let weak = Arc::downgrade(core);
    tokio::spawn(run_periodic(
        "system status refresh",
        core.config.status_interval,
        core.tasks.clone(),
        move || tick_with(weak.clone(), |core| async move { core.status_tick().await }),
    ));
}

async fn tick_with<F, Fut>(weak: Weak<Core>, tick: F) -> ControlFlow<()>
where
    F: FnOnce(Arc<Core>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    match weak.upgrade() {
        Some(core) => {
            tick(core).await;
            ControlFlow::Continue(())
        }
        None => ControlFlow::Break(()),
    }
}

/// Handle to a running orchestrator
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct Orchestrator {
    core: Arc<Core>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("base_url", &self.core.transport.base_url())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Orchestrator {
    /// Orchestrator for the backend described by `config`
    ///
    /// Nothing touches the network until [`Orchestrator::initialize`].
    pub fn new(config: ClientConfig, sink: Arc<dyn NotificationSink>) -> Result<Self, GqError> {
        config.validate()?;
        let shared = Self::shared(&config, sink);
        let transport =
            TransportAdapter::new(&config, Arc::clone(&shared) as Arc<dyn TransportCallbacks>)?;
        Ok(Self::assemble(config, shared, transport))
    }

    /// Orchestrator over a custom REST implementation
    pub fn with_api(
        config: ClientConfig,
        endpoint: Arc<Endpoint>,
        api: Arc<dyn GenerationApi>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, GqError> {
        config.validate()?;
        let shared = Self::shared(&config, sink);
        let transport = TransportAdapter::with_api(
            endpoint,
            api,
            &config,
            Arc::clone(&shared) as Arc<dyn TransportCallbacks>,
        );
        Ok(Self::assemble(config, shared, transport))
    }

    fn shared(config: &ClientConfig, sink: Arc<dyn NotificationSink>) -> Arc<Shared> {
        let state = State {
            queue: JobQueue::new(),
            results: ResultCache::new(config.history_limit),
            system_status: None,
            connected: false,
            initialized: false,
            base_url: config.base_url.clone(),
            filter: ResultsFilter::default(),
            queue_length: None,
        };
        let (snapshot_tx, _) = watch::channel(state.snapshot());
        Arc::new(Shared {
            state: Mutex::new(state),
            snapshot_tx,
            epoch: EpochGuard::new(),
            disposed: AtomicBool::new(false),
            results_stale: AtomicBool::new(false),
            sink,
        })
    }

    fn assemble(config: ClientConfig, shared: Arc<Shared>, transport: TransportAdapter) -> Self {
        let base_url = transport.base_url();
        shared.update(|state| state.base_url = base_url);

        let tasks = CancellationToken::new();
        let debouncer = Debouncer::new(config.filter_debounce, tasks.clone());
        Self {
            core: Arc::new(Core {
                config,
                shared,
                transport,
                tasks,
                debouncer,
                poll_guard: PollGuard::new(),
                init: OnceCell::new(),
                background_started: AtomicBool::new(false),
            }),
        }
    }

    fn shared_state(&self) -> &Shared {
        &self.core.shared
    }

    fn ensure_live(&self) -> Result<(), GqError> {
        if self.is_disposed() {
            return Err(ActionError::ShutDown.into());
        }
        Ok(())
    }

    /// Notify consumers and hand the error back
    fn fail(&self, message: String, error: impl Into<GqError>) -> GqError {
        self.shared_state().notify(Notification::error(message));
        error.into()
    }

    // --- lifecycle ---

    /// Load the initial state, open the push channel and start polling
    ///
    /// Concurrent and repeated calls share one initialization. If the first
    /// refresh fails the error is returned and a later call retries it; the
    /// push channel and timers keep running meanwhile. `history_limit` only
    /// takes effect on the call that actually initializes.
    pub async fn initialize(&self, history_limit: usize) -> Result<(), GqError> {
        self.ensure_live()?;
        self.core
            .init
            .get_or_try_init(|| async {
                self.shared_state()
                    .update(|state| state.results.set_history_limit(history_limit));
                start_background(&self.core);

                if let Err(e) = self.core.refresh_all().await {
                    return Err(self.fail(format!("Failed to load queue: {}", e), e));
                }
                self.shared_state().update(|state| state.initialized = true);
                tracing::info!(base_url = %self.core.transport.base_url(), "Orchestrator initialized");
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.core.init.initialized()
    }

    /// Stop timers, close the push channel, drop pending work
    ///
    /// Responses that arrive afterwards are ignored. Idempotent.
    pub fn cleanup(&self) {
        if self.core.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.tasks.cancel();
        self.core.debouncer.cancel();
        self.core.transport.shutdown();
        self.shared_state().update(|state| state.connected = false);
        tracing::info!("Orchestrator shut down");
    }

    pub fn is_disposed(&self) -> bool {
        self.shared_state().is_disposed()
    }

    // --- observation ---

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.core.shared.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.core.shared.snapshot_tx.borrow().clone()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.core.transport.connection()
    }

    pub fn base_url(&self) -> String {
        self.core.transport.base_url()
    }

    /// Whether the polling fallback would poll right now
    pub fn should_poll_queue(&self) -> bool {
        let has_jobs = self.shared_state().read(|state| !state.queue.is_empty());
        should_poll_queue(has_jobs, self.core.transport.is_live())
    }

    /// Poll the active-jobs list once, unless a poll is already running
    pub async fn poll_once(&self) -> PollOutcome {
        if self.is_disposed() {
            return PollOutcome::Skipped;
        }
        self.core.poll_once().await
    }

    /// Reload status, jobs and results
    pub async fn refresh(&self) -> Result<(), GqError> {
        self.ensure_live()?;
        self.core
            .refresh_all()
            .await
            .map_err(|e| self.fail(format!("Refresh failed: {}", e), e))
    }

    // --- jobs ---

    /// Submit a generation request
    ///
    /// The job shows up immediately under a local id and is re-keyed to the
    /// backend id once accepted. If the backend refuses, it is removed again.
    pub async fn start_generation(&self, request: GenerationRequest) -> Result<Job, GqError> {
        self.ensure_live()?;
        if let Err(reason) = validate_request(&request) {
            return Err(self.fail(
                format!("Cannot start generation: {}", reason),
                ActionError::InvalidInput(reason),
            ));
        }

        let job = self
            .shared_state()
            .update(|state| state.queue.enqueue_request(&request, Utc::now()));
        let tentative = Tentative::Job {
            local_id: job.local_id.clone(),
        };

        match self.core.transport.start_generation(&request).await {
            Ok(ack) => {
                let confirmed = self
                    .shared_state()
                    .update(|state| state.queue.assign_backend_id(&job.local_id, &ack, Utc::now()));
                self.shared_state().debug(format!(
                    "Job {} accepted as {}",
                    job.local_id, ack.job_id
                ));
                Ok(confirmed.unwrap_or_else(|| Job {
                    backend_id: Some(ack.job_id.clone()),
                    ..job
                }))
            }
            Err(e) => {
                self.shared_state().update(|state| {
                    tentative.rollback(&mut state.queue, &mut state.results)
                });
                Err(self.fail(format!("Failed to start generation: {}", e), e))
            }
        }
    }

    /// Cancel one job by local or backend id
    pub async fn cancel_job(&self, id: &str) -> Result<(), GqError> {
        self.ensure_live()?;
        let Some(job) = self.shared_state().read(|state| state.queue.get(id).cloned()) else {
            return Err(self.fail(
                format!("Job {} is not in the queue", id),
                ActionError::JobNotFound(id.to_string()),
            ));
        };
        if !is_job_cancellable(&job) {
            return Err(self.fail(
                format!("Job {} is already {}", id, job.status),
                ActionError::NotCancellable {
                    id: id.to_string(),
                    status: job.status.to_string(),
                },
            ));
        }
        let Some(backend_id) = job.backend_id.clone() else {
            return Err(self.fail(
                format!("Job {} has not been accepted by the backend yet", id),
                ActionError::InvalidInput(format!("job {} has no backend id", id)),
            ));
        };

        if let Err(e) = self.core.transport.cancel_job(&backend_id).await {
            return Err(self.fail(format!("Failed to cancel job {}: {}", backend_id, e), e));
        }
        self.shared_state()
            .update(|state| state.queue.finish_cancelled(&backend_id));
        self.shared_state()
            .notify(Notification::info(format!("Job {} cancelled", backend_id)));
        Ok(())
    }

    /// Cancel every cancellable job concurrently
    pub async fn clear_queue(&self) -> Result<ClearSummary, GqError> {
        self.ensure_live()?;
        let targets: Vec<String> = self.shared_state().read(|state| {
            state
                .queue
                .cancellable_jobs()
                .into_iter()
                .filter_map(|job| job.backend_id)
                .collect()
        });
        if targets.is_empty() {
            self.shared_state()
                .notify(Notification::info("Queue is already empty"));
            return Ok(ClearSummary::default());
        }

        let outcomes = join_all(
            targets
                .iter()
                .map(|id| self.core.transport.cancel_job(id)),
        )
        .await;

        let mut summary = ClearSummary::default();
        let mut failures = Vec::new();
        self.shared_state().update(|state| {
            for (id, outcome) in targets.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => {
                        state.queue.finish_cancelled(id);
                        summary.cancelled += 1;
                    }
                    Err(e) => {
                        summary.failed += 1;
                        failures.push(format!("{}: {}", id, e));
                    }
                }
            }
        });

        for failure in &failures {
            self.shared_state().debug(format!("Cancel failed for {}", failure));
        }
        let notification = if summary.failed == 0 {
            Notification::info(format!("Cancelled {} job(s)", summary.cancelled))
        } else {
            Notification::warning(format!(
                "Cancelled {} job(s), {} could not be cancelled",
                summary.cancelled, summary.failed
            ))
        };
        self.shared_state().notify(notification);
        Ok(summary)
    }

    // --- results ---

    pub async fn delete_result(&self, id: &str) -> Result<(), GqError> {
        self.ensure_live()?;
        if let Err(e) = self.core.transport.delete_result(id).await {
            return Err(self.fail(format!("Failed to delete result {}: {}", id, e), e));
        }
        self.shared_state()
            .update(|state| state.results.remove_result(id));
        self.shared_state()
            .notify(Notification::info(format!("Result {} deleted", id)));
        Ok(())
    }

    /// Rate a result `1..=5`, optimistically
    pub async fn rate_result(&self, id: &str, rating: u8) -> Result<(), GqError> {
        self.ensure_live()?;
        if !(1..=5).contains(&rating) {
            return Err(self.fail(
                format!("Rating must be between 1 and 5, got {}", rating),
                ActionError::InvalidInput(format!("rating {} out of range", rating)),
            ));
        }

        // Results outside the cache are rated without a local change
        let tentative = self
            .shared_state()
            .update(|state| state.results.set_rating(id, Some(rating)).ok())
            .map(|previous| Tentative::Rating {
                result_id: id.to_string(),
                previous,
            });

        if let Err(e) = self.core.transport.rate_result(id, rating).await {
            if let Some(tentative) = tentative {
                self.shared_state().update(|state| {
                    tentative.rollback(&mut state.queue, &mut state.results)
                });
            }
            return Err(self.fail(format!("Failed to rate result {}: {}", id, e), e));
        }
        Ok(())
    }

    /// Set the favourite flag, optimistically
    pub async fn set_favorite(&self, id: &str, favorite: bool) -> Result<(), GqError> {
        self.ensure_live()?;
        let tentative = self
            .shared_state()
            .update(|state| state.results.set_favorite(id, favorite).ok())
            .map(|previous| Tentative::Favorite {
                result_id: id.to_string(),
                previous,
            });

        if let Err(e) = self.core.transport.set_favorite(id, favorite).await {
            if let Some(tentative) = tentative {
                self.shared_state().update(|state| {
                    tentative.rollback(&mut state.queue, &mut state.results)
                });
            }
            return Err(self.fail(
                format!("Failed to update favourite for {}: {}", id, e),
                e,
            ));
        }
        Ok(())
    }

    /// Flip the favourite flag of a cached result; returns the new value
    pub async fn toggle_favorite(&self, id: &str) -> Result<bool, GqError> {
        self.ensure_live()?;
        let Some(current) = self
            .shared_state()
            .read(|state| state.results.get(id).map(|r| r.is_favorite))
        else {
            return Err(self.fail(
                format!("Result {} is not loaded", id),
                ActionError::ResultNotFound(id.to_string()),
            ));
        };
        self.set_favorite(id, !current).await?;
        Ok(!current)
    }

    pub async fn download_result(&self, id: &str) -> Result<Download, GqError> {
        self.ensure_live()?;
        self.core
            .transport
            .download_result(id)
            .await
            .map_err(|e| self.fail(format!("Failed to download result {}: {}", id, e), e))
    }

    // --- configuration ---

    /// Switch to another backend
    ///
    /// Jobs, results and status from the old backend are dropped, the push
    /// channel reconnects and, once initialized, everything is fetched
    /// again. Returns whether the URL changed.
    pub async fn set_base_url(&self, raw: &str) -> Result<bool, GqError> {
        self.ensure_live()?;
        let changed = match self.core.transport.set_base_url(raw) {
            Ok(changed) => changed,
            Err(e) => return Err(self.fail(format!("Invalid backend URL: {}", e), e)),
        };
        if !changed {
            return Ok(false);
        }

        self.core.debouncer.cancel();
        self.shared_state().epoch.next();
        self.shared_state()
            .results_stale
            .store(false, Ordering::SeqCst);
        let base_url = self.core.transport.base_url();
        self.shared_state().update(|state| {
            state.queue.clear();
            state.results.clear();
            state.system_status = None;
            state.queue_length = None;
            state.base_url = base_url.clone();
        });
        self.shared_state()
            .notify(Notification::info(format!("Switched backend to {}", base_url)));

        if self.is_initialized() {
            if let Err(e) = self.core.refresh_all().await {
                self.shared_state().notify(Notification::error(format!(
                    "Failed to load state from {}: {}",
                    base_url, e
                )));
            }
        }
        Ok(true)
    }

    /// Change how many results are kept; returns the clamped limit
    pub async fn set_history_limit(&self, limit: usize) -> Result<usize, GqError> {
        self.ensure_live()?;
        let limit = self
            .shared_state()
            .update(|state| state.results.set_history_limit(limit));
        if self.is_initialized() {
            if let Err(e) = self.core.fetch_results().await {
                self.shared_state()
                    .debug(format!("Results refresh failed: {}", e));
            }
        }
        Ok(limit)
    }

    /// Change the results filter
    ///
    /// The fetch runs after the debounce delay; any fetch already in flight
    /// is superseded immediately.
    pub fn apply_results_filter(&self, filter: ResultsFilter) -> Result<(), GqError> {
        self.ensure_live()?;
        let filter = filter.normalized();
        self.shared_state().epoch.next();
        self.shared_state()
            .update(|state| state.filter = filter.clone());
        self.shared_state()
            .debug(format!("Results filter changed: {:?}", filter));

        let weak = Arc::downgrade(&self.core);
        self.core.debouncer.schedule(async move {
            let Some(core) = weak.upgrade() else {
                return;
            };
            if core.shared.is_disposed() {
                return;
            }
            if let Err(e) = core.fetch_results().await {
                core.shared
                    .debug(format!("Filtered results fetch failed: {}", e));
            }
        });
        Ok(())
    }
}

fn validate_request(request: &GenerationRequest) -> Result<(), String> {
    if request.prompt.trim().is_empty() {
        return Err("prompt is empty".to_string());
    }
    if request.width == Some(0) || request.height == Some(0) {
        return Err("image dimensions must be positive".to_string());
    }
    if request.steps == Some(0) {
        return Err("steps must be positive".to_string());
    }
    if request
        .cfg_scale
        .is_some_and(|cfg| !cfg.is_finite() || cfg <= 0.0)
    {
        return Err("cfg scale must be a positive number".to_string());
    }
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gq_client::ResultsQuery;
    use gq_protocol::{ResultPatch, StartAck};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    /// In-memory backend
    #[derive(Default)]
    struct FakeApi {
        fail_mutations: AtomicBool,
        start_calls: AtomicUsize,
        cancelled: Mutex<Vec<String>>,
        results: Mutex<Vec<Value>>,
        /// When set, `active_jobs` waits for one notification
        poll_gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
    }

    fn refused() -> TransportError {
        TransportError::Http {
            status: 500,
            message: "boom".into(),
        }
    }

    #[async_trait]
    impl GenerationApi for FakeApi {
        async fn system_status(&self) -> Result<SystemStatus, TransportError> {
            Ok(SystemStatus::default())
        }

        async fn active_jobs(&self) -> Result<Vec<Value>, TransportError> {
            let gate = self.poll_gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            Ok(Vec::new())
        }

        async fn recent_results(&self, _query: &ResultsQuery) -> Result<Vec<Value>, TransportError> {
            Ok(self.results.lock().clone())
        }

        async fn start_generation(
            &self,
            _request: &GenerationRequest,
        ) -> Result<StartAck, TransportError> {
            if self.fail_mutations.load(Ordering::SeqCst) {
                return Err(refused());
            }
            let n = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(StartAck {
                job_id: format!("j{}", n),
                status: "queued".into(),
                progress: None,
                message: None,
            })
        }

        async fn cancel_job(&self, job_id: &str) -> Result<(), TransportError> {
            if self.fail_mutations.load(Ordering::SeqCst) {
                return Err(refused());
            }
            self.cancelled.lock().push(job_id.to_string());
            Ok(())
        }

        async fn delete_result(&self, _result_id: &str) -> Result<(), TransportError> {
            if self.fail_mutations.load(Ordering::SeqCst) {
                return Err(refused());
            }
            Ok(())
        }

        async fn update_result(
            &self,
            _result_id: &str,
            _patch: &ResultPatch,
        ) -> Result<(), TransportError> {
            if self.fail_mutations.load(Ordering::SeqCst) {
                return Err(refused());
            }
            Ok(())
        }

        async fn download_result(&self, _result_id: &str) -> Result<Download, TransportError> {
            Err(refused())
        }
    }

    #[derive(Default)]
    struct Collect {
        notes: Mutex<Vec<Notification>>,
    }

    impl NotificationSink for Collect {
        fn notify(&self, notification: &Notification) {
            self.notes.lock().push(notification.clone());
        }

        fn debug(&self, _line: &str) {}
    }

    impl Collect {
        fn levels(&self) -> Vec<NotificationLevel> {
            self.notes.lock().iter().map(|n| n.level).collect()
        }
    }

    fn orchestrator() -> (Orchestrator, Arc<FakeApi>, Arc<Collect>) {
        let config = ClientConfig::default();
        let endpoint = Arc::new(Endpoint::new(&config.base_url, None).unwrap());
        let api = Arc::new(FakeApi::default());
        let sink = Arc::new(Collect::default());
        let orchestrator = Orchestrator::with_api(
            config,
            endpoint,
            Arc::clone(&api) as Arc<dyn GenerationApi>,
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        )
        .unwrap();
        (orchestrator, api, sink)
    }

    fn shared(orchestrator: &Orchestrator) -> &Shared {
        orchestrator.shared_state()
    }

    #[tokio::test]
    async fn test_start_generation_rekeys_job() {
        let (orchestrator, _api, _sink) = orchestrator();
        let mut request = GenerationRequest::new("x");
        request.steps = Some(20);

        let job = orchestrator.start_generation(request).await.unwrap();
        assert_eq!(job.backend_id.as_deref(), Some("j1"));

        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.jobs.len(), 1);
        assert_eq!(snapshot.jobs[0].key(), "j1");
        assert_eq!(snapshot.jobs[0].progress, 0);
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back_and_notifies() {
        let (orchestrator, api, sink) = orchestrator();
        api.fail_mutations.store(true, Ordering::SeqCst);

        let err = orchestrator
            .start_generation(GenerationRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GqError::Transport(_)));
        assert!(orchestrator.snapshot().jobs.is_empty());
        assert_eq!(sink.levels(), vec![NotificationLevel::Error]);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected_locally() {
        let (orchestrator, api, sink) = orchestrator();
        let err = orchestrator
            .start_generation(GenerationRequest::new("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, GqError::Action(ActionError::InvalidInput(_))));
        assert_eq!(api.start_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.levels(), vec![NotificationLevel::Error]);
    }

    #[tokio::test]
    async fn test_push_flow_end_to_end() {
        let (orchestrator, _api, sink) = orchestrator();
        orchestrator
            .start_generation(GenerationRequest::new("x"))
            .await
            .unwrap();

        shared(&orchestrator).on_progress(ProgressUpdate::new("j1", 0.5));
        let job = orchestrator.snapshot().jobs[0].clone();
        assert_eq!(job.status, gq_core::JobStatus::Processing);
        assert_eq!(job.progress, 50);

        let complete = CompletionUpdate::with_images("j1", vec!["url".into()]);
        shared(&orchestrator).on_complete(complete.clone());
        shared(&orchestrator).on_complete(complete);

        let snapshot = orchestrator.snapshot();
        assert!(snapshot.jobs.is_empty());
        assert_eq!(snapshot.results.len(), 1);
        assert_eq!(snapshot.results[0].image_url, "url");
        assert_eq!(snapshot.results[0].prompt, "x");
        assert_eq!(sink.levels(), vec![NotificationLevel::Success]);
    }

    #[tokio::test]
    async fn test_cancel_and_clear() {
        let (orchestrator, api, _sink) = orchestrator();
        for prompt in ["a", "b", "c"] {
            orchestrator
                .start_generation(GenerationRequest::new(prompt))
                .await
                .unwrap();
        }

        orchestrator.cancel_job("j2").await.unwrap();
        assert_eq!(orchestrator.snapshot().jobs.len(), 2);

        let summary = orchestrator.clear_queue().await.unwrap();
        assert_eq!(
            summary,
            ClearSummary {
                cancelled: 2,
                failed: 0
            }
        );
        assert!(orchestrator.snapshot().jobs.is_empty());
        assert_eq!(api.cancelled.lock().len(), 3);

        let err = orchestrator.cancel_job("j2").await.unwrap_err();
        assert!(matches!(err, GqError::Action(ActionError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_reports_failures() {
        let (orchestrator, api, sink) = orchestrator();
        orchestrator
            .start_generation(GenerationRequest::new("a"))
            .await
            .unwrap();
        api.fail_mutations.store(true, Ordering::SeqCst);

        let summary = orchestrator.clear_queue().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(orchestrator.snapshot().jobs.len(), 1);
        assert_eq!(sink.levels().last(), Some(&NotificationLevel::Warning));
    }

    fn seed_result(orchestrator: &Orchestrator) {
        let epoch = shared(orchestrator).epoch.next();
        let results = gq_client::adapter::parse_results(
            vec![json!({"id": "r1", "images": ["u"], "rating": 2})],
            Utc::now(),
        );
        shared(orchestrator).on_recent_results(results, epoch);
    }

    #[tokio::test]
    async fn test_rating_rolls_back_on_failure() {
        let (orchestrator, api, _sink) = orchestrator();
        seed_result(&orchestrator);

        orchestrator.rate_result("r1", 5).await.unwrap();
        assert_eq!(orchestrator.snapshot().results[0].rating, Some(5));

        api.fail_mutations.store(true, Ordering::SeqCst);
        assert!(orchestrator.rate_result("r1", 1).await.is_err());
        assert_eq!(orchestrator.snapshot().results[0].rating, Some(5));

        assert!(matches!(
            orchestrator.rate_result("r1", 6).await,
            Err(GqError::Action(ActionError::InvalidInput(_)))
        ));
    }

    #[tokio::test]
    async fn test_toggle_favorite() {
        let (orchestrator, api, _sink) = orchestrator();
        seed_result(&orchestrator);

        assert!(orchestrator.toggle_favorite("r1").await.unwrap());
        assert!(orchestrator.snapshot().results[0].is_favorite);

        api.fail_mutations.store(true, Ordering::SeqCst);
        assert!(orchestrator.toggle_favorite("r1").await.is_err());
        assert!(orchestrator.snapshot().results[0].is_favorite);

        assert!(matches!(
            orchestrator.toggle_favorite("missing").await,
            Err(GqError::Action(ActionError::ResultNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_delete_result() {
        let (orchestrator, api, _sink) = orchestrator();
        seed_result(&orchestrator);

        api.fail_mutations.store(true, Ordering::SeqCst);
        assert!(orchestrator.delete_result("r1").await.is_err());
        assert_eq!(orchestrator.snapshot().results.len(), 1);

        api.fail_mutations.store(false, Ordering::SeqCst);
        orchestrator.delete_result("r1").await.unwrap();
        assert!(orchestrator.snapshot().results.is_empty());
    }

    #[tokio::test]
    async fn test_stale_epoch_is_discarded() {
        let (orchestrator, _api, _sink) = orchestrator();
        let stale = shared(&orchestrator).epoch.next();
        let _current = shared(&orchestrator).epoch.next();

        let results = gq_client::adapter::parse_results(
            vec![json!({"id": "old", "images": ["u"]})],
            Utc::now(),
        );
        shared(&orchestrator).on_recent_results(results, stale);
        assert!(orchestrator.snapshot().results.is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_polls_report_busy() {
        let (orchestrator, api, _sink) = orchestrator();
        let gate = Arc::new(tokio::sync::Notify::new());
        *api.poll_gate.lock() = Some(Arc::clone(&gate));

        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.poll_once().await }
        });
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while !orchestrator.core.poll_guard.is_polling() {
            assert!(tokio::time::Instant::now() < deadline, "first poll never started");
            tokio::task::yield_now().await;
        }

        assert_eq!(orchestrator.poll_once().await, PollOutcome::Busy);

        gate.notify_one();
        assert_eq!(first.await.unwrap(), PollOutcome::Completed);
        assert!(!orchestrator.core.poll_guard.is_polling());

        *api.poll_gate.lock() = None;
        assert_eq!(orchestrator.poll_once().await, PollOutcome::Completed);
    }

    #[tokio::test]
    async fn test_completion_survives_older_results_fetch() {
        let (orchestrator, api, _sink) = orchestrator();
        let in_flight = shared(&orchestrator).epoch.next();

        shared(&orchestrator)
            .on_complete(CompletionUpdate::with_images("j1", vec!["url".into()]));

        // The fetch started before the completion and lands after it
        let results = gq_client::adapter::parse_results(
            vec![json!({"id": "r0", "images": ["u"]})],
            Utc::now(),
        );
        shared(&orchestrator).on_recent_results(results, in_flight);

        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.results.len(), 1);
        assert_eq!(snapshot.results[0].image_url, "url");
        assert!(shared(&orchestrator).results_stale.load(Ordering::SeqCst));

        // The next tick refetches and picks up both
        *api.results.lock() = vec![
            json!({"id": "j1", "images": ["url"], "created_at": "2024-05-01T12:00:01Z"}),
            json!({"id": "r0", "images": ["u"], "created_at": "2024-05-01T12:00:00Z"}),
        ];
        orchestrator.core.poll_tick().await;
        assert_eq!(orchestrator.snapshot().results.len(), 2);
        assert!(!shared(&orchestrator).results_stale.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_error_message_notifies() {
        let (orchestrator, _api, sink) = orchestrator();
        orchestrator
            .start_generation(GenerationRequest::new("x"))
            .await
            .unwrap();

        shared(&orchestrator).on_error(ErrorUpdate {
            job_id: Some("j1".into()),
            status: Some("cancelled".into()),
            ..Default::default()
        });
        assert!(orchestrator.snapshot().jobs.is_empty());
        assert_eq!(sink.levels(), vec![NotificationLevel::Info]);
    }

    #[tokio::test]
    async fn test_cleanup_ignores_late_callbacks() {
        let (orchestrator, _api, _sink) = orchestrator();
        orchestrator.cleanup();
        orchestrator.cleanup();
        assert!(orchestrator.is_disposed());

        shared(&orchestrator).on_started(StartedUpdate {
            job_id: "late".into(),
            status: None,
            prompt: None,
            parameters: None,
            created_at: None,
            message: None,
        });
        assert!(orchestrator.snapshot().jobs.is_empty());

        assert!(matches!(
            orchestrator.start_generation(GenerationRequest::new("x")).await,
            Err(GqError::Action(ActionError::ShutDown))
        ));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
