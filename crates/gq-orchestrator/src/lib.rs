//! gq-orchestrator: client-side generation orchestration
//!
//! Keeps a consistent view of jobs in flight and recent results while
//! updates arrive over the push channel, the polling fallback and user
//! actions at arbitrary times. Many consumers share one [`Orchestrator`]
//! through the [`OrchestratorManager`].

pub mod debounce;
pub mod epoch;
pub mod manager;
pub mod orchestrator;
pub mod poller;
pub mod queue;
pub mod results;
pub mod snapshot;
pub mod tentative;

pub use manager::{AcquireOptions, OrchestratorBinding, OrchestratorManager};
pub use orchestrator::{LogSink, NotificationSink, Orchestrator};
pub use poller::{should_poll_queue, PollOutcome};
pub use queue::{is_job_cancellable, JobQueue};
pub use results::ResultCache;
pub use snapshot::{ClearSummary, ResultsFilter, Snapshot};
