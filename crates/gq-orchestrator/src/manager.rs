//! Consumer registry
//!
//! Any number of consumers (CLI commands, UI panels, embedding
//! applications) share one [`Orchestrator`] and therefore one push channel.
//! [`OrchestratorManager::acquire`] registers a consumer and creates the
//! orchestrator on first use; the returned [`OrchestratorBinding`]
//! deregisters on [`OrchestratorBinding::release`] or on drop. When the
//! last consumer leaves, the orchestrator is torn down.
//!
//! Notifications are broadcast to every registered consumer, in
//! registration order, not just to the one whose action caused them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use gq_core::config::ClientConfig;
use gq_core::{GqError, Notification};

use crate::orchestrator::{NotificationSink, Orchestrator};
use crate::snapshot::Snapshot;

pub type NotifyFn = Arc<dyn Fn(&Notification) + Send + Sync>;
pub type DebugFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks for one consumer
#[derive(Clone, Default)]
pub struct AcquireOptions {
    pub on_notify: Option<NotifyFn>,
    pub on_debug: Option<DebugFn>,
}

impl AcquireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_notify(mut self, callback: impl Fn(&Notification) + Send + Sync + 'static) -> Self {
        self.on_notify = Some(Arc::new(callback));
        self
    }

    pub fn on_debug(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_debug = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for AcquireOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquireOptions")
            .field("on_notify", &self.on_notify.is_some())
            .field("on_debug", &self.on_debug.is_some())
            .finish()
    }
}

/// Registered consumers, keyed by registration order
#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    consumers: Mutex<BTreeMap<u64, AcquireOptions>>,
}

impl Registry {
    fn register(&self, options: AcquireOptions) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.consumers.lock().insert(id, options);
        id
    }

    /// Returns how many consumers remain, or `None` if `id` was unknown
    fn deregister(&self, id: u64) -> Option<usize> {
        let mut consumers = self.consumers.lock();
        consumers.remove(&id)?;
        Some(consumers.len())
    }

    fn len(&self) -> usize {
        self.consumers.lock().len()
    }
}

impl NotificationSink for Registry {
    fn notify(&self, notification: &Notification) {
        // Callbacks run without the registry lock held
        let callbacks: Vec<NotifyFn> = self
            .consumers
            .lock()
            .values()
            .filter_map(|options| options.on_notify.clone())
            .collect();
        for callback in callbacks {
            callback(notification);
        }
    }

    fn debug(&self, line: &str) {
        let callbacks: Vec<DebugFn> = self
            .consumers
            .lock()
            .values()
            .filter_map(|options| options.on_debug.clone())
            .collect();
        for callback in callbacks {
            callback(line);
        }
    }
}

struct ManagerInner {
    config: ClientConfig,
    registry: Arc<Registry>,
    /// Also serializes acquire against the final release
    slot: Mutex<Option<Orchestrator>>,
}

impl ManagerInner {
    fn release(&self, id: u64) {
        let mut slot = self.slot.lock();
        match self.registry.deregister(id) {
            Some(0) => {
                if let Some(orchestrator) = slot.take() {
                    tracing::info!("Last consumer released, tearing down orchestrator");
                    orchestrator.cleanup();
                }
            }
            Some(remaining) => {
                tracing::debug!(consumer = id, remaining, "Consumer released");
            }
            None => {}
        }
    }
}

/// Owner of the shared orchestrator
///
/// Cloning shares the same registry and orchestrator.
#[derive(Clone)]
pub struct OrchestratorManager {
    inner: Arc<ManagerInner>,
}

impl OrchestratorManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry: Arc::new(Registry::default()),
                slot: Mutex::new(None),
            }),
        }
    }

    /// Register a consumer, creating the orchestrator if none is running
    pub fn acquire(&self, options: AcquireOptions) -> Result<OrchestratorBinding, GqError> {
        let mut slot = self.inner.slot.lock();
        let orchestrator = match slot.as_ref() {
            Some(orchestrator) => orchestrator.clone(),
            None => {
                let sink = Arc::clone(&self.inner.registry) as Arc<dyn NotificationSink>;
                let orchestrator = Orchestrator::new(self.inner.config.clone(), sink)?;
                tracing::debug!(base_url = %orchestrator.base_url(), "Created shared orchestrator");
                *slot = Some(orchestrator.clone());
                orchestrator
            }
        };
        let id = self.inner.registry.register(options);
        drop(slot);

        Ok(OrchestratorBinding {
            id,
            manager: Arc::clone(&self.inner),
            orchestrator,
            released: AtomicBool::new(false),
        })
    }

    /// Number of registered consumers
    pub fn consumer_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether a shared orchestrator currently exists
    pub fn is_active(&self) -> bool {
        self.inner.slot.lock().is_some()
    }
}

/// One consumer's handle on the shared orchestrator
///
/// Derefs to [`Orchestrator`] for the action surface.
pub struct OrchestratorBinding {
    id: u64,
    manager: Arc<ManagerInner>,
    orchestrator: Orchestrator,
    released: AtomicBool,
}

impl OrchestratorBinding {
    pub fn consumer_id(&self) -> u64 {
        self.id
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn snapshot(&self) -> Snapshot {
        self.orchestrator.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.orchestrator.subscribe()
    }

    /// Deregister this consumer; the second call is a no-op
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager.release(self.id);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl std::ops::Deref for OrchestratorBinding {
    type Target = Orchestrator;

    fn deref(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

impl Drop for OrchestratorBinding {
    fn drop(&mut self) {
        self.release();
    }
}
