//! Attaching a command to the shared orchestrator

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use gq_core::config::{self, ClientConfig};
use gq_core::{Notification, NotificationLevel};
use gq_orchestrator::{AcquireOptions, OrchestratorBinding, OrchestratorManager};

use crate::commands::EventLog;
use crate::output::print_notification;

/// Resolve the effective configuration: file (or defaults), then
/// environment, then the `--base-url` flag
pub fn load_client_config(path: Option<&Path>, base_url: Option<&str>) -> Result<ClientConfig> {
    let mut config =
        config::resolve_client_config(path).context("Failed to load configuration")?;
    if let Some(url) = base_url {
        config.base_url = url.trim().to_string();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// How notifications reach the terminal
///
/// Errors returned from an action are printed by the caller, so error
/// notifications are only echoed once [`Echo::show_errors`] is switched on.
/// The last one is kept for [`Echo::take_error`] either way. With an event log
/// attached, everything goes to the log instead of the terminal.
#[derive(Clone, Default)]
pub struct Echo {
    quiet: bool,
    errors: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    log: Option<EventLog>,
}

impl Echo {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            ..Default::default()
        }
    }

    /// Collect every notification into `log`
    pub fn with_log(log: EventLog) -> Self {
        Self {
            log: Some(log),
            ..Default::default()
        }
    }

    /// Start or stop echoing error notifications
    pub fn show_errors(&self, on: bool) {
        self.errors.store(on, Ordering::SeqCst);
    }

    /// Last error notification since the previous call
    pub fn take_error(&self) -> Option<String> {
        self.last_error.lock().take()
    }

    fn handle(&self, notification: &Notification) {
        if let Some(log) = &self.log {
            log.push(notification);
            return;
        }
        if notification.level == NotificationLevel::Error {
            *self.last_error.lock() = Some(notification.message.clone());
            if !self.errors.load(Ordering::SeqCst) {
                return;
            }
        }
        if !self.quiet || notification.level == NotificationLevel::Error {
            print_notification(notification);
        }
    }
}

/// Acquire the orchestrator for `config` and load the initial state
///
/// The binding releases the orchestrator when dropped, which closes the
/// push channel and stops the timers.
pub async fn connect(
    manager: &OrchestratorManager,
    history_limit: usize,
    echo: &Echo,
) -> Result<OrchestratorBinding> {
    let sink = echo.clone();
    let binding = manager
        .acquire(
            AcquireOptions::new()
                .on_notify(move |notification| sink.handle(notification))
                .on_debug(|line| tracing::debug!("{}", line)),
        )
        .context("Failed to create orchestrator")?;

    let base_url = binding.base_url();
    binding
        .initialize(history_limit)
        .await
        .with_context(|| format!("Failed to reach backend at {}", base_url))?;
    Ok(binding)
}

/// Resolve once, acquire once; what every backend command starts with
pub async fn open(
    config: ClientConfig,
    history_limit: usize,
    echo: &Echo,
) -> Result<OrchestratorBinding> {
    let manager = OrchestratorManager::new(config);
    connect(&manager, history_limit, echo).await
}
