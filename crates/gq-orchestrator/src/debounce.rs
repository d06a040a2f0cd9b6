//! Trailing-edge debouncer
//!
//! Each `schedule` call cancels the previously scheduled action, so only the
//! last call within the delay window runs.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub struct Debouncer {
    delay: Duration,
    parent: CancellationToken,
    pending: Mutex<Option<CancellationToken>>,
}

impl Debouncer {
    /// Debouncer whose actions also stop when `parent` is cancelled
    pub fn new(delay: Duration, parent: CancellationToken) -> Self {
        Self {
            delay,
            parent,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `action` after the delay unless another call supersedes it
    pub fn schedule<F>(&self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.parent.child_token();
        if let Some(previous) = self.pending.lock().replace(token.clone()) {
            previous.cancel();
        }

        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // Still cancellable while running
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = action => {}
                    }
                }
            }
        });
    }

    /// Drop whatever is pending
    pub fn cancel(&self) {
        if let Some(pending) = self.pending.lock().take() {
            pending.cancel();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
