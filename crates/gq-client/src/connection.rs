//! Push-channel connectivity, observable through a watch channel

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Snapshot of the push channel's health
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// Whether the push channel is currently open
    pub live: bool,
    /// Consecutive failed or dropped connections since the last open
    pub attempts: u32,
    /// Delay before the pending reconnect, if one is scheduled
    pub next_retry: Option<Duration>,
    /// Why the channel last closed
    pub last_error: Option<String>,
    /// Set by an explicit stop; no reconnect happens until restarted
    pub stopped: bool,
}

/// Owner side of [`ConnectionState`]
#[derive(Debug)]
pub struct ConnectionTracker {
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState {
            stopped: true,
            ..Default::default()
        });
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn is_live(&self) -> bool {
        self.tx.borrow().live
    }

    /// Channel opened: live, retry counter reset
    ///
    /// Ignored once `token` is cancelled. `opened` runs while the new state
    /// is being published, so no later transition can be observed before
    /// it. Returns whether the channel was marked live.
    pub fn mark_open(&self, token: &CancellationToken, opened: impl FnOnce()) -> bool {
        self.tx.send_if_modified(|state| {
            if token.is_cancelled() {
                return false;
            }
            state.live = true;
            state.attempts = 0;
            state.next_retry = None;
            state.last_error = None;
            state.stopped = false;
            opened();
            true
        })
    }

    /// Channel closed or failed to open; a reconnect is due after `retry_in`
    pub fn mark_closed(&self, reason: impl Into<String>, retry_in: Duration) {
        let reason = reason.into();
        self.tx.send_modify(|state| {
            state.live = false;
            state.attempts = state.attempts.saturating_add(1);
            state.next_retry = Some(retry_in);
            state.last_error = Some(reason);
        });
    }

    /// Reconnect timer fired; ignored once `token` is cancelled
    pub fn mark_connecting(&self, token: &CancellationToken) {
        self.tx.send_if_modified(|state| {
            if token.is_cancelled() {
                return false;
            }
            let changed = state.next_retry.is_some() || state.stopped;
            state.next_retry = None;
            state.stopped = false;
            changed
        });
    }

    /// Explicit stop: not live, nothing scheduled
    ///
    /// Returns whether the channel was live.
    pub fn mark_stopped(&self) -> bool {
        let mut was_live = false;
        self.tx.send_modify(|state| {
            was_live = state.live;
            state.live = false;
            state.next_retry = None;
            state.stopped = true;
        });
        was_live
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_resets_attempts() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.current().stopped);

        tracker.mark_closed("refused", Duration::from_secs(3));
        tracker.mark_closed("refused", Duration::from_secs(3));
        let state = tracker.current();
        assert!(!state.live);
        assert_eq!(state.attempts, 2);
        assert_eq!(state.next_retry, Some(Duration::from_secs(3)));

        assert!(tracker.mark_open(&CancellationToken::new(), || {}));
        let state = tracker.current();
        assert!(state.live);
        assert_eq!(state.attempts, 0);
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn test_stop_clears_pending_retry() {
        let tracker = ConnectionTracker::new();
        tracker.mark_open(&CancellationToken::new(), || {});
        tracker.mark_closed("eof", Duration::from_secs(3));
        assert!(!tracker.mark_stopped());

        let state = tracker.current();
        assert!(!state.live);
        assert!(state.stopped);
        assert_eq!(state.next_retry, None);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let tracker = ConnectionTracker::new();
        let mut rx = tracker.subscribe();

        tracker.mark_open(&CancellationToken::new(), || {});
        rx.changed().await.unwrap();
        assert!(rx.borrow().live);
    }

    #[test]
    fn test_open_after_stop_is_ignored() {
        let tracker = ConnectionTracker::new();
        let token = CancellationToken::new();
        tracker.mark_connecting(&token);
        assert!(!tracker.current().stopped);

        // stop() cancels the task's token before marking the tracker
        token.cancel();
        assert!(!tracker.mark_stopped());

        let mut opened = false;
        assert!(!tracker.mark_open(&token, || opened = true));
        tracker.mark_connecting(&token);

        let state = tracker.current();
        assert!(!opened);
        assert!(!state.live);
        assert!(state.stopped);
    }

    #[test]
    fn test_stop_reports_live_channel() {
        let tracker = ConnectionTracker::new();
        tracker.mark_open(&CancellationToken::new(), || {});
        assert!(tracker.mark_stopped());
        assert!(!tracker.is_live());
    }
}
