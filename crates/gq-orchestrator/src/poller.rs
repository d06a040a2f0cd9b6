//! Polling fallback
//!
//! The push channel is the primary source of job updates. While it is down,
//! or while jobs are in flight, the active-jobs list is also polled on a
//! fixed interval. Polls never overlap: a tick that finds a poll still in
//! flight is skipped.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Whether the active-jobs list should be polled
pub fn should_poll_queue(has_active_jobs: bool, push_live: bool) -> bool {
    has_active_jobs || !push_live
}

/// What a poll attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Snapshot fetched and applied
    Completed,
    /// Request failed; cached state was kept
    Failed,
    /// Another poll was in flight
    Busy,
    /// Nothing to poll for
    Skipped,
}

/// At-most-one re-entrancy guard
#[derive(Debug, Default)]
pub struct PollGuard {
    in_flight: AtomicBool,
}

impl PollGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard; `None` if a poll is already running
    pub fn try_begin(&self) -> Option<PollPermit<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollPermit { guard: self })
    }

    pub fn is_polling(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Releases the guard on drop, including on early return or panic
#[derive(Debug)]
pub struct PollPermit<'a> {
    guard: &'a PollGuard,
}

impl Drop for PollPermit<'_> {
    fn drop(&mut self) {
        self.guard.in_flight.store(false, Ordering::Release);
    }
}

/// Run `tick` every `period` until cancelled or until it breaks
///
/// The first tick fires one period after start. Ticks that fall behind are
/// delayed rather than bunched up.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<()>>,
{
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!("Starting {} (interval: {:?})", name, period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if tick().await.is_break() {
                    tracing::debug!("{} stopped: owner dropped", name);
                    break;
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("{} shutting down", name);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_should_poll_queue() {
        assert!(should_poll_queue(true, true));
        assert!(should_poll_queue(false, false));
        assert!(should_poll_queue(true, false));
        assert!(!should_poll_queue(false, true));
    }

    #[test]
    fn test_guard_is_exclusive_and_resets() {
        let guard = PollGuard::new();
        {
            let _permit = guard.try_begin().unwrap();
            assert!(guard.is_polling());
            assert!(guard.try_begin().is_none());
        }
        assert!(!guard.is_polling());
        assert!(guard.try_begin().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_periodic_ticks_until_cancelled() {
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        let task = tokio::spawn(run_periodic(
            "test ticker",
            Duration::from_secs(5),
            cancel.clone(),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ControlFlow::Continue(())
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_periodic_stops_on_break() {
        let task = tokio::spawn(run_periodic(
            "one-shot",
            Duration::from_secs(1),
            CancellationToken::new(),
            || async { ControlFlow::Break(()) },
        ));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(task.is_finished());
    }
}
