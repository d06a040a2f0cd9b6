//! Request epochs
//!
//! Each results fetch takes a fresh epoch; a response is applied only if
//! its epoch is still the latest one handed out. Older responses that
//! arrive late are dropped.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EpochGuard {
    current: AtomicU64,
}

impl EpochGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new epoch, invalidating every earlier one
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.current() == epoch
    }
}
