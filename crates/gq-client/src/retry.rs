//! Exponential backoff for idempotent request retries

use std::time::Duration;

use gq_core::config::RetryConfig;
use reqwest::Method;

/// Exponential backoff: `base * 2^(n-1)` for the n-th retry, capped at `max`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the next retry
    current: Duration,
    /// Initial delay
    base: Duration,
    /// Maximum delay
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay, config.max_delay)
    }

    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base.min(max),
            base,
            max,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Reset the backoff to the initial delay
    pub fn reset(&mut self) {
        self.current = self.base.min(self.max);
    }
}

/// Retry policy applied by the REST client
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Total attempts allowed for `method`
    ///
    /// Only GET, HEAD and OPTIONS are retried; everything else gets exactly
    /// one attempt.
    pub fn attempts_for(&self, method: &Method) -> u32 {
        if is_idempotent(method) {
            self.config.max_attempts.max(1)
        } else {
            1
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::from_config(&self.config)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// Whether a request with this method may be repeated safely
pub fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS
}
