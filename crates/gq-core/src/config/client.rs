//! Client configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::serde_utils::duration_millis;
use crate::error::ConfigError;
use crate::result::MAX_RESULTS;

/// Environment variable overriding `base_url`
pub const ENV_BASE_URL: &str = "GENQUEUE_BASE_URL";

/// Environment variable overriding `api_key`
pub const ENV_API_KEY: &str = "GENQUEUE_API_KEY";

/// Configuration for a genqueue client
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend base URL, e.g. `http://127.0.0.1:8000` or `https://host/api`
    pub base_url: String,

    /// Optional key sent as `X-API-Key` on every request
    pub api_key: Option<String>,

    /// Number of recent results kept in memory
    pub history_limit: usize,

    /// Polling fallback interval
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// System status refresh interval
    #[serde(with = "duration_millis")]
    pub status_interval: Duration,

    /// Fixed delay before reopening a dropped push channel
    #[serde(with = "duration_millis")]
    pub reconnect_delay: Duration,

    /// Per-request timeout
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    /// Quiet period before a results filter is applied
    #[serde(with = "duration_millis")]
    pub filter_debounce: Duration,

    /// Retry policy for idempotent requests
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            api_key: None,
            history_limit: 50,
            poll_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            filter_debounce: Duration::from_millis(250),
            retry: RetryConfig::default(),
        }
    }
}

// The API key must never end up in logs
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("history_limit", &self.history_limit)
            .field("poll_interval", &self.poll_interval)
            .field("status_interval", &self.status_interval)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("request_timeout", &self.request_timeout)
            .field("filter_debounce", &self.filter_debounce)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ClientConfig {
    /// Configuration pointing at `base_url` with every other field defaulted
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Apply `GENQUEUE_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            let key = key.trim();
            self.api_key = (!key.is_empty()).then(|| key.to_string());
        }
    }

    /// Check the configuration for values the client cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_base_url(&self.base_url)?;
        if self.history_limit == 0 || self.history_limit > MAX_RESULTS {
            return Err(ConfigError::Invalid(format!(
                "history_limit must be between 1 and {}",
                MAX_RESULTS
            )));
        }
        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("status_interval", self.status_interval),
            ("reconnect_delay", self.reconnect_delay),
            ("request_timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        self.retry.validate()
    }

    /// Read a field by its TOML key (`retry.max_attempts` for nested fields)
    pub fn get_field(&self, key: &str) -> Result<String, ConfigError> {
        let value = match key {
            "base_url" => self.base_url.clone(),
            "api_key" => match &self.api_key {
                Some(_) => "<redacted>".to_string(),
                None => String::new(),
            },
            "history_limit" => self.history_limit.to_string(),
            "poll_interval" => millis(self.poll_interval),
            "status_interval" => millis(self.status_interval),
            "reconnect_delay" => millis(self.reconnect_delay),
            "request_timeout" => millis(self.request_timeout),
            "filter_debounce" => millis(self.filter_debounce),
            "retry.max_attempts" => self.retry.max_attempts.to_string(),
            "retry.base_delay" => millis(self.retry.base_delay),
            "retry.max_delay" => millis(self.retry.max_delay),
            other => return Err(ConfigError::MissingField(other.to_string())),
        };
        Ok(value)
    }

    /// Set a field by its TOML key; durations are given in milliseconds
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match key {
            "base_url" => {
                validate_base_url(value)?;
                self.base_url = value.to_string();
            }
            "api_key" => self.api_key = (!value.is_empty()).then(|| value.to_string()),
            "history_limit" => self.history_limit = parse_number(key, value)?,
            "poll_interval" => self.poll_interval = parse_millis(key, value)?,
            "status_interval" => self.status_interval = parse_millis(key, value)?,
            "reconnect_delay" => self.reconnect_delay = parse_millis(key, value)?,
            "request_timeout" => self.request_timeout = parse_millis(key, value)?,
            "filter_debounce" => self.filter_debounce = parse_millis(key, value)?,
            "retry.max_attempts" => self.retry.max_attempts = parse_number(key, value)?,
            "retry.base_delay" => self.retry.base_delay = parse_millis(key, value)?,
            "retry.max_delay" => self.retry.max_delay = parse_millis(key, value)?,
            other => return Err(ConfigError::MissingField(other.to_string())),
        }
        Ok(())
    }
}

/// Retry policy for idempotent (GET/HEAD/OPTIONS) requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::Invalid(
                "retry.base_delay must not exceed retry.max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Check that `raw` is an absolute http(s) URL
pub fn validate_base_url(raw: &str) -> Result<url::Url, ConfigError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| ConfigError::Invalid(format!("base_url `{}`: {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ConfigError::Invalid(format!(
                "base_url `{}`: unsupported scheme `{}`",
                raw, scheme
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(ConfigError::Invalid(format!("base_url `{}`: missing host", raw)));
    }
    Ok(parsed)
}

fn millis(duration: Duration) -> String {
    duration.as_millis().to_string()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{}: `{}` is not a number", key, value)))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}
