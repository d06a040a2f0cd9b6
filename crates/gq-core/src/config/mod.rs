//! Configuration management for genqueue

mod client;
pub mod serde_utils;

pub use client::{validate_base_url, ClientConfig, RetryConfig, ENV_API_KEY, ENV_BASE_URL};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("genqueue")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Resolve the client configuration used by binaries
///
/// Reads `path` (or the default path) when it exists, falls back to
/// defaults otherwise, then applies environment overrides.
pub fn resolve_client_config(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let mut config = match load_config::<ClientConfig>(&path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            ClientConfig::default()
        }
        Err(e) => return Err(e),
    };
    config.apply_env();
    Ok(config)
}
