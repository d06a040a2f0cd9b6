//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use gq_core::config::{self, ClientConfig};
use gq_core::ConfigError;

fn config_file(config_path: Option<&Path>) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_config_path)
}

/// Read the file as written, without environment overrides
fn load_file(path: &Path) -> Result<Option<ClientConfig>> {
    match config::load_config::<ClientConfig>(path) {
        Ok(config) => Ok(Some(config)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to load config file: {:?}", path)),
    }
}

/// Get a config value by key
///
/// Reports the effective value: file, then `GENQUEUE_*` environment
/// variables. The API key is never printed.
pub fn config_get(config_path: Option<&Path>, key: &str) -> Result<()> {
    let config = config::resolve_client_config(config_path)
        .with_context(|| "Failed to load configuration")?;

    match config.get_field(key) {
        Ok(value) => {
            println!("{}", value);
            Ok(())
        }
        Err(ConfigError::MissingField(_)) => {
            print_error(&format!("Key not found: {}", key));
            anyhow::bail!("Unknown config key: {}", key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Set a config value by key
///
/// Durations are given in milliseconds. The file is created with defaults
/// first if it does not exist; the result must still validate.
pub fn config_set(config_path: Option<&Path>, key: &str, value: &str) -> Result<()> {
    let path = config_file(config_path);

    let mut config = match load_file(&path)? {
        Some(config) => config,
        None => {
            print_info("Creating default configuration...");
            ClientConfig::default()
        }
    };

    config
        .set_field(key, value)
        .with_context(|| format!("Cannot set {}", key))?;
    config
        .validate()
        .with_context(|| format!("Cannot set {}", key))?;

    config::save_config(&path, &config)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    let shown = if key == "api_key" { "<redacted>" } else { value };
    print_success(&format!("Set {} = {}", key, shown));
    Ok(())
}

/// Show current configuration
pub fn config_show(config_path: Option<&Path>) -> Result<()> {
    let path = config_file(config_path);

    if !path.exists() {
        print_warning(&format!("No configuration file found at {:?}", path));
        print_info("Run 'genqueue config init' to create one");
    } else {
        print_info(&format!("Configuration file: {:?}", path));
    }
    println!();

    let config = config::resolve_client_config(Some(&path))
        .with_context(|| "Failed to load configuration")?;
    println!("{}", render_redacted(&config)?);

    Ok(())
}

/// Print the config file path
pub fn config_path(config_path: Option<&Path>) -> Result<()> {
    println!("{}", config_file(config_path).display());
    Ok(())
}

/// Initialize default configuration
pub fn config_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = config_file(config_path);

    if path.exists() && !force {
        print_error(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        anyhow::bail!("Config file already exists");
    }

    config::save_config(&path, &ClientConfig::default())
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    print_success(&format!("Created configuration file: {:?}", path));
    Ok(())
}

/// TOML rendering with the API key masked
fn render_redacted(config: &ClientConfig) -> Result<String> {
    let mut shown = config.clone();
    if shown.api_key.is_some() {
        shown.api_key = Some("<redacted>".to_string());
    }
    toml::to_string_pretty(&shown).context("Failed to render configuration")
}
