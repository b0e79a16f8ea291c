//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: dns={} ({} rules, {} upstreams), proxy={}",
        config.dns.listen,
        config.dns.rules.len(),
        config.dns.upstreams.len(),
        config.proxy.listen
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `FAKEIP_RELAY_LOG_LEVEL`: Override log level
/// - `FAKEIP_RELAY_DNS_LISTEN`: Override the DNS listen address
/// - `FAKEIP_RELAY_PROXY_LISTEN`: Override the proxy listen address
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing, or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

fn apply_env_overrides(
    config: &mut Config,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(level) = var("FAKEIP_RELAY_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(addr) = var("FAKEIP_RELAY_DNS_LISTEN") {
        config.dns.listen = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "FAKEIP_RELAY_DNS_LISTEN".into(),
            reason: format!("Invalid IPv4 socket address: {addr}"),
        })?;
        debug!("DNS listen address overridden to {}", config.dns.listen);
    }

    if let Some(addr) = var("FAKEIP_RELAY_PROXY_LISTEN") {
        config.proxy.listen = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "FAKEIP_RELAY_PROXY_LISTEN".into(),
            reason: format!("Invalid socket address: {addr}"),
        })?;
        debug!("Proxy listen address overridden to {}", config.proxy.listen);
    }

    // Re-validate after overrides
    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
