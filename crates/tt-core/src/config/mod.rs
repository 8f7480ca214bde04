//! Configuration management for tether
//!
//! Both sides load a TOML file (optional), then apply `TETHER_*` environment
//! overrides, then command-line flags, and finally validate the result.

mod agent;
mod listener;
pub mod serde_utils;

pub use agent::{AgentConfig, BackoffConfig};
pub use listener::ListenerConfig;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "TETHER_";

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
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

/// Look up `TETHER_<name>` in the process environment
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.is_empty())
}

/// A fresh 32-byte shared secret, hex-encoded
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Secrets and fingerprints are 32 bytes rendered as 64 hex characters
pub(crate) fn validate_hex64(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::Invalid(format!(
            "{} must be 64 hex characters",
            field
        )));
    }
    Ok(())
}

pub(crate) fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| {
        ConfigError::Invalid(format!("{}{} has invalid value {:?}", ENV_PREFIX, name, value))
    })
}
