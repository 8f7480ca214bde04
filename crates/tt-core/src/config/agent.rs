//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use tt_protocol::constants::READ_TIMEOUT;

use super::serde_utils::duration_secs;
use super::{parse_env, validate_hex64};
use crate::error::ConfigError;

/// Configuration for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Listener address as `host:port`
    pub target: String,

    /// Failed connection attempts before giving up; 0 retries forever
    pub max_retries: u32,

    /// Shared secret sent in the AUTH line
    pub shared_secret: Option<String>,

    /// Expected SHA-256 fingerprint of the listener certificate (hex)
    pub cert_fingerprint: Option<String>,

    /// Connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Poll interval of the command read loop
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,

    /// Shell used for the interactive terminal; `$SHELL` when unset
    pub pty_shell: Option<String>,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            max_retries: 5,
            shared_secret: None,
            cert_fingerprint: None,
            connect_timeout: Duration::from_secs(30),
            read_timeout: READ_TIMEOUT,
            pty_shell: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Apply `TETHER_TARGET`, `TETHER_MAX_RETRIES`, `TETHER_SHARED_SECRET`
    /// and `TETHER_CERT_FINGERPRINT`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(target) = lookup("TARGET") {
            self.target = target;
        }
        if let Some(retries) = lookup("MAX_RETRIES") {
            self.max_retries = parse_env("MAX_RETRIES", &retries)?;
        }
        if let Some(secret) = lookup("SHARED_SECRET") {
            self.shared_secret = Some(secret);
        }
        if let Some(fingerprint) = lookup("CERT_FINGERPRINT") {
            self.cert_fingerprint = Some(fingerprint.to_ascii_lowercase());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.is_empty() {
            return Err(ConfigError::MissingField("target".into()));
        }
        split_target(&self.target)?;
        if let Some(secret) = &self.shared_secret {
            validate_hex64("shared_secret", secret)?;
        }
        if let Some(fingerprint) = &self.cert_fingerprint {
            validate_hex64("cert_fingerprint", fingerprint)?;
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connect_timeout and read_timeout must be non-zero".into(),
            ));
        }
        self.backoff.validate()
    }

    /// Host part of the target, used as the TLS server name
    pub fn target_host(&self) -> Result<String, ConfigError> {
        split_target(&self.target).map(|(host, _)| host)
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
fn split_target(target: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("target {:?} is not host:port", target));
    let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial.is_zero() || self.max < self.initial {
            return Err(ConfigError::Invalid(
                "backoff needs 0 < initial <= max".into(),
            ));
        }
        if self.multiplier < 1.0 || !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(
                "backoff multiplier must be >= 1 and jitter within 0..=1".into(),
            ));
        }
        Ok(())
    }
}
