//! Listener configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tt_protocol::constants::{
    CHUNK_SIZE, COMMAND_TIMEOUT, MAX_BUFFER_SIZE, PING_INTERVAL, RESPONSE_TIMEOUT,
};

use super::serde_utils::duration_secs;
use super::{parse_env, validate_hex64};
use crate::error::ConfigError;

/// Configuration for the listener daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// TCP port to accept agents on
    pub port: u16,

    /// Interface address to bind
    pub interface: String,

    /// Shared secret agents must present (64 hex chars); None disables AUTH
    pub shared_secret: Option<String>,

    /// PEM certificate; a self-signed one is generated when unset
    pub cert_path: Option<PathBuf>,

    /// PEM private key matching `cert_path`
    pub key_path: Option<PathBuf>,

    /// Largest accumulated response kept before the buffer is reset
    pub max_buffer_size: usize,

    /// Idle time before a keepalive probe
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,

    /// Wait for one file-transfer step
    #[serde(with = "duration_secs")]
    pub response_timeout: Duration,

    /// Wait for a shell command's output
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Wait for the AUTH line from a new connection
    #[serde(with = "duration_secs")]
    pub auth_timeout: Duration,

    /// Source bytes per upload chunk
    pub chunk_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 9001,
            interface: "0.0.0.0".to_string(),
            shared_secret: None,
            cert_path: None,
            key_path: None,
            max_buffer_size: MAX_BUFFER_SIZE,
            ping_interval: PING_INTERVAL,
            response_timeout: RESPONSE_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
            auth_timeout: Duration::from_secs(10),
            chunk_size: CHUNK_SIZE,
        }
    }
}

impl ListenerConfig {
    /// Address to bind, as `interface:port`
    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.interface.parse().map_err(|_| {
            ConfigError::Invalid(format!("invalid interface address {:?}", self.interface))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Apply `TETHER_PORT`, `TETHER_INTERFACE` and `TETHER_SHARED_SECRET`.
    ///
    /// `lookup` receives the name without the prefix; pass
    /// [`super::process_env`] for the real environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.port = parse_env("PORT", &port)?;
        }
        if let Some(interface) = lookup("INTERFACE") {
            self.interface = interface;
        }
        if let Some(secret) = lookup("SHARED_SECRET") {
            self.shared_secret = Some(secret);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be between 1 and 65535".into()));
        }
        self.bind_address()?;
        if let Some(secret) = &self.shared_secret {
            validate_hex64("shared_secret", secret)?;
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(ConfigError::Invalid(
                "cert_path and key_path must be set together".into(),
            ));
        }
        if self.max_buffer_size == 0 || self.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "max_buffer_size and chunk_size must be non-zero".into(),
            ));
        }
        for (name, value) in [
            ("ping_interval", self.ping_interval),
            ("response_timeout", self.response_timeout),
            ("command_timeout", self.command_timeout),
            ("auth_timeout", self.auth_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}
