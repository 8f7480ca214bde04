//! Shared listener state

use std::sync::Arc;

use tt_core::config::ListenerConfig;

use crate::session::{MultiplexerConfig, SessionRegistry};
use crate::tunnel::TunnelManagers;

/// State shared by the accept loop, connection handlers and the console
pub struct ListenerState {
    /// Configuration
    pub config: ListenerConfig,
    /// Authenticated sessions
    pub sessions: Arc<SessionRegistry>,
    /// Port-forward and SOCKS5 tunnels
    pub tunnels: Arc<TunnelManagers>,
}

impl ListenerState {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(SessionRegistry::new()),
            tunnels: Arc::new(TunnelManagers::new()),
        }
    }

    /// Per-session limits derived from the configuration
    pub fn multiplexer_config(&self) -> MultiplexerConfig {
        MultiplexerConfig {
            max_buffer_size: self.config.max_buffer_size,
            ping_interval: self.config.ping_interval,
        }
    }

    /// Stop all tunnels and close all sessions
    pub fn shutdown(&self) {
        self.tunnels.stop_all();
        self.sessions.close_all();
    }
}
