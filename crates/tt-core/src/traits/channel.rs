//! Listener-side command channel trait

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;

/// Send/await access to connected agents.
///
/// File transfer and the operator console are written against this trait;
/// the session registry implements it and tests supply mocks.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Peer addresses of connected agents
    fn clients(&self) -> Vec<String>;

    /// Queue one command line for `peer`
    fn send(&self, peer: &str, command: &str) -> Result<(), SessionError>;

    /// Wait for the next completed response from `peer`
    async fn await_response(&self, peer: &str, timeout: Duration) -> Result<String, SessionError>;
}
