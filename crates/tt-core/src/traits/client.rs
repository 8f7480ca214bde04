//! Agent-side session client trait

use async_trait::async_trait;

use crate::error::TetherError;
use crate::types::SessionEnd;

/// One connection attempt from an agent to a listener.
///
/// The reconnect supervisor only talks to this trait, so tests can swap in a
/// double that fails or succeeds on demand.
#[async_trait]
pub trait SessionClient: Send {
    /// Open the transport, verify the listener and authenticate
    async fn connect(&mut self) -> Result<(), TetherError>;

    /// Run the command loop until the listener exits or the stream ends
    async fn handle_commands(&mut self) -> Result<SessionEnd, TetherError>;

    /// Release the transport. Safe to call more than once.
    async fn close(&mut self) -> Result<(), TetherError>;

    /// Whether `connect` succeeded and `close` has not run
    fn is_connected(&self) -> bool;
}
