//! Session registry keyed by peer address

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use tt_core::error::SessionError;
use tt_core::traits::CommandChannel;

use super::handle::{Outbound, PtyEvent, SessionHandle};

/// All authenticated sessions, at most one per peer address
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert a session. A stale session for the same peer is closed and
    /// returned.
    pub fn register(&self, handle: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        let stale = self.sessions.insert(handle.peer().to_string(), handle);
        if let Some(stale) = &stale {
            tracing::warn!("Replacing stale session for {}", stale.peer());
            stale.close();
        }
        stale
    }

    /// Remove and close the session for `peer`. Idempotent.
    pub fn remove(&self, peer: &str) -> Option<Arc<SessionHandle>> {
        let (_, handle) = self.sessions.remove(peer)?;
        handle.close();
        Some(handle)
    }

    /// Remove `handle` only if it is still the registered session for its
    /// peer, so a replaced session cannot evict its successor
    pub fn remove_session(&self, handle: &Arc<SessionHandle>) -> bool {
        let removed = self
            .sessions
            .remove_if(handle.peer(), |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        handle.close();
        removed
    }

    /// Get a session by peer address
    pub fn get(&self, peer: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(peer).map(|r| Arc::clone(&r))
    }

    fn require(&self, peer: &str) -> Result<Arc<SessionHandle>, SessionError> {
        self.get(peer)
            .ok_or_else(|| SessionError::NotFound(peer.to_string()))
    }

    /// Snapshot of connected peer addresses
    pub fn clients(&self) -> Vec<String> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    /// Peer addresses in a stable order, for numbering in the console
    pub fn clients_sorted(&self) -> Vec<String> {
        let mut clients = self.clients();
        clients.sort();
        clients
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn send(&self, peer: &str, text: &str) -> Result<(), SessionError> {
        self.require(peer)?.send(text)
    }

    pub async fn await_response(
        &self,
        peer: &str,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        let handle = self.require(peer)?;
        handle.await_response(timeout).await
    }

    /// Send a foreground command and wait for its response
    pub async fn execute(
        &self,
        peer: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        let handle = self.require(peer)?;
        handle.send(text)?;
        handle.await_response(timeout).await
    }

    pub async fn enqueue(&self, peer: &str, entry: Outbound) -> Result<(), SessionError> {
        let handle = self.require(peer)?;
        handle.enqueue(entry).await
    }

    pub fn try_enqueue(&self, peer: &str, entry: Outbound) -> Result<(), SessionError> {
        self.require(peer)?.try_enqueue(entry)
    }

    /// Put `peer` in PTY mode and take the channel of terminal output
    pub fn enter_pty_mode(&self, peer: &str) -> Result<mpsc::Receiver<PtyEvent>, SessionError> {
        self.require(peer)?.enter_pty()
    }

    /// Leave PTY mode; a no-op for unknown peers or sessions not in PTY mode
    pub fn exit_pty_mode(&self, peer: &str) {
        if let Some(handle) = self.get(peer) {
            handle.exit_pty();
        }
    }

    pub fn is_in_pty_mode(&self, peer: &str) -> bool {
        self.get(peer).map_or(false, |h| h.is_in_pty_mode())
    }

    /// Close and forget every session
    pub fn close_all(&self) {
        for peer in self.clients() {
            self.remove(&peer);
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandChannel for SessionRegistry {
    fn clients(&self) -> Vec<String> {
        self.clients_sorted()
    }

    fn send(&self, peer: &str, command: &str) -> Result<(), SessionError> {
        SessionRegistry::send(self, peer, command)
    }

    async fn await_response(&self, peer: &str, timeout: Duration) -> Result<String, SessionError> {
        SessionRegistry::await_response(self, peer, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::handle::SessionChannels;
    use tokio_util::sync::CancellationToken;
    use tt_core::SessionMode;

    fn session(peer: &str) -> (Arc<SessionHandle>, SessionChannels) {
        let (handle, channels) = SessionHandle::new(peer, CancellationToken::new());
        (Arc::new(handle), channels)
    }

    #[test]
    fn test_register_and_list() {
        let registry = SessionRegistry::new();
        let (a, _ca) = session("10.0.0.5:5678");
        let (b, _cb) = session("192.168.1.2:1234");
        registry.register(a);
        registry.register(b);

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.clients_sorted(),
            vec!["10.0.0.5:5678".to_string(), "192.168.1.2:1234".to_string()]
        );
    }

    #[test]
    fn test_duplicate_peer_replaces_stale_session() {
        let registry = SessionRegistry::new();
        let (old, _c1) = session("10.0.0.5:5678");
        let (new, _c2) = session("10.0.0.5:5678");
        registry.register(Arc::clone(&old));
        let stale = registry.register(Arc::clone(&new)).unwrap();

        assert!(Arc::ptr_eq(&stale, &old));
        assert!(old.is_closed());
        assert_eq!(registry.len(), 1);

        // The replaced session's teardown leaves its successor alone
        assert!(!registry.remove_session(&old));
        assert!(registry.get("10.0.0.5:5678").is_some());
        assert!(registry.remove_session(&new));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let (a, _c) = session("10.0.0.5:5678");
        registry.register(Arc::clone(&a));

        assert!(registry.remove("10.0.0.5:5678").is_some());
        assert!(registry.remove("10.0.0.5:5678").is_none());
        assert_eq!(a.mode(), SessionMode::Closed);
    }

    #[tokio::test]
    async fn test_unknown_peer_is_not_found() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.send("1.1.1.1:1", "ls"),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry
                .await_response("1.1.1.1:1", Duration::from_millis(10))
                .await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.enter_pty_mode("1.1.1.1:1"),
            Err(SessionError::NotFound(_))
        ));
        registry.exit_pty_mode("1.1.1.1:1");
    }

    #[test]
    fn test_pty_mode_transitions() {
        let registry = SessionRegistry::new();
        let (a, _c) = session("10.0.0.5:5678");
        registry.register(a);

        let _rx = registry.enter_pty_mode("10.0.0.5:5678").unwrap();
        assert!(registry.is_in_pty_mode("10.0.0.5:5678"));
        assert!(matches!(
            registry.enter_pty_mode("10.0.0.5:5678"),
            Err(SessionError::InvalidMode { .. })
        ));

        registry.exit_pty_mode("10.0.0.5:5678");
        assert!(!registry.is_in_pty_mode("10.0.0.5:5678"));
        // Exiting twice is harmless and re-entry works immediately
        registry.exit_pty_mode("10.0.0.5:5678");
        assert!(registry.enter_pty_mode("10.0.0.5:5678").is_ok());
    }

    #[test]
    fn test_pty_mode_refused_while_command_in_flight() {
        let registry = SessionRegistry::new();
        let (a, _c) = session("10.0.0.5:5678");
        registry.register(a);
        registry.send("10.0.0.5:5678", "ls").unwrap();
        assert!(matches!(
            registry.enter_pty_mode("10.0.0.5:5678"),
            Err(SessionError::InvalidMode { .. })
        ));
    }
}
