//! Local tunnels relayed through an agent
//!
//! Port forwards and SOCKS5 listeners share one table implementation and
//! one frame format; the session read loop hands every tunnel frame to
//! [`TunnelManagers::dispatch`].

mod forward;
mod relay;
mod socks;

pub use forward::{ForwardInfo, ForwardManager};
pub use socks::{SocksInfo, SocksManager};

use std::net::SocketAddr;

use tokio::sync::{mpsc, Mutex};
use tt_core::error::TunnelError;
use tt_protocol::TunnelFrame;

use crate::session::Outbound;

/// Both tunnel managers of a listener.
///
/// Tunnel IDs are unique across both managers, since the agent stops
/// connections by tunnel ID alone. Start tunnels through
/// [`start_forward`](Self::start_forward) and
/// [`start_socks`](Self::start_socks) to keep it that way.
#[derive(Default)]
pub struct TunnelManagers {
    pub forward: ForwardManager,
    pub socks: SocksManager,
    starting: Mutex<()>,
}

impl TunnelManagers {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_forward(
        &self,
        id: &str,
        local_port: u16,
        remote_target: &str,
        notify: mpsc::Sender<Outbound>,
    ) -> Result<SocketAddr, TunnelError> {
        let _guard = self.starting.lock().await;
        if self.socks.contains(id) {
            return Err(TunnelError::AlreadyExists(id.to_string()));
        }
        self.forward
            .start_forward(id, local_port, remote_target, notify)
            .await
    }

    pub async fn start_socks(
        &self,
        id: &str,
        local_port: u16,
        notify: mpsc::Sender<Outbound>,
    ) -> Result<SocketAddr, TunnelError> {
        let _guard = self.starting.lock().await;
        if self.forward.contains(id) {
            return Err(TunnelError::AlreadyExists(id.to_string()));
        }
        self.socks.start_socks(id, local_port, notify).await
    }

    /// Route a frame from an agent. Returns `false` if no local connection
    /// claims it.
    pub async fn dispatch(&self, frame: TunnelFrame) -> bool {
        if self.forward.dispatch(frame.clone()).await {
            return true;
        }
        self.socks.dispatch(frame).await
    }

    /// Stop every tunnel relaying through one session
    pub fn stop_owned_by(&self, notify: &mpsc::Sender<Outbound>) -> usize {
        self.forward.stop_owned_by(notify) + self.socks.stop_owned_by(notify)
    }

    pub fn stop_all(&self) {
        self.forward.stop_all();
        self.socks.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_are_unique_across_managers() {
        let managers = TunnelManagers::new();
        let (tx, _rx) = mpsc::channel(16);

        managers
            .start_forward("web", 0, "10.1.1.1:80", tx.clone())
            .await
            .unwrap();
        assert!(matches!(
            managers.start_socks("web", 0, tx.clone()).await,
            Err(TunnelError::AlreadyExists(_))
        ));

        managers.start_socks("proxy", 0, tx.clone()).await.unwrap();
        assert!(matches!(
            managers.start_forward("proxy", 0, "10.1.1.1:80", tx).await,
            Err(TunnelError::AlreadyExists(_))
        ));

        assert_eq!(managers.forward.len(), 1);
        assert_eq!(managers.socks.len(), 1);
        managers.stop_all();
    }
}
