//! Port-forward manager
//!
//! Each forward binds a loopback port and relays every accepted connection
//! through the agent to one fixed target.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use tt_core::error::TunnelError;
use tt_core::TunnelKind;
use tt_protocol::TunnelFrame;

use super::relay::{accept_loop, TunnelTable};
use crate::session::Outbound;

/// A running port forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    pub id: String,
    pub local_addr: SocketAddr,
    pub remote_addr: String,
    pub connections: usize,
}

/// Manages port forwards by ID
pub struct ForwardManager {
    table: Arc<TunnelTable>,
}

impl ForwardManager {
    pub fn new() -> Self {
        Self {
            table: Arc::new(TunnelTable::new(TunnelKind::PortForward)),
        }
    }

    /// Start forwarding `127.0.0.1:<local_port>` to `remote_target` through
    /// the session behind `notify`. Port 0 picks a free port; the bound
    /// address is returned.
    pub async fn start_forward(
        &self,
        id: &str,
        local_port: u16,
        remote_target: &str,
        notify: mpsc::Sender<Outbound>,
    ) -> Result<SocketAddr, TunnelError> {
        validate_target(remote_target)?;

        let (listener, cancel) = self
            .table
            .bind(id, local_port, Some(remote_target.to_string()), notify.clone())
            .await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind {
                addr: format!("127.0.0.1:{}", local_port),
                source,
            })?;

        let target = remote_target.to_string();
        tokio::spawn(accept_loop(
            Arc::clone(&self.table),
            id.to_string(),
            listener,
            notify,
            cancel,
            move |socket| {
                let target = target.clone();
                async move { Some((socket, target)) }
            },
        ));

        tracing::info!(
            "Forward {} listening on {} -> {}",
            id,
            local_addr,
            remote_target
        );
        Ok(local_addr)
    }

    pub fn stop_forward(&self, id: &str) -> Result<(), TunnelError> {
        self.table.stop(id)
    }

    pub fn stop_all(&self) {
        self.table.stop_all();
    }

    pub fn list_forwards(&self) -> Vec<ForwardInfo> {
        self.table
            .entries()
            .into_iter()
            .map(|entry| ForwardInfo {
                id: entry.id,
                local_addr: entry.local_addr,
                remote_addr: entry.target.unwrap_or_default(),
                connections: entry.connections,
            })
            .collect()
    }

    /// Stop the tunnels owned by one session
    pub fn stop_owned_by(&self, notify: &mpsc::Sender<Outbound>) -> usize {
        self.table.stop_owned_by(notify)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.contains(id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route a frame from the agent to its local connection
    pub async fn dispatch(&self, frame: TunnelFrame) -> bool {
        self.table.dispatch(frame).await
    }
}

impl Default for ForwardManager {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_target(target: &str) -> Result<(), TunnelError> {
    let valid = target
        .rsplit_once(':')
        .map(|(host, port)| {
            !host.is_empty() && !target.contains(char::is_whitespace) && port.parse::<u16>().is_ok()
        })
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(TunnelError::InvalidTarget(target.to_string()))
    }
}
