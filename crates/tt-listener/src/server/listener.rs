//! TLS accept loop
//!
//! Accepts incoming connections and spawns a handler for each agent.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::server::handler::handle_connection;
use crate::state::ListenerState;

/// Listener that accepts agent connections
pub struct Listener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    /// Shared listener state
    state: Arc<ListenerState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl Listener {
    /// Bind the listening socket
    pub async fn bind(
        bind_addr: SocketAddr,
        tls: Arc<rustls::ServerConfig>,
        state: Arc<ListenerState>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            state,
            cancel,
        })
    }

    /// Address actually bound, useful when port 0 was requested
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read local address")
    }

    /// Accept connections until cancelled
    pub async fn run(self) -> Result<()> {
        tracing::info!("Listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                // Check for shutdown
                _ = self.cancel.cancelled() => {
                    tracing::info!("Listener shutting down");
                    break;
                }

                // Accept new connections
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.spawn_handler(socket, peer_addr),
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        self.state.shutdown();
        Ok(())
    }

    fn spawn_handler(&self, socket: tokio::net::TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New connection from {}", peer_addr);

        let acceptor = self.acceptor.clone();
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            match handle_connection(socket, peer_addr, acceptor, state, cancel).await {
                Ok(()) => {
                    tracing::info!("Connection from {} closed normally", peer_addr);
                }
                Err(e) => {
                    tracing::warn!("Connection from {} closed with error: {}", peer_addr, e);
                }
            }
        });
    }
}
