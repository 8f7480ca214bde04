//! Per-connection lifecycle: TLS, authentication, registration and the
//! multiplexer

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use tt_core::TetherError;
use tt_protocol::LineCodec;

use super::auth::authenticate;
use crate::session::{self, SessionHandle};
use crate::state::ListenerState;

/// Drive one accepted connection until it ends. The peer is registered
/// only after it authenticates and is removed exactly once when the
/// session finishes.
pub async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ListenerState>,
    cancel: CancellationToken,
) -> Result<(), TetherError> {
    let config = &state.config;
    let tls = tokio::time::timeout(config.auth_timeout, acceptor.accept(socket))
        .await
        .map_err(|_| {
            TetherError::transport(
                "TLS handshake",
                std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"),
            )
        })?
        .map_err(|e| TetherError::transport("TLS handshake", e))?;

    let mut framed = Framed::new(tls, LineCodec::with_max_length(config.max_buffer_size));
    if let Err(e) = authenticate(
        &mut framed,
        config.shared_secret.as_deref(),
        config.auth_timeout,
    )
    .await
    {
        tracing::warn!("Authentication failed for {}: {}", peer_addr, e);
        return Err(e.into());
    }

    let peer = peer_addr.to_string();
    let (handle, channels) = SessionHandle::new(&peer, cancel.child_token());
    let handle = Arc::new(handle);
    let notify = handle.notifier();
    state.sessions.register(Arc::clone(&handle));
    tracing::info!("Agent {} connected ({} active)", peer, state.sessions.len());

    let result = session::run(
        Arc::clone(&handle),
        framed,
        channels,
        Arc::clone(&state.tunnels),
        state.multiplexer_config(),
    )
    .await;

    let stopped = state.tunnels.stop_owned_by(&notify);
    if stopped > 0 {
        tracing::info!("Stopped {} tunnels owned by {}", stopped, peer);
    }
    state.sessions.remove_session(&handle);
    tracing::info!("Agent {} disconnected ({} active)", peer, state.sessions.len());
    result
}
