//! TLS client that dials the listener
//!
//! One `ReverseClient` is one connection attempt: dial, verify the pinned
//! certificate, authenticate, then hand the stream to the command processor.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use tt_core::config::AgentConfig;
use tt_core::error::AuthError;
use tt_core::tls;
use tt_core::traits::SessionClient;
use tt_core::{SessionEnd, TetherError};
use tt_protocol::{Command, LineCodec};

use crate::processor::{self, ProcessorConfig};

type Connection = Framed<TlsStream<TcpStream>, LineCodec>;

/// Client side of one session with the listener
pub struct ReverseClient {
    config: Arc<AgentConfig>,
    connection: Option<Connection>,
    connected: bool,
    cancel: CancellationToken,
}

impl ReverseClient {
    pub fn new(config: Arc<AgentConfig>, cancel: CancellationToken) -> Self {
        Self {
            config,
            connection: None,
            connected: false,
            cancel,
        }
    }

    async fn dial(&self) -> Result<Connection, TetherError> {
        let config = &self.config;
        let target = &config.target;

        let tcp = tokio::time::timeout(config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| {
                TetherError::transport(
                    format!("connect to {}", target),
                    io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
                )
            })?
            .map_err(|e| TetherError::transport(format!("connect to {}", target), e))?;
        let _ = tcp.set_nodelay(true);

        let expected = config.cert_fingerprint.as_deref();
        if expected.is_none() {
            tracing::warn!(
                "No certificate fingerprint configured - accepting any certificate from {}",
                target
            );
        }
        let connector = TlsConnector::from(tls::client_config(expected)?);
        let server_name = tls::server_name(&config.target_host()?);

        let stream = tokio::time::timeout(
            config.connect_timeout,
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| {
            TetherError::transport(
                "TLS handshake",
                io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"),
            )
        })?
        .map_err(|e| {
            if tls::is_fingerprint_mismatch(&e) {
                TetherError::from(AuthError::FingerprintMismatch {
                    expected: expected.unwrap_or_default().to_string(),
                })
            } else {
                TetherError::transport("TLS handshake", e)
            }
        })?;

        Ok(Framed::new(stream, LineCodec::new()))
    }

    /// Send `AUTH <secret>` and wait for `AUTH_OK`
    async fn authenticate(&self, connection: &mut Connection, secret: &str) -> Result<(), AuthError> {
        connection
            .send(Command::Auth(secret.to_string()).to_line())
            .await
            .map_err(into_auth_error)?;

        let reply = tokio::time::timeout(self.config.connect_timeout, connection.next())
            .await
            .map_err(|_| AuthError::Timeout(self.config.connect_timeout))?;
        match reply {
            Some(Ok(line)) if matches!(Command::parse(&line), Ok(Command::AuthOk)) => Ok(()),
            Some(Ok(line)) => {
                tracing::debug!("Authentication answered with {:?}", line);
                Err(AuthError::Rejected)
            }
            Some(Err(e)) => Err(into_auth_error(e)),
            None => Err(AuthError::Rejected),
        }
    }
}

fn into_auth_error(err: tt_protocol::ProtocolError) -> AuthError {
    match err {
        tt_protocol::ProtocolError::Io(e) => AuthError::Io(e),
        other => AuthError::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
    }
}

#[async_trait]
impl SessionClient for ReverseClient {
    async fn connect(&mut self) -> Result<(), TetherError> {
        tracing::debug!("Connecting to {}", self.config.target);
        let mut connection = self.dial().await?;

        if let Some(secret) = self.config.shared_secret.as_deref() {
            self.authenticate(&mut connection, secret).await?;
            tracing::debug!("Authenticated with {}", self.config.target);
        }

        self.connection = Some(connection);
        self.connected = true;
        Ok(())
    }

    async fn handle_commands(&mut self) -> Result<SessionEnd, TetherError> {
        let connection = self.connection.take().ok_or_else(|| {
            TetherError::transport(
                "handle commands",
                io::Error::new(io::ErrorKind::NotConnected, "not connected"),
            )
        })?;
        let config = ProcessorConfig::from(self.config.as_ref());
        processor::run(connection, &config, self.cancel.child_token()).await
    }

    async fn close(&mut self) -> Result<(), TetherError> {
        self.connected = false;
        if let Some(mut connection) = self.connection.take() {
            connection
                .get_mut()
                .shutdown()
                .await
                .map_err(|e| TetherError::transport("close", e))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    use tt_core::ErrorKind;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    /// A TLS server that answers the AUTH line with `reply`
    async fn fake_listener(reply: &'static str) -> (String, String) {
        let bundle = tls::generate_certificate().unwrap();
        let acceptor = TlsAcceptor::from(tls::server_config(&bundle).unwrap());
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (tcp, _) = server.accept().await.unwrap();
            let Ok(stream) = acceptor.accept(tcp).await else {
                return;
            };
            let mut framed = Framed::new(stream, LineCodec::new());
            if let Some(Ok(_auth)) = framed.next().await {
                let _ = framed.send(reply).await;
            }
            // Hold the connection open until the client goes away
            while let Some(Ok(_)) = framed.next().await {}
        });
        (addr, bundle.fingerprint)
    }

    fn client(target: String, fingerprint: Option<String>) -> ReverseClient {
        let config = AgentConfig {
            target,
            shared_secret: Some(SECRET.to_string()),
            cert_fingerprint: fingerprint,
            connect_timeout: Duration::from_secs(5),
            ..AgentConfig::default()
        };
        ReverseClient::new(Arc::new(config), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_connect_with_pinned_fingerprint() {
        let (addr, fingerprint) = fake_listener("AUTH_OK").await;
        let mut client = client(addr, Some(fingerprint));

        client.connect().await.unwrap();
        assert!(client.is_connected());
        client.close().await.unwrap();
        assert!(!client.is_connected());
        // Closing twice is harmless
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch() {
        let (addr, _) = fake_listener("AUTH_OK").await;
        let mut client = client(addr, Some("00".repeat(32)));

        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TetherError::Auth(AuthError::FingerprintMismatch { .. })
        ));
        assert!(err.to_string().contains("fingerprint mismatch"));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_rejected_secret() {
        let (addr, _) = fake_listener("AUTH_FAILED").await;
        let mut client = client(addr, None);

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.to_string().contains("authentication failed"));
    }

    #[tokio::test]
    async fn test_unreachable_listener() {
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };
        let mut client = client(format!("127.0.0.1:{}", port), None);

        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_handle_commands_requires_connection() {
        let mut client = client("127.0.0.1:9".into(), None);
        assert!(client.handle_commands().await.is_err());
    }
}
