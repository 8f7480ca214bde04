//! Agent end of relayed tunnel connections
//!
//! The listener owns the local sockets; for each `TUNNEL_OPEN` the agent
//! dials the target and pumps bytes both ways as tunnel frames.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use tt_protocol::constants::TUNNEL_READ_SIZE;
use tt_protocol::{ConnId, TunnelFrame};

/// Time allowed to dial a tunnel target
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound chunks queued per connection. A target that lets the queue fill
/// is disconnected rather than stalling the command processor.
const CONNECTION_QUEUE_CAPACITY: usize = 64;

type ConnKey = (String, ConnId);

struct Connection {
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

type ConnectionTable = Arc<Mutex<HashMap<ConnKey, Connection>>>;

/// Connections dialed on behalf of the listener
pub struct TunnelEndpoint {
    output: mpsc::Sender<String>,
    connections: ConnectionTable,
    dial_timeout: Duration,
    cancel: CancellationToken,
}

impl TunnelEndpoint {
    /// Frames for the listener are sent to `output` as protocol lines
    pub fn new(output: mpsc::Sender<String>) -> Self {
        Self::with_dial_timeout(output, DIAL_TIMEOUT)
    }

    pub fn with_dial_timeout(output: mpsc::Sender<String>, dial_timeout: Duration) -> Self {
        Self {
            output,
            connections: Arc::new(Mutex::new(HashMap::new())),
            dial_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply one frame from the listener
    pub async fn handle(&self, frame: TunnelFrame) {
        match frame {
            TunnelFrame::Open {
                tunnel,
                conn,
                target,
            } => self.open(tunnel, conn, target),
            TunnelFrame::Data {
                tunnel,
                conn,
                payload,
            } => {
                let connection = self.connections.lock().ok().and_then(|c| {
                    c.get(&(tunnel.clone(), conn))
                        .map(|c| (c.inbound.clone(), c.cancel.clone()))
                });
                let Some((inbound, cancel)) = connection else {
                    tracing::debug!("Data for unknown tunnel connection {}/{}", tunnel, conn);
                    return;
                };
                match inbound.try_send(payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        if !cancel.is_cancelled() {
                            tracing::warn!(
                                "Target of {}/{} is not reading; closing the connection",
                                tunnel,
                                conn
                            );
                            cancel.cancel();
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!("Tunnel {}/{} already finished", tunnel, conn);
                    }
                }
            }
            // Dropping the queue lets the connection flush what is already queued
            TunnelFrame::Close { tunnel, conn } => {
                let removed = self
                    .connections
                    .lock()
                    .ok()
                    .and_then(|mut c| c.remove(&(tunnel.clone(), conn)));
                if removed.is_some() {
                    tracing::debug!("Listener closed tunnel connection {}/{}", tunnel, conn);
                }
            }
            TunnelFrame::Stop { tunnel } => {
                let removed: Vec<Connection> = match self.connections.lock() {
                    Ok(mut connections) => {
                        let keys: Vec<ConnKey> = connections
                            .keys()
                            .filter(|(t, _)| *t == tunnel)
                            .cloned()
                            .collect();
                        keys.iter().filter_map(|k| connections.remove(k)).collect()
                    }
                    Err(_) => Vec::new(),
                };
                tracing::info!(
                    "Tunnel {} stopped, dropping {} connections",
                    tunnel,
                    removed.len()
                );
                for connection in removed {
                    connection.cancel.cancel();
                }
            }
            TunnelFrame::SocksStart { tunnel } => {
                tracing::info!("SOCKS5 tunnel {} started by the listener", tunnel);
            }
        }
    }

    fn open(&self, tunnel: String, conn: ConnId, target: String) {
        let (inbound_tx, inbound_rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        let cancel = self.cancel.child_token();
        let key = (tunnel, conn);

        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(
                key.clone(),
                Connection {
                    inbound: inbound_tx,
                    cancel: cancel.clone(),
                },
            );
        }

        tokio::spawn(run_connection(
            key,
            target,
            self.dial_timeout,
            inbound_rx,
            self.output.clone(),
            Arc::clone(&self.connections),
            cancel,
        ));
    }

    /// Drop every connection
    pub fn close(&self) {
        self.cancel.cancel();
        if let Ok(mut connections) = self.connections.lock() {
            connections.clear();
        }
    }
}

impl Drop for TunnelEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(
    key: ConnKey,
    target: String,
    dial_timeout: Duration,
    mut inbound: mpsc::Receiver<Bytes>,
    output: mpsc::Sender<String>,
    connections: ConnectionTable,
    cancel: CancellationToken,
) {
    let (tunnel, conn) = (key.0.clone(), key.1);

    let dialed = tokio::select! {
        _ = cancel.cancelled() => {
            finish(&key, &output, &connections).await;
            return;
        }
        dialed = tokio::time::timeout(dial_timeout, TcpStream::connect(&target)) => dialed,
    };
    let stream = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!("Tunnel {}/{} failed to dial {}: {}", tunnel, conn, target, e);
            finish(&key, &output, &connections).await;
            return;
        }
        Err(_) => {
            tracing::warn!("Tunnel {}/{} timed out dialing {}", tunnel, conn, target);
            finish(&key, &output, &connections).await;
            return;
        }
    };
    tracing::debug!("Tunnel {}/{} connected to {}", tunnel, conn, target);

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; TUNNEL_READ_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = inbound.recv() => match chunk {
                Some(data) => {
                    let written = tokio::select! {
                        _ = cancel.cancelled() => break,
                        written = writer.write_all(&data) => written,
                    };
                    if let Err(e) = written {
                        tracing::debug!("Tunnel {}/{} write failed: {}", tunnel, conn, e);
                        break;
                    }
                }
                None => break,
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let frame = TunnelFrame::Data {
                        tunnel: tunnel.clone(),
                        conn,
                        payload: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if output.send(frame.to_line()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Tunnel {}/{} read failed: {}", tunnel, conn, e);
                    break;
                }
            },
        }
    }

    let _ = writer.shutdown().await;
    finish(&key, &output, &connections).await;
}

/// Tell the listener a connection ended, unless it already knows
async fn finish(key: &ConnKey, output: &mpsc::Sender<String>, connections: &ConnectionTable) {
    let removed = connections
        .lock()
        .ok()
        .and_then(|mut c| c.remove(key))
        .is_some();
    if removed {
        let frame = TunnelFrame::Close {
            tunnel: key.0.clone(),
            conn: key.1,
        };
        let _ = output.send(frame.to_line()).await;
    }
}
