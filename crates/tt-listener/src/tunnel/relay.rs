//! Tunnel table and per-connection relay shared by both managers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use tt_core::error::TunnelError;
use tt_core::TunnelKind;
use tt_protocol::constants::TUNNEL_READ_SIZE;
use tt_protocol::{ConnId, TunnelFrame};

use crate::session::Outbound;

/// Agent chunks queued per local connection. A client that lets the queue
/// fill is disconnected rather than stalling the session read loop.
const CONNECTION_QUEUE_CAPACITY: usize = 64;

/// Time a new local connection gets to finish its handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct Connection {
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

struct Tunnel {
    kind: TunnelKind,
    local_addr: SocketAddr,
    /// Fixed target for port forwards
    target: Option<String>,
    notify: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    connections: HashMap<ConnId, Connection>,
}

/// Snapshot of one running tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TunnelEntry {
    pub id: String,
    pub local_addr: SocketAddr,
    pub target: Option<String>,
    pub connections: usize,
}

/// Tunnels of one manager, keyed by tunnel ID
pub(crate) struct TunnelTable {
    kind: TunnelKind,
    tunnels: Mutex<HashMap<String, Tunnel>>,
}

impl TunnelTable {
    pub fn new(kind: TunnelKind) -> Self {
        Self {
            kind,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Tunnel>> {
        self.tunnels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Bind `127.0.0.1:<port>` and record the tunnel. The ID is checked
    /// before and after binding; a losing racer drops its listener.
    pub async fn bind(
        &self,
        id: &str,
        port: u16,
        target: Option<String>,
        notify: mpsc::Sender<Outbound>,
    ) -> Result<(TcpListener, CancellationToken), TunnelError> {
        validate_id(id)?;
        if self.contains(id) {
            return Err(TunnelError::AlreadyExists(id.to_string()));
        }

        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind { addr, source })?;

        let cancel = CancellationToken::new();
        let mut tunnels = self.lock();
        if tunnels.contains_key(id) {
            return Err(TunnelError::AlreadyExists(id.to_string()));
        }
        tunnels.insert(
            id.to_string(),
            Tunnel {
                kind: self.kind,
                local_addr,
                target,
                notify,
                cancel: cancel.clone(),
                connections: HashMap::new(),
            },
        );
        Ok((listener, cancel))
    }

    /// Remove a tunnel, cancel its accept loop and connections, and tell
    /// the agent
    pub fn stop(&self, id: &str) -> Result<(), TunnelError> {
        let tunnel = self
            .lock()
            .remove(id)
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;

        tunnel.cancel.cancel();
        let frame = TunnelFrame::Stop {
            tunnel: id.to_string(),
        };
        if tunnel.notify.try_send(Outbound::Tunnel(frame)).is_err() {
            tracing::debug!("Could not notify agent that tunnel {} stopped", id);
        }
        tracing::info!(
            "Stopped {} tunnel {} on {} ({} active connections)",
            tunnel.kind,
            id,
            tunnel.local_addr,
            tunnel.connections.len()
        );
        Ok(())
    }

    pub fn stop_all(&self) {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        for id in ids {
            // A concurrent stop may have won; that is fine
            let _ = self.stop(&id);
        }
    }

    /// Stop every tunnel relaying through the session behind `notify`.
    /// Returns how many were stopped.
    pub fn stop_owned_by(&self, notify: &mpsc::Sender<Outbound>) -> usize {
        let ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, t)| t.notify.same_channel(notify))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter(|id| self.stop(id).is_ok()).count()
    }

    pub fn entries(&self) -> Vec<TunnelEntry> {
        let mut entries: Vec<TunnelEntry> = self
            .lock()
            .iter()
            .map(|(id, t)| TunnelEntry {
                id: id.clone(),
                local_addr: t.local_addr,
                target: t.target.clone(),
                connections: t.connections.len(),
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Track a new local connection. Returns its cancellation token, or
    /// `None` if the tunnel is gone.
    fn add_connection(
        &self,
        id: &str,
        conn: ConnId,
        inbound: mpsc::Sender<Bytes>,
    ) -> Option<CancellationToken> {
        let mut tunnels = self.lock();
        let tunnel = tunnels.get_mut(id)?;
        let cancel = tunnel.cancel.child_token();
        tunnel.connections.insert(
            conn,
            Connection {
                inbound,
                cancel: cancel.clone(),
            },
        );
        Some(cancel)
    }

    fn remove_connection(&self, id: &str, conn: ConnId) -> Option<Connection> {
        self.lock()
            .get_mut(id)
            .and_then(|t| t.connections.remove(&conn))
    }

    fn connection(&self, id: &str, conn: ConnId) -> Option<(mpsc::Sender<Bytes>, CancellationToken)> {
        self.lock()
            .get(id)
            .and_then(|t| t.connections.get(&conn))
            .map(|c| (c.inbound.clone(), c.cancel.clone()))
    }

    /// Apply a frame from the agent without waiting on the local socket.
    /// Returns `false` if the frame does not belong to a connection in this
    /// table.
    pub async fn dispatch(&self, frame: TunnelFrame) -> bool {
        match frame {
            TunnelFrame::Data {
                tunnel,
                conn,
                payload,
            } => {
                let Some((inbound, cancel)) = self.connection(&tunnel, conn) else {
                    return false;
                };
                match inbound.try_send(payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        if !cancel.is_cancelled() {
                            tracing::warn!(
                                "Local client of {}/{} is not reading; closing it",
                                tunnel,
                                conn
                            );
                            cancel.cancel();
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!("Connection {}/{} already finished", tunnel, conn);
                    }
                }
                true
            }
            // Dropping the queue lets the relay flush what is already queued
            TunnelFrame::Close { tunnel, conn } => match self.remove_connection(&tunnel, conn) {
                Some(_) => {
                    tracing::debug!("Agent closed {}/{}", tunnel, conn);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }
}

/// Tunnel IDs travel as a single protocol word
fn validate_id(id: &str) -> Result<(), TunnelError> {
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return Err(TunnelError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Accept loop for one tunnel. `open` performs any per-connection
/// handshake and yields the target to dial, or `None` to drop the socket.
pub(crate) async fn accept_loop<F, Fut>(
    table: Arc<TunnelTable>,
    id: String,
    listener: TcpListener,
    notify: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    open: F,
) where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Option<(TcpStream, String)>> + Send + 'static,
{
    let open = Arc::new(open);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    tracing::debug!("Tunnel {} accepted {}", id, addr);
                    let table = Arc::clone(&table);
                    let id = id.clone();
                    let notify = notify.clone();
                    let open = Arc::clone(&open);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let opened = tokio::select! {
                            _ = cancel.cancelled() => return,
                            opened = tokio::time::timeout(HANDSHAKE_TIMEOUT, open(socket)) => opened,
                        };
                        match opened {
                            Ok(Some((socket, target))) => {
                                relay(table, id, socket, target, notify).await;
                            }
                            Ok(None) => {}
                            Err(_) => {
                                tracing::debug!("Tunnel {} handshake with {} timed out", id, addr);
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("Tunnel {} accept failed: {}", id, e);
                }
            }
        }
    }
    tracing::debug!("Accept loop for tunnel {} finished", id);
}

/// Relay one local connection: announce it to the agent, then pump bytes
/// both ways until either side closes. The agent hears `TUNNEL_CLOSE`
/// unless it closed the connection or the tunnel was stopped.
async fn relay(
    table: Arc<TunnelTable>,
    id: String,
    socket: TcpStream,
    target: String,
    notify: mpsc::Sender<Outbound>,
) {
    let conn = ConnId::next();
    let (inbound_tx, inbound) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);

    let Some(cancel) = table.add_connection(&id, conn, inbound_tx) else {
        return;
    };

    let open = TunnelFrame::Open {
        tunnel: id.clone(),
        conn,
        target: target.clone(),
    };
    if notify.send(Outbound::Tunnel(open)).await.is_err() {
        tracing::warn!("Session gone; dropping connection {}/{}", id, conn);
        table.remove_connection(&id, conn);
        return;
    }
    tracing::debug!("Relaying {}/{} to {}", id, conn, target);

    let (reader, mut writer) = socket.into_split();
    pump(&id, conn, reader, &mut writer, inbound, &notify, &cancel).await;
    let _ = writer.shutdown().await;

    if table.remove_connection(&id, conn).is_some() {
        let close = TunnelFrame::Close {
            tunnel: id.clone(),
            conn,
        };
        let _ = notify.send(Outbound::Tunnel(close)).await;
    }
    tracing::debug!("Connection {}/{} finished", id, conn);
}

async fn pump(
    id: &str,
    conn: ConnId,
    mut reader: OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    mut inbound: mpsc::Receiver<Bytes>,
    notify: &mpsc::Sender<Outbound>,
    cancel: &CancellationToken,
) {
    let mut buf = vec![0u8; TUNNEL_READ_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            chunk = inbound.recv() => {
                let Some(data) = chunk else { return };
                let written = tokio::select! {
                    _ = cancel.cancelled() => return,
                    written = writer.write_all(&data) => written,
                };
                if let Err(e) = written {
                    tracing::debug!("Local write for {}/{} failed: {}", id, conn, e);
                    return;
                }
            }

            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("Local read for {}/{} failed: {}", id, conn, e);
                        return;
                    }
                };
                let frame = TunnelFrame::Data {
                    tunnel: id.to_string(),
                    conn,
                    payload: Bytes::copy_from_slice(&buf[..n]),
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = notify.send(Outbound::Tunnel(frame)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id() {
        assert!(validate_id("web").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("two words").is_err());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_connection() {
        let table = TunnelTable::new(TunnelKind::PortForward);
        let frame = TunnelFrame::Close {
            tunnel: "nope".into(),
            conn: ConnId(42),
        };
        assert!(!table.dispatch(frame).await);
    }

    #[tokio::test]
    async fn test_stop_notifies_agent() {
        let table = TunnelTable::new(TunnelKind::PortForward);
        let (tx, mut rx) = mpsc::channel(4);
        table
            .bind("t1", 0, Some("example.com:80".into()), tx)
            .await
            .unwrap();
        table.stop("t1").unwrap();
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Tunnel(TunnelFrame::Stop {
                tunnel: "t1".into()
            }))
        );
        assert!(matches!(table.stop("t1"), Err(TunnelError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stop_owned_by_session() {
        let table = TunnelTable::new(TunnelKind::Socks5);
        let (a, _rx_a) = mpsc::channel(4);
        let (b, _rx_b) = mpsc::channel(4);
        table.bind("a1", 0, None, a.clone()).await.unwrap();
        table.bind("a2", 0, None, a.clone()).await.unwrap();
        table.bind("b1", 0, None, b).await.unwrap();

        assert_eq!(table.stop_owned_by(&a), 2);
        let ids: Vec<String> = table.entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b1".to_string()]);
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> TunnelFrame {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Outbound::Tunnel(frame))) => frame,
            other => panic!("expected a tunnel frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stalled_client_is_closed_without_blocking_dispatch() {
        let table = Arc::new(TunnelTable::new(TunnelKind::PortForward));
        let (tx, mut rx) = mpsc::channel(16);
        table
            .bind("web", 0, Some("10.1.1.1:80".into()), tx.clone())
            .await
            .unwrap();

        // A local client that never reads what the agent sends
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let (socket, _) = server.accept().await.unwrap();
        tokio::spawn(relay(
            Arc::clone(&table),
            "web".into(),
            socket,
            "10.1.1.1:80".into(),
            tx,
        ));
        let conn = match next_frame(&mut rx).await {
            TunnelFrame::Open { conn, .. } => conn,
            other => panic!("expected TUNNEL_OPEN, got {:?}", other),
        };

        let chunk = Bytes::from(vec![0u8; TUNNEL_READ_SIZE]);
        let flood = async {
            for _ in 0..CONNECTION_QUEUE_CAPACITY * 4 {
                let frame = TunnelFrame::Data {
                    tunnel: "web".into(),
                    conn,
                    payload: chunk.clone(),
                };
                assert!(table.dispatch(frame).await);
            }
        };
        tokio::time::timeout(Duration::from_secs(5), flood)
            .await
            .expect("dispatch waited on the local client");

        assert_eq!(
            next_frame(&mut rx).await,
            TunnelFrame::Close {
                tunnel: "web".into(),
                conn
            }
        );
        assert_eq!(table.entries()[0].connections, 0);
    }

    #[tokio::test]
    async fn test_stop_ends_pending_handshakes() {
        let table = Arc::new(TunnelTable::new(TunnelKind::Socks5));
        let (tx, _rx) = mpsc::channel(16);
        let (listener, cancel) = table.bind("proxy", 0, None, tx.clone()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        // The handshake waits for a byte the client never sends
        tokio::spawn(accept_loop(
            Arc::clone(&table),
            "proxy".into(),
            listener,
            tx,
            cancel,
            |mut socket: TcpStream| async move {
                let mut byte = [0u8; 1];
                let _ = socket.read_exact(&mut byte).await;
                None::<(TcpStream, String)>
            },
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        table.stop("proxy").unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("handshake task outlived the tunnel");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
