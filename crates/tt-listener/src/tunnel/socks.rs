//! SOCKS5 manager
//!
//! Each SOCKS5 tunnel binds a loopback port, performs a no-auth SOCKS5
//! handshake per connection, and relays the connection through the agent
//! to the requested destination. Success is answered before the agent has
//! dialled; if the dial fails the agent closes the connection.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tt_core::error::TunnelError;
use tt_core::TunnelKind;
use tt_protocol::TunnelFrame;

use super::relay::{accept_loop, TunnelTable};
use crate::session::Outbound;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// A running SOCKS5 tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksInfo {
    pub id: String,
    pub local_addr: SocketAddr,
    pub connections: usize,
}

/// Manages SOCKS5 listeners by ID
pub struct SocksManager {
    table: Arc<TunnelTable>,
}

impl SocksManager {
    pub fn new() -> Self {
        Self {
            table: Arc::new(TunnelTable::new(TunnelKind::Socks5)),
        }
    }

    /// Start a SOCKS5 listener on `127.0.0.1:<local_port>` and announce it
    /// to the agent with `SOCKS_START`
    pub async fn start_socks(
        &self,
        id: &str,
        local_port: u16,
        notify: mpsc::Sender<Outbound>,
    ) -> Result<SocketAddr, TunnelError> {
        let (listener, cancel) = self
            .table
            .bind(id, local_port, None, notify.clone())
            .await?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind {
                addr: format!("127.0.0.1:{}", local_port),
                source,
            })?;

        let start = TunnelFrame::SocksStart {
            tunnel: id.to_string(),
        };
        if notify.send(Outbound::Tunnel(start)).await.is_err() {
            tracing::warn!("Could not announce SOCKS5 tunnel {} to the agent", id);
        }

        tokio::spawn(accept_loop(
            Arc::clone(&self.table),
            id.to_string(),
            listener,
            notify,
            cancel,
            |socket| async move {
                match handshake(socket).await {
                    Ok(accepted) => Some(accepted),
                    Err(e) => {
                        tracing::debug!("SOCKS5 handshake failed: {}", e);
                        None
                    }
                }
            },
        ));

        tracing::info!("SOCKS5 {} listening on {}", id, local_addr);
        Ok(local_addr)
    }

    pub fn stop_socks(&self, id: &str) -> Result<(), TunnelError> {
        self.table.stop(id)
    }

    pub fn stop_all(&self) {
        self.table.stop_all();
    }

    pub fn list_socks(&self) -> Vec<SocksInfo> {
        self.table
            .entries()
            .into_iter()
            .map(|entry| SocksInfo {
                id: entry.id,
                local_addr: entry.local_addr,
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

impl Default for SocksManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the server side of a SOCKS5 no-auth CONNECT handshake and return
/// the socket with the requested `host:port`
async fn handshake(mut socket: TcpStream) -> std::io::Result<(TcpStream, String)> {
    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(invalid(format!("unsupported SOCKS version {}", header[0])));
    }

    let mut methods = vec![0u8; header[1] as usize];
    socket.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        socket
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(invalid("client offered no acceptable auth method"));
    }
    socket.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    let [version, command, _reserved, atyp] = request;
    if version != SOCKS_VERSION {
        return Err(invalid(format!("unsupported SOCKS version {}", version)));
    }
    if command != CMD_CONNECT {
        reply(&mut socket, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(invalid(format!("unsupported SOCKS command {}", command)));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            socket.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = socket.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            socket.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| invalid("domain name is not UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            socket.read_exact(&mut octets).await?;
            format!("[{}]", Ipv6Addr::from(octets))
        }
        other => {
            reply(&mut socket, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(invalid(format!("unsupported address type {}", other)));
        }
    };
    let port = socket.read_u16().await?;

    reply(&mut socket, REPLY_SUCCEEDED).await?;
    Ok((socket, format!("{}:{}", host, port)))
}

/// Reply with a zero IPv4 bind address
async fn reply(socket: &mut TcpStream, code: u8) -> std::io::Result<()> {
    socket
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

fn invalid(message: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.into())
}
