//! Tunnel frames carried over the control channel
//!
//! Every relayed TCP stream is tagged by its tunnel ID and a process-unique
//! connection ID, so any number of streams can share one control channel:
//!
//! ```text
//! TUNNEL_OPEN  <tunnel> <conn> <host:port>   listener -> agent
//! TUNNEL_DATA  <tunnel> <conn> <hex>         both directions
//! TUNNEL_CLOSE <tunnel> <conn>               both directions
//! TUNNEL_STOP  <tunnel>                      listener -> agent
//! SOCKS_START  <tunnel>                      listener -> agent
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::constants::*;
use crate::error::ProtocolError;
use crate::payload::{decode_raw, encode_raw};

/// Identifier of one relayed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Allocate an ID that no other relayed connection in this process uses
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tunnel message routed between a local relay and the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelFrame {
    /// Ask the agent to dial `target` for a new connection
    Open {
        tunnel: String,
        conn: ConnId,
        target: String,
    },
    /// Bytes for one connection
    Data {
        tunnel: String,
        conn: ConnId,
        payload: Bytes,
    },
    /// One connection finished or failed
    Close { tunnel: String, conn: ConnId },
    /// A tunnel was stopped; all of its connections are gone
    Stop { tunnel: String },
    /// A SOCKS5 tunnel was started
    SocksStart { tunnel: String },
}

impl TunnelFrame {
    pub fn tunnel_id(&self) -> &str {
        match self {
            Self::Open { tunnel, .. }
            | Self::Data { tunnel, .. }
            | Self::Close { tunnel, .. }
            | Self::Stop { tunnel }
            | Self::SocksStart { tunnel } => tunnel,
        }
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        match self {
            Self::Open { conn, .. } | Self::Data { conn, .. } | Self::Close { conn, .. } => {
                Some(*conn)
            }
            Self::Stop { .. } | Self::SocksStart { .. } => None,
        }
    }

    /// Render as a protocol line (without the trailing newline)
    pub fn to_line(&self) -> String {
        match self {
            Self::Open {
                tunnel,
                conn,
                target,
            } => format!("{} {} {} {}", CMD_TUNNEL_OPEN, tunnel, conn, target),
            Self::Data {
                tunnel,
                conn,
                payload,
            } => format!(
                "{} {} {} {}",
                CMD_TUNNEL_DATA,
                tunnel,
                conn,
                encode_raw(payload)
            ),
            Self::Close { tunnel, conn } => format!("{} {} {}", CMD_TUNNEL_CLOSE, tunnel, conn),
            Self::Stop { tunnel } => format!("{} {}", CMD_TUNNEL_STOP, tunnel),
            Self::SocksStart { tunnel } => format!("{} {}", CMD_SOCKS_START, tunnel),
        }
    }

    /// Parse the arguments that follow a tunnel verb
    pub(crate) fn parse(verb: &'static str, args: &str) -> Result<Self, ProtocolError> {
        let mut parts = args.split_whitespace();
        let mut next = |what: &str| {
            parts
                .next()
                .map(str::to_string)
                .ok_or_else(|| ProtocolError::malformed(verb, format!("missing {}", what)))
        };

        let tunnel = next("tunnel id")?;
        let frame = match verb {
            CMD_TUNNEL_STOP => Self::Stop { tunnel },
            CMD_SOCKS_START => Self::SocksStart { tunnel },
            _ => {
                let conn = next("connection id")?;
                let conn = conn
                    .parse()
                    .map(ConnId)
                    .map_err(|_| ProtocolError::malformed(verb, "connection id is not a number"))?;
                match verb {
                    CMD_TUNNEL_OPEN => Self::Open {
                        tunnel,
                        conn,
                        target: next("target")?,
                    },
                    CMD_TUNNEL_DATA => Self::Data {
                        tunnel,
                        conn,
                        payload: Bytes::from(decode_raw(&next("payload")?)?),
                    },
                    _ => Self::Close { tunnel, conn },
                }
            }
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_ids_are_unique() {
        let a = ConnId::next();
        let b = ConnId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_frame_lines() {
        let frame = TunnelFrame::Open {
            tunnel: "web".into(),
            conn: ConnId(7),
            target: "10.0.0.5:80".into(),
        };
        assert_eq!(frame.to_line(), "TUNNEL_OPEN web 7 10.0.0.5:80");

        let frame = TunnelFrame::Data {
            tunnel: "web".into(),
            conn: ConnId(7),
            payload: Bytes::from_static(b"\x00hi"),
        };
        assert_eq!(frame.to_line(), "TUNNEL_DATA web 7 006869");

        assert_eq!(
            TunnelFrame::Stop { tunnel: "web".into() }.to_line(),
            "TUNNEL_STOP web"
        );
    }

    #[test]
    fn test_parse_data_frame() {
        let frame = TunnelFrame::parse(CMD_TUNNEL_DATA, "web 7 006869").unwrap();
        assert_eq!(frame.conn_id(), Some(ConnId(7)));
        assert_eq!(frame.tunnel_id(), "web");
        match frame {
            TunnelFrame::Data { payload, .. } => assert_eq!(payload.as_ref(), b"\x00hi"),
            other => panic!("Expected Data frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_conn_id() {
        assert!(TunnelFrame::parse(CMD_TUNNEL_CLOSE, "web seven").is_err());
        assert!(TunnelFrame::parse(CMD_TUNNEL_CLOSE, "web").is_err());
        assert!(TunnelFrame::parse(CMD_TUNNEL_DATA, "web 1 xyz").is_err());
    }
}
