//! tt-protocol: Line protocol for tether control channels
//!
//! This crate defines the newline-delimited command protocol spoken between
//! the listener and its agents over TLS, the gzip+hex payload codec used for
//! file transfer, and the tunnel frames that multiplex relayed TCP streams.

pub mod codec;
pub mod command;
pub mod constants;
pub mod error;
pub mod payload;
pub mod pool;
pub mod tunnel;

pub use codec::LineCodec;
pub use command::{strip_terminator, terminate, unescape_output_line, Command, TerminalSize};
pub use constants::END_OF_OUTPUT;
pub use error::ProtocolError;
pub use payload::{decode_payload, encode_payload};
pub use pool::BufferPool;
pub use tunnel::{ConnId, TunnelFrame};
