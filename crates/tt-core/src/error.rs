//! Core error types for tether

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tt_protocol::ProtocolError;

use crate::types::SessionMode;

/// Closed classification of every failure, for callers that branch on kind
/// rather than on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or wrong secret, fingerprint mismatch
    Auth,
    /// Read/write failure or EOF; fatal to the session
    Transport,
    /// Malformed response, invalid hex, decode failure; fatal to one operation
    Protocol,
    /// A wait elapsed
    Timeout,
    /// A bounded queue had no room
    QueueFull,
    /// File could not be opened, read or written
    FileSystem,
    /// Unknown session or tunnel
    NotFound,
    /// Operation not allowed in the current mode
    InvalidState,
    /// Bad configuration or TLS material
    Config,
}

/// Top-level error type for tether
#[derive(Error, Debug)]
pub enum TetherError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// File transfer error
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// TLS material error
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Transport failure with the phase it happened in
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TetherError {
    /// Wrap an I/O error with the phase that failed
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Session(e) => e.kind(),
            Self::Transfer(e) => e.kind(),
            Self::Tunnel(e) => e.kind(),
            Self::Config(_) | Self::Tls(_) => ErrorKind::Config,
            Self::Transport { .. } | Self::Io(_) => ErrorKind::Transport,
        }
    }
}

/// Authentication-related errors
#[derive(Error, Debug)]
pub enum AuthError {
    /// Secret did not match, or the listener answered AUTH_FAILED
    #[error("authentication failed")]
    Rejected,

    /// First line was not an AUTH command
    #[error("expected AUTH command, got {0:?}")]
    UnexpectedCommand(String),

    /// Listener certificate is not the pinned one
    #[error("fingerprint mismatch: expected {expected}")]
    FingerprintMismatch { expected: String },

    /// Peer did not complete the exchange in time
    #[error("authentication timed out after {0:?}")]
    Timeout(Duration),

    /// Read or write failed during the exchange
    #[error("authentication I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// No session for this peer
    #[error("client not found: {0}")]
    NotFound(String),

    /// Send queue is at capacity
    #[error("send queue full for {0}")]
    QueueFull(String),

    /// No completed response arrived in time
    #[error("timeout waiting for response from {peer} after {after:?}")]
    Timeout { peer: String, after: Duration },

    /// A foreground command is already in flight
    #[error("command already in flight for {0}")]
    Busy(String),

    /// Operation not allowed in the session's current mode
    #[error("{peer} is in {mode} mode")]
    InvalidMode { peer: String, mode: SessionMode },

    /// Session was torn down
    #[error("session closed: {0}")]
    Closed(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::QueueFull(_) => ErrorKind::QueueFull,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Busy(_) | Self::InvalidMode { .. } => ErrorKind::InvalidState,
            Self::Closed(_) => ErrorKind::Transport,
        }
    }
}

/// File transfer errors. None of these close the session.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The multiplexer could not send or await a step
    #[error("{step} failed: {source}")]
    Channel {
        step: &'static str,
        #[source]
        source: SessionError,
    },

    /// The agent answered a step with something other than OK
    #[error("{step} rejected: {reply}")]
    Rejected { step: &'static str, reply: String },

    /// Local file could not be read or written
    #[error("local file {path:?}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Response payload was malformed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Channel { source, .. } => source.kind(),
            Self::Rejected { .. } | Self::LocalIo { .. } => ErrorKind::FileSystem,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

/// Tunnel manager errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// A tunnel with this ID is already running
    #[error("tunnel {0} already exists")]
    AlreadyExists(String),

    /// No tunnel with this ID
    #[error("tunnel {0} not found")]
    NotFound(String),

    /// Tunnel IDs travel as one protocol word
    #[error("invalid tunnel id {0:?}")]
    InvalidId(String),

    /// Remote target is not `host:port`
    #[error("invalid tunnel target {0:?}")]
    InvalidTarget(String),

    /// Local listener could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists(_) | Self::InvalidId(_) => ErrorKind::InvalidState,
            Self::InvalidTarget(_) => ErrorKind::Config,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Bind { .. } => ErrorKind::Transport,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Certificate and TLS configuration errors
#[derive(Error, Debug)]
pub enum TlsError {
    /// Self-signed certificate generation failed
    #[error("failed to generate certificate: {0}")]
    Generate(String),

    /// PEM input held no usable certificate or key
    #[error("invalid PEM data: {0}")]
    InvalidPem(String),

    /// rustls rejected the configuration
    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    /// Reading certificate files failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
