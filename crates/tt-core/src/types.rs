//! Core domain types

use std::fmt;

/// Lifecycle of one listener-side session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Connected, waiting for the AUTH line
    AwaitingAuth,
    /// Idle and accepting commands
    Ready,
    /// A foreground command is waiting for its terminator
    CommandInFlight,
    /// An interactive terminal is attached
    PtyActive,
    /// Torn down
    Closed,
}

impl SessionMode {
    /// Whether a new foreground command may start
    pub fn accepts_foreground(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingAuth => "awaiting-auth",
            Self::Ready => "ready",
            Self::CommandInFlight => "command-in-flight",
            Self::PtyActive => "pty",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Kind of local tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    PortForward,
    Socks5,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortForward => f.write_str("forward"),
            Self::Socks5 => f.write_str("socks5"),
        }
    }
}

/// How an agent's command loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The listener sent `exit`
    Exit,
    /// The listener closed the stream
    PeerClosed,
}
