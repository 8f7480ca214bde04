//! Interactive terminal support

mod bridge;

pub use bridge::{resolve_shell, PtyBridge};

use thiserror::Error;

/// Terminal errors
#[derive(Debug, Error)]
pub enum PtyError {
    /// Shell is neither allow-listed nor in `/etc/shells`
    #[error("shell {0:?} is not allowed")]
    ShellNotAllowed(String),

    /// Rows or columns of zero
    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },

    /// The PTY system refused an operation
    #[error("{context}: {message}")]
    System {
        context: &'static str,
        message: String,
    },

    /// Reading or writing the master side failed
    #[error("terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl PtyError {
    fn system(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::System {
            context,
            message: err.to_string(),
        }
    }
}
