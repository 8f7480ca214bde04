//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding control-channel traffic
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Payload text is not valid hex
    #[error("Invalid hex payload: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Hex decoded but the bytes are not a valid gzip stream
    #[error("Failed to decompress payload: {0}")]
    Decompress(#[source] std::io::Error),

    /// Compressor failed while encoding
    #[error("Failed to compress payload: {0}")]
    Compress(#[source] std::io::Error),

    /// A command line that could not be parsed
    #[error("Malformed {command} command: {reason}")]
    MalformedCommand {
        command: &'static str,
        reason: String,
    },

    /// Response did not carry the expected prefix
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(command: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedCommand {
            command,
            reason: reason.into(),
        }
    }
}
