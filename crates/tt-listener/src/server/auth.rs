//! Shared-secret admission for new connections

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use tt_core::error::AuthError;
use tt_protocol::constants::{CMD_AUTH_FAILED, CMD_AUTH_OK};
use tt_protocol::{Command, LineCodec, ProtocolError};

/// Authenticate a freshly accepted connection.
///
/// With no secret configured every connection is admitted. Otherwise the
/// first line must be `AUTH <secret>`; any other outcome writes
/// `AUTH_FAILED` and closes the stream.
pub async fn authenticate<S>(
    framed: &mut Framed<S, LineCodec>,
    secret: Option<&str>,
    timeout: Duration,
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(secret) = secret else {
        return Ok(());
    };

    let outcome = match tokio::time::timeout(timeout, framed.next()).await {
        Err(_) => Err(AuthError::Timeout(timeout)),
        Ok(None) => Err(AuthError::Io(std::io::ErrorKind::UnexpectedEof.into())),
        Ok(Some(Err(e))) => Err(into_auth_error(e)),
        Ok(Some(Ok(line))) => match Command::parse(&line) {
            Ok(Command::Auth(offered)) if secrets_match(&offered, secret) => Ok(()),
            Ok(Command::Auth(_)) => Err(AuthError::Rejected),
            _ => Err(AuthError::UnexpectedCommand(verb(&line).to_string())),
        },
    };

    match outcome {
        Ok(()) => {
            framed.send(CMD_AUTH_OK).await.map_err(into_auth_error)?;
            Ok(())
        }
        Err(e) => {
            // Best effort: the peer may already be gone
            let _ = framed.send(CMD_AUTH_FAILED).await;
            let _ = SinkExt::<String>::close(framed).await;
            Err(e)
        }
    }
}

/// Compare SHA-256 digests in constant time
fn secrets_match(offered: &str, expected: &str) -> bool {
    let a = Sha256::digest(offered.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// First word of a line, so a rejected line never echoes a secret
fn verb(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or_default()
}

fn into_auth_error(e: ProtocolError) -> AuthError {
    match e {
        ProtocolError::Io(io) => AuthError::Io(io),
        other => AuthError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            other.to_string(),
        )),
    }
}
