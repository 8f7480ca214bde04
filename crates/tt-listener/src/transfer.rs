//! File transfer initiator
//!
//! Uploads are a `START_UPLOAD`, one `UPLOAD_CHUNK` per compressed piece of
//! the local file, then `END_UPLOAD`; each step must be acknowledged with
//! `OK`. A download is a single `DOWNLOAD` answered by `DATA <hex>`.
//! Failures are reported to the caller and never close the session.

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use tt_core::error::TransferError;
use tt_core::traits::CommandChannel;
use tt_protocol::constants::{CHUNK_SIZE, DATA_PREFIX, REPLY_ERROR, REPLY_OK, RESPONSE_TIMEOUT};
use tt_protocol::{decode_payload, encode_payload, strip_terminator, Command, ProtocolError};

/// Upload tuning
#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    /// Source bytes per chunk, before compression
    pub chunk_size: usize,
    /// Wait for each acknowledgement
    pub timeout: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            timeout: RESPONSE_TIMEOUT,
        }
    }
}

/// What a completed upload sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub bytes: u64,
    pub chunks: u64,
}

/// Upload `local` to `remote` on `peer`, stopping at the first failed step
pub async fn upload_file<C>(
    channel: &C,
    peer: &str,
    local: &Path,
    remote: &str,
    options: &UploadOptions,
) -> Result<UploadReport, TransferError>
where
    C: CommandChannel + ?Sized,
{
    let local_io = |source| TransferError::LocalIo {
        path: local.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::open(local).await.map_err(local_io)?;

    let start = Command::StartUpload(remote.to_string());
    let reply = step(channel, peer, &start, "START_UPLOAD", options.timeout).await?;
    expect_ok("START_UPLOAD", reply)?;

    let mut buf = vec![0u8; options.chunk_size.max(1)];
    let mut report = UploadReport::default();
    loop {
        let n = read_chunk(&mut file, &mut buf).await.map_err(local_io)?;
        if n == 0 {
            break;
        }

        let chunk = Command::UploadChunk(encode_payload(&buf[..n])?);
        let reply = step(channel, peer, &chunk, "UPLOAD_CHUNK", options.timeout).await?;
        expect_ok("UPLOAD_CHUNK", reply)?;

        report.bytes += n as u64;
        report.chunks += 1;
        tracing::debug!(
            "Uploaded chunk {} ({} bytes, {} total) to {}",
            report.chunks,
            n,
            report.bytes,
            peer
        );
        if n < buf.len() {
            break;
        }
    }

    let reply = step(channel, peer, &Command::EndUpload, "END_UPLOAD", options.timeout).await?;
    expect_ok("END_UPLOAD", reply)?;

    tracing::info!(
        "Uploaded {:?} to {}:{} ({} bytes in {} chunks)",
        local,
        peer,
        remote,
        report.bytes,
        report.chunks
    );
    Ok(report)
}

/// Download `remote` from `peer` into `local`. Parent directories of
/// `local` are not created. Returns the number of bytes written.
pub async fn download_file<C>(
    channel: &C,
    peer: &str,
    remote: &str,
    local: &Path,
    timeout: Duration,
) -> Result<u64, TransferError>
where
    C: CommandChannel + ?Sized,
{
    let request = Command::Download(remote.to_string());
    let reply = step(channel, peer, &request, "DOWNLOAD", timeout).await?;

    let Some(hex) = reply.strip_prefix(DATA_PREFIX) else {
        if reply.starts_with(REPLY_ERROR) {
            return Err(TransferError::Rejected {
                step: "DOWNLOAD",
                reply,
            });
        }
        return Err(ProtocolError::UnexpectedResponse(reply).into());
    };

    let data = decode_payload(hex.trim())?;
    tokio::fs::write(local, &data)
        .await
        .map_err(|source| TransferError::LocalIo {
            path: local.to_path_buf(),
            source,
        })?;

    tracing::info!(
        "Downloaded {}:{} to {:?} ({} bytes)",
        peer,
        remote,
        local,
        data.len()
    );
    Ok(data.len() as u64)
}

/// Send one step and return its reply without the terminator
async fn step<C>(
    channel: &C,
    peer: &str,
    command: &Command,
    name: &'static str,
    timeout: Duration,
) -> Result<String, TransferError>
where
    C: CommandChannel + ?Sized,
{
    let channel_err = |source| TransferError::Channel { step: name, source };
    channel
        .send(peer, &command.to_line())
        .map_err(channel_err)?;
    let response = channel
        .await_response(peer, timeout)
        .await
        .map_err(channel_err)?;
    Ok(strip_terminator(&response).to_string())
}

fn expect_ok(name: &'static str, reply: String) -> Result<(), TransferError> {
    if reply == REPLY_OK {
        Ok(())
    } else {
        Err(TransferError::Rejected { step: name, reply })
    }
}

/// Fill `buf` unless the file ends first
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
