//! Compress-then-hex payload codec
//!
//! File-transfer payloads travel as gzip streams rendered in lowercase hex so
//! they fit on a single protocol line. PTY and tunnel bytes are hex only.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::ProtocolError;
use crate::pool::BufferPool;

/// Gzip `data` and render the compressed stream as hex
pub fn encode_payload(data: &[u8]) -> Result<String, ProtocolError> {
    let mut buf = BufferPool::global().get();
    let mut encoder = GzEncoder::new(&mut *buf, Compression::default());
    encoder.write_all(data).map_err(ProtocolError::Compress)?;
    encoder.finish().map_err(ProtocolError::Compress)?;
    Ok(hex::encode(buf.as_slice()))
}

/// Reverse of [`encode_payload`].
///
/// Fails with [`ProtocolError::InvalidHex`] on non-hex input and with
/// [`ProtocolError::Decompress`] when the bytes are not a gzip stream.
pub fn decode_payload(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let compressed = hex::decode(text.trim())?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(ProtocolError::Decompress)?;
    Ok(out)
}

/// Hex-encode raw bytes (PTY and tunnel traffic)
pub fn encode_raw(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decode raw hex bytes (PTY and tunnel traffic)
pub fn decode_raw(text: &str) -> Result<Vec<u8>, ProtocolError> {
    Ok(hex::decode(text.trim())?)
}
