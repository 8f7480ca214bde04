//! Tokio codec for newline-delimited control lines

use std::cmp;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::MAX_BUFFER_SIZE;
use crate::error::ProtocolError;

/// Splits a byte stream into lines.
///
/// A line longer than `max_length` is discarded up to its newline instead of
/// failing the stream, so a misbehaving peer costs data, not the connection.
/// Invalid UTF-8 is replaced rather than rejected.
#[derive(Debug)]
pub struct LineCodec {
    /// Longest line kept, excluding the newline
    max_length: usize,
    /// Bytes already scanned for a newline
    next_index: usize,
    /// Dropping the tail of an oversized line
    discarding: bool,
    /// Lines dropped for exceeding `max_length`
    discarded: u64,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_BUFFER_SIZE)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
            discarded: 0,
        }
    }

    /// Number of oversized lines dropped so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = cmp::min(self.max_length.saturating_add(1), src.len());
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    src.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = src.split_to(end + 1);
                    return Ok(Some(to_line(&line[..end])));
                }
                (false, None) if src.len() > self.max_length => {
                    tracing::warn!(
                        "Discarding line longer than {} bytes",
                        self.max_length
                    );
                    self.discarding = true;
                    self.discarded += 1;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if self.discarding || src.is_empty() {
            src.clear();
            self.next_index = 0;
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        self.next_index = 0;
        Ok(Some(to_line(&rest)))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = line.as_ref();
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_lines() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING\r\nls -la\npartial");

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("ls -la"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b" line\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("partial line")
        );
    }

    #[test]
    fn test_oversized_line_is_dropped_not_fatal() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from("0123456789abcdef");

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.discarded(), 1);

        buf.extend_from_slice(b"more junk\nOK\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("OK"));
        assert_eq!(codec.discarded(), 1);
    }

    #[test]
    fn test_decode_eof_flushes_tail() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("last words");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap().as_deref(),
            Some("last words")
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"caf\xe9\n"[..]);
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert!(line.starts_with("caf"));
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("PONG", &mut buf).unwrap();
        codec.encode(String::from("exit"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PONG\nexit\n");
    }
}
