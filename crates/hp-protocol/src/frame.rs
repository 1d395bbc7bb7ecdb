//! Line framing for the appliance protocol
//!
//! Every request, reply and heartbeat on the telnet-style link ends with
//! `\r\n`. Frames are forwarded byte-for-byte; only the analysis side
//! strips the terminator and decodes the payload (as Latin-1, since
//! parameter names carry accented characters).

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::ProtocolError;

/// Line terminator used by both peers
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Upper bound for a single unterminated line.
///
/// `$daq desc` replies are the longest frames seen on the link and stay well
/// below this.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Offset just past the first `\n` in `buf`, if any
pub fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| *b == b'\n').map(|i| i + 1)
}

/// Strip any trailing `\r` / `\n` bytes
pub fn trim_terminator(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &line[..end]
}

/// Decode bytes as Latin-1 (every byte maps to one char, never fails)
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Build a terminated request line from a command string
pub fn request_line(command: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(command.len() + LINE_TERMINATOR.len());
    buf.extend_from_slice(trim_terminator(command.as_bytes()));
    buf.extend_from_slice(LINE_TERMINATOR);
    buf.freeze()
}

/// Codec splitting a byte stream into terminated lines.
///
/// Yielded items keep their terminator so they can be relayed verbatim.
#[derive(Debug)]
pub struct LineCodec {
    /// Where to resume scanning for `\n` on the next call
    next_index: usize,
    /// Maximum length of an unterminated line
    max_length: usize,
}

impl LineCodec {
    /// Create a codec with the default line limit
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    /// Create a codec with a custom line limit
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let start = self.next_index.min(src.len());
        match find_line_end(&src[start..]) {
            Some(offset) => {
                self.next_index = 0;
                Ok(Some(src.split_to(start + offset).freeze()))
            }
            None => {
                if src.len() > self.max_length {
                    return Err(ProtocolError::LineTooLong {
                        size: src.len(),
                        max: self.max_length,
                    });
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        // A peer may close right after an unterminated command; relay what we have
        self.next_index = 0;
        if src.is_empty() {
            Ok(None)
        } else {
            Ok(Some(src.split().freeze()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"$login token\r\n"[..]);

        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line.as_ref(), b"$login token\r\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_read() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"$par get"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b" PR001\r\n$info\r\n");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.as_ref(), b"$par get PR001\r\n");
        assert_eq!(second.as_ref(), b"$info\r\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_line_too_long() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);

        let result = codec.decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::LineTooLong { size: 10, max: 8 })
        ));
    }

    #[test]
    fn test_decode_eof_flushes_unterminated() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"$uptime"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        let last = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(last.as_ref(), b"$uptime");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_trim_and_decode_latin1() {
        assert_eq!(trim_terminator(b"$ack\r\n"), b"$ack");
        assert_eq!(trim_terminator(b"\r\n"), b"");
        assert_eq!(decode_latin1(b"R\xe9duire"), "Réduire");
    }

    #[test]
    fn test_request_line_adds_terminator_once() {
        assert_eq!(request_line("$par get 4").as_ref(), b"$par get 4\r\n");
        assert_eq!(request_line("$par get 4\r\n").as_ref(), b"$par get 4\r\n");
    }
}
