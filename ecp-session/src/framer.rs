//! Line framing over a raw byte stream
//!
//! ECP is newline-terminated ASCII. Devices differ in the terminator they
//! send (CR, LF or CRLF), so both CR and LF end a line and the empty lines
//! produced by CRLF pairs are skipped.

use bytes::{Buf, BytesMut};
use ecp_core::{EcpError, EcpResult};

/// Default bound on a single line
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Reassembles protocol lines from arbitrarily chunked input
///
/// Bytes are appended with [`LineFramer::extend`] and complete lines are
/// pulled with [`LineFramer::next_line`] (or the [`LineFramer::lines`]
/// iterator). Incomplete trailing data stays buffered until the next chunk.
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    max_line_length: usize,
}

impl LineFramer {
    /// Create a framer that rejects lines longer than `max_line_length` bytes
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_line_length.min(4096)),
            max_line_length,
        }
    }

    /// Append a chunk received from the transport
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pull the next complete line, terminator stripped
    ///
    /// # Returns
    /// - `None` when no complete line is buffered
    /// - `Some(Err(EcpError::Framing))` when a line exceeds the configured
    ///   maximum; the offending bytes are discarded
    pub fn next_line(&mut self) -> Option<EcpResult<String>> {
        loop {
            let Some(end) = self.buffer.iter().position(|&b| b == CR || b == LF) else {
                if self.buffer.len() > self.max_line_length {
                    let len = self.buffer.len();
                    self.buffer.clear();
                    return Some(Err(self.too_long(len)));
                }
                return None;
            };

            let line = self.buffer.split_to(end);
            self.buffer.advance(1);
            if line.is_empty() {
                continue;
            }
            if line.len() > self.max_line_length {
                return Some(Err(self.too_long(line.len())));
            }
            return Some(Ok(String::from_utf8_lossy(&line).into_owned()));
        }
    }

    /// Iterate over the complete lines currently buffered
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { framer: self }
    }

    /// Emit the unterminated remainder as a line
    ///
    /// Used at datagram boundaries, where the end of the datagram also ends
    /// the line.
    pub fn flush_partial(&mut self) -> Option<EcpResult<String>> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = self.buffer.split();
        if line.len() > self.max_line_length {
            return Some(Err(self.too_long(line.len())));
        }
        Some(Ok(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Drop any buffered bytes
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of buffered bytes not yet returned as a line
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn too_long(&self, len: usize) -> EcpError {
        EcpError::Framing(format!(
            "line of {} bytes exceeds maximum of {}",
            len, self.max_line_length
        ))
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

/// Lazy iterator over complete buffered lines
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = EcpResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(framer: &mut LineFramer) -> Vec<String> {
        framer.lines().map(|l| l.unwrap()).collect()
    }

    #[test]
    fn test_lines_simple() {
        let mut framer = LineFramer::default();
        framer.extend(b"RA12=-20\r#7=3\r");
        assert_eq!(collect(&mut framer), vec!["RA12=-20", "#7=3"]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_lines_split() {
        let mut framer = LineFramer::default();
        framer.extend(b"RA1");
        assert!(framer.next_line().is_none());
        framer.extend(b"2=-20\r");
        assert_eq!(collect(&mut framer), vec!["RA12=-20"]);
    }

    #[test]
    fn test_crlf_split_across_chunks() {
        let mut framer = LineFramer::default();
        framer.extend(b"ACK\r");
        assert_eq!(collect(&mut framer), vec!["ACK"]);
        framer.extend(b"\nNAK\r\n");
        assert_eq!(collect(&mut framer), vec!["NAK"]);
    }

    #[test]
    fn test_every_chunking_yields_same_lines() {
        let stream: &[u8] = b"RA12=-20\r\n#7=3\r#00001=65535\n\rERR 3 unknown\r\nACK\r";
        let expected = vec!["RA12=-20", "#7=3", "#00001=65535", "ERR 3 unknown", "ACK"];

        for first in 0..=stream.len() {
            for second in first..=stream.len() {
                let mut framer = LineFramer::default();
                let mut lines = Vec::new();
                for chunk in [&stream[..first], &stream[first..second], &stream[second..]] {
                    framer.extend(chunk);
                    lines.extend(collect(&mut framer));
                }
                assert_eq!(lines, expected, "split at {} and {}", first, second);
            }
        }

        let mut framer = LineFramer::default();
        let mut lines = Vec::new();
        for byte in stream {
            framer.extend(std::slice::from_ref(byte));
            lines.extend(collect(&mut framer));
        }
        assert_eq!(lines, expected);
    }

    #[test]
    fn test_line_too_long() {
        let mut framer = LineFramer::new(8);
        framer.extend(b"123456789");
        assert!(matches!(framer.next_line(), Some(Err(EcpError::Framing(_)))));
        assert_eq!(framer.buffered(), 0);

        framer.extend(b"123456789\rACK\r");
        assert!(matches!(framer.next_line(), Some(Err(EcpError::Framing(_)))));
        assert_eq!(framer.next_line().unwrap().unwrap(), "ACK");
    }

    #[test]
    fn test_flush_partial() {
        let mut framer = LineFramer::default();
        framer.extend(b"#00001=00000\r#00001=65535");
        assert_eq!(collect(&mut framer), vec!["#00001=00000"]);
        assert_eq!(framer.flush_partial().unwrap().unwrap(), "#00001=65535");
        assert!(framer.flush_partial().is_none());
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut framer = LineFramer::default();
        framer.extend(b"RA1");
        framer.reset();
        framer.extend(b"ACK\r");
        assert_eq!(collect(&mut framer), vec!["ACK"]);
    }
}
