//! LF-delimited control-line extraction.
//!
//! The pre-READY phase of a tunnel connection speaks a line-oriented text
//! protocol, after which the stream carries opaque payload. [`LineBuffer`]
//! accumulates raw chunks and lets the handshake inspect complete lines one
//! at a time while never discarding bytes after the last line terminator,
//! so the transition out of the control phase loses nothing.
//!
//! A line located with [`LineBuffer::peek_line`] is left in place until the
//! caller decides what to do with it:
//!
//! - [`consume_line`](LineBuffer::consume_line) removes its bytes (liveness
//!   probes that must not reach the payload path)
//! - [`skip_line`](LineBuffer::skip_line) leaves the bytes buffered and moves
//!   the scan cursor past them, so unrecognized data keeps counting against
//!   the buffer cap
//! - [`split_residue`](LineBuffer::split_residue) returns everything after
//!   the line terminator verbatim (the terminal control line)

use bytes::{Bytes, BytesMut};

/// Hard cap on bytes buffered while hunting for a control line.
pub(crate) const MAX_CONTROL_BUFFER: usize = 64 * 1024;

/// Marker returned when a push would exceed [`MAX_CONTROL_BUFFER`].
#[derive(Debug)]
pub(crate) struct Overflow;

#[derive(Clone, Copy)]
struct Span {
    start: usize,
    /// Index one past the line's LF terminator.
    end: usize,
}

/// Accumulates byte chunks and yields complete LF-terminated lines.
pub(crate) struct LineBuffer {
    buf: BytesMut,
    /// Bytes before `scan` hold lines already inspected and left in place.
    scan: usize,
    /// The line most recently located by `peek_line`.
    pending: Option<Span>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            scan: 0,
            pending: None,
        }
    }

    /// Appends a chunk, failing if the buffered total would exceed the cap.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<(), Overflow> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > MAX_CONTROL_BUFFER {
            return Err(Overflow);
        }
        Ok(())
    }

    /// Locates the next complete line at the scan cursor.
    ///
    /// Returns the line text trimmed of surrounding whitespace, without
    /// consuming anything. Returns `None` when no full line is buffered yet.
    pub(crate) fn peek_line(&mut self) -> Option<String> {
        let rel = self.buf[self.scan..].iter().position(|&b| b == b'\n')?;
        let span = Span {
            start: self.scan,
            end: self.scan + rel + 1,
        };
        self.pending = Some(span);
        let text = String::from_utf8_lossy(&self.buf[span.start..span.end - 1]);
        Some(text.trim().to_string())
    }

    /// Removes the peeked line's bytes from the buffer.
    pub(crate) fn consume_line(&mut self) {
        if let Some(Span { start, end }) = self.pending.take() {
            let tail = self.buf.split_off(end);
            self.buf.truncate(start);
            self.buf.unsplit(tail);
            self.scan = start;
        }
    }

    /// Leaves the peeked line buffered and advances the scan cursor past it.
    pub(crate) fn skip_line(&mut self) {
        if let Some(Span { end, .. }) = self.pending.take() {
            self.scan = end;
        }
    }

    /// Returns every byte after the peeked line's terminator, verbatim.
    pub(crate) fn split_residue(&mut self) -> Bytes {
        match self.pending.take() {
            Some(Span { end, .. }) => self.buf.split_off(end).freeze(),
            None => Bytes::new(),
        }
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_across_chunks() {
        let mut lines = LineBuffer::new();
        lines.push(b"REA").unwrap();
        assert!(lines.peek_line().is_none());
        lines.push(b"DY\n").unwrap();
        assert_eq!(lines.peek_line().as_deref(), Some("READY"));
    }

    #[test]
    fn test_trims_surrounding_whitespace() {
        let mut lines = LineBuffer::new();
        lines.push(b"  PING\r\n").unwrap();
        assert_eq!(lines.peek_line().as_deref(), Some("PING"));
    }

    #[test]
    fn test_consume_removes_bytes() {
        let mut lines = LineBuffer::new();
        lines.push(b"PING\nREADY\ntail").unwrap();
        assert_eq!(lines.peek_line().as_deref(), Some("PING"));
        lines.consume_line();
        assert_eq!(lines.buffered(), b"READY\ntail".len());
        assert_eq!(lines.peek_line().as_deref(), Some("READY"));
        assert_eq!(&lines.split_residue()[..], b"tail");
    }

    #[test]
    fn test_skip_keeps_bytes_buffered() {
        let mut lines = LineBuffer::new();
        lines.push(b"noise\nREADY\n").unwrap();
        assert_eq!(lines.peek_line().as_deref(), Some("noise"));
        lines.skip_line();
        assert_eq!(lines.buffered(), b"noise\nREADY\n".len());
        assert_eq!(lines.peek_line().as_deref(), Some("READY"));
    }

    #[test]
    fn test_residue_empty_when_nothing_follows() {
        let mut lines = LineBuffer::new();
        lines.push(b"READY\n").unwrap();
        assert_eq!(lines.peek_line().as_deref(), Some("READY"));
        assert!(lines.split_residue().is_empty());
    }

    #[test]
    fn test_residue_preserved_verbatim() {
        let mut lines = LineBuffer::new();
        lines.push(b"READY\nGET / HTTP/1.1\r\n").unwrap();
        lines.peek_line();
        assert_eq!(&lines.split_residue()[..], b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_cap_is_exact() {
        let mut lines = LineBuffer::new();
        lines.push(&vec![b'x'; MAX_CONTROL_BUFFER]).unwrap();
        assert!(lines.push(b"y").is_err());
    }

    #[test]
    fn test_consumed_lines_free_cap_space() {
        let mut lines = LineBuffer::new();
        lines.push(&vec![b'p'; MAX_CONTROL_BUFFER - 1]).unwrap();
        lines.push(b"\n").unwrap();
        lines.peek_line();
        lines.consume_line();
        assert_eq!(lines.buffered(), 0);
        lines.push(&vec![b'x'; MAX_CONTROL_BUFFER]).unwrap();
    }
}
