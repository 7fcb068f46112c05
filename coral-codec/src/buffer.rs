//! In-place cursor over one readiness-event byte view.
//!
//! The cursor borrows the read slice the event loop hands to the codecs and never
//! allocates; consumed bytes are tracked by an offset so the caller can discard
//! exactly what a successful parse used.

use thiserror::Error;

/// Codec-internal steering errors.
///
/// None of these are user visible. They tell the event loop whether to wait for
/// more bytes, close the connection, or re-route a fragment.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// No unread bytes where at least one was required.
    #[error("empty line")]
    EmptyLine,
    /// Fewer unread bytes than requested.
    #[error("short line")]
    ShortLine,
    /// A LF arrived without the CR before it.
    #[error("there is no \\r")]
    CrNotFound,
    /// No line terminator in the unread bytes.
    #[error("there is no \\n")]
    LfNotFound,
    /// Structurally invalid line inside a reply.
    #[error("bad response line")]
    BadLine,
    /// Byte stream violates RESP framing.
    #[error("invalid resp")]
    InvalidResp,
    /// Frame is not complete yet; retry after the next readiness event.
    #[error("incomplete packet")]
    Incomplete,
    /// Current fragment finished but its message is still waiting on siblings.
    #[error("continue")]
    Continue,
    /// Backend answered with a MOVED/ASK redirection.
    #[error("moved or ask")]
    MovedOrAsk,
    /// Initialization prelude got an unexpected reply.
    #[error("invalid initializing")]
    InvalidInitializing,
}

/// Zero-copy read cursor over a borrowed byte slice.
#[derive(Debug)]
pub struct RespCursor<'a> {
    buf: &'a [u8],
    read: usize,
}

impl<'a> RespCursor<'a> {
    /// Wraps one readiness-event view.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, read: 0 }
    }

    /// Whether the view holds no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total number of bytes in the view.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.buf.len()
    }

    /// Number of bytes consumed so far.
    #[must_use]
    pub fn read_size(&self) -> usize {
        self.read
    }

    /// Bytes consumed so far, from the start of the view.
    #[must_use]
    pub fn read_buf(&self) -> &'a [u8] {
        &self.buf[..self.read]
    }

    /// The whole backing view, consumed or not.
    #[must_use]
    pub fn peek_all(&self) -> &'a [u8] {
        self.buf
    }

    fn left_size(&self) -> usize {
        self.buf.len() - self.read
    }

    fn left_buf(&self) -> &'a [u8] {
        &self.buf[self.read..]
    }

    /// Consumes exactly `n` bytes.
    ///
    /// # Errors
    ///
    /// `EmptyLine` when nothing is unread, `ShortLine` when fewer than `n` bytes remain.
    pub fn read_n(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.left_size() < 1 {
            return Err(CodecError::EmptyLine);
        }
        if n > self.left_size() {
            return Err(CodecError::ShortLine);
        }
        let start = self.read;
        self.read += n;
        Ok(&self.buf[start..self.read])
    }

    /// Returns the next `n` bytes without consuming them.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RespCursor::read_n`].
    pub fn peek_n(&self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.left_size() < 1 {
            return Err(CodecError::EmptyLine);
        }
        if n > self.left_size() {
            return Err(CodecError::ShortLine);
        }
        Ok(&self.buf[self.read..self.read + n])
    }

    /// Consumes one CRLF-terminated line and returns it without the terminator.
    ///
    /// # Errors
    ///
    /// `EmptyLine` when nothing is unread or the line has no payload, `LfNotFound`
    /// when the terminator has not arrived yet, `CrNotFound` when a bare LF shows up.
    pub fn read_line(&mut self) -> Result<&'a [u8], CodecError> {
        if self.left_size() < 1 {
            return Err(CodecError::EmptyLine);
        }
        let Some(idx) = self.left_buf().iter().position(|byte| *byte == b'\n') else {
            return Err(CodecError::LfNotFound);
        };
        let line = self.read_n(idx + 1)?;
        if idx < 2 {
            return Err(CodecError::EmptyLine);
        }
        if line[idx - 1] != b'\r' {
            return Err(CodecError::CrNotFound);
        }
        Ok(&line[..line.len() - 2])
    }
}

#[cfg(test)]
mod tests {
    use super::{CodecError, RespCursor};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn read_line_strips_terminator_and_advances() {
        let mut cursor = RespCursor::new(b"*1\r\n$4\r\nping\r\n");
        assert_that!(cursor.read_line(), eq(Ok(b"*1".as_slice())));
        assert_that!(cursor.read_size(), eq(4));
        assert_that!(cursor.read_line(), eq(Ok(b"$4".as_slice())));
        assert_that!(cursor.read_line(), eq(Ok(b"ping".as_slice())));
        assert_that!(cursor.read_size(), eq(14));
    }

    #[rstest]
    #[case(b"+OK".as_slice(), CodecError::LfNotFound)]
    #[case(b"+OK\r".as_slice(), CodecError::LfNotFound)]
    #[case(b"+OK\n".as_slice(), CodecError::CrNotFound)]
    #[case(b"".as_slice(), CodecError::EmptyLine)]
    #[case(b"\r\n".as_slice(), CodecError::EmptyLine)]
    fn read_line_reports_framing_problems(#[case] input: &[u8], #[case] expect: CodecError) {
        let mut cursor = RespCursor::new(input);
        assert_that!(cursor.read_line(), eq(Err(expect)));
    }

    #[rstest]
    fn read_n_consumes_and_bounds_checks() {
        let mut cursor = RespCursor::new(b"abcdef");
        assert_that!(cursor.read_n(4), eq(Ok(b"abcd".as_slice())));
        assert_that!(cursor.read_n(3), eq(Err(CodecError::ShortLine)));
        assert_that!(cursor.read_n(2), eq(Ok(b"ef".as_slice())));
        assert_that!(cursor.read_n(1), eq(Err(CodecError::EmptyLine)));
    }

    #[rstest]
    fn peek_n_does_not_advance() {
        let cursor = RespCursor::new(b"xyz");
        assert_that!(cursor.peek_n(2), eq(Ok(b"xy".as_slice())));
        assert_that!(cursor.read_size(), eq(0));
    }
}
