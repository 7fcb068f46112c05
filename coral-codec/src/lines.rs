//! Canonical wire-level status and error lines.
//!
//! Every user-visible failure maps to one of these RESP lines; the bytes are fixed
//! because clients and test harnesses match on them.

/// `+OK\r\n`.
pub const OK: &[u8] = b"+OK\r\n";
/// `+PONG\r\n`.
pub const PONG: &[u8] = b"+PONG\r\n";

/// User-visible error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    /// Internal failure without a more specific category.
    Unknown,
    /// The routed address is not part of the known topology.
    AddrNotFound,
    /// Command name is not in the table.
    UnknownCommand,
    /// No replicaset currently owns the slot.
    UnknownSlot,
    /// No pool exists for the routed address.
    UnknownProxyPool,
    /// The pool could not produce a usable connection.
    UnknownProxyPoolConn,
    /// MGET reassembly failed.
    UnknownMget,
    /// Request frame exceeds the configured maximum.
    ReqTooLarge,
    /// Assembled response exceeds the configured maximum.
    RspTooLarge,
    /// Argument count violates the command's arity rule.
    WrongArgumentsNumber,
    /// The backend did not answer within the per-request timeout.
    RequestTimeout,
    /// Client AUTH with a password that does not match.
    InvalidPassword,
    /// Client AUTH while the proxy has no password configured.
    NoPasswordSet,
}

impl RespError {
    /// The full RESP line including the CRLF terminator.
    #[must_use]
    pub fn line(self) -> &'static [u8] {
        match self {
            Self::Unknown => b"-ERR unknown error\r\n",
            Self::AddrNotFound => b"-ERR addr not found\r\n",
            Self::UnknownCommand => b"-ERR unknown command\r\n",
            Self::UnknownSlot => b"-ERR unknown slot\r\n",
            Self::UnknownProxyPool => b"-ERR unknown proxy pool\r\n",
            Self::UnknownProxyPoolConn => b"-ERR unknown proxy pool conn\r\n",
            Self::UnknownMget => b"-ERR unknown mget error\r\n",
            Self::ReqTooLarge => b"-ERR req msg length too large\r\n",
            Self::RspTooLarge => b"-ERR rsp msg length too large\r\n",
            Self::WrongArgumentsNumber => b"-ERR wrong number of arguments\r\n",
            Self::RequestTimeout => b"-ERR proxy request timeout\r\n",
            Self::InvalidPassword => b"-ERR invalid password\r\n",
            Self::NoPasswordSet => b"-ERR Client sent AUTH, but no password is set\r\n",
        }
    }

    /// The line without its CRLF, for log output.
    #[must_use]
    pub fn short(self) -> &'static str {
        let line = self.line();
        match core::str::from_utf8(&line[..line.len() - 2]) {
            Ok(text) => text,
            Err(_) => "-ERR unknown error",
        }
    }
}

/// Renders wire bytes for log output: CR and LF become dots so a frame stays on
/// one log line.
#[must_use]
pub fn format_resp_for_log(frame: &[u8]) -> String {
    frame
        .iter()
        .map(|byte| match byte {
            b'\r' | b'\n' => '.',
            byte if byte.is_ascii_graphic() || *byte == b' ' => char::from(*byte),
            _ => '?',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{format_resp_for_log, RespError, OK, PONG};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn status_lines_are_terminated() {
        assert_that!(OK, eq(b"+OK\r\n"));
        assert_that!(PONG, eq(b"+PONG\r\n"));
    }

    #[rstest]
    #[case(RespError::RequestTimeout, "-ERR proxy request timeout")]
    #[case(RespError::UnknownSlot, "-ERR unknown slot")]
    #[case(
        RespError::NoPasswordSet,
        "-ERR Client sent AUTH, but no password is set"
    )]
    fn short_drops_only_the_terminator(#[case] error: RespError, #[case] expect: &str) {
        assert_that!(error.short(), eq(expect));
        assert_that!(error.line().len(), eq(expect.len() + 2));
    }

    #[rstest]
    fn log_rendering_flattens_line_breaks() {
        assert_that!(
            format_resp_for_log(b"*2\r\n$3\r\nget\r\n$3\r\nFoo\r\n"),
            eq("*2..$3..get..$3..Foo..")
        );
        assert_that!(format_resp_for_log(b"\x01ok"), eq("?ok"));
    }
}
