//! Short-lived blocking client for node verification and health probing.
//!
//! This client never sits on the request path: it backs the per-node `INFO`
//! round-trip during topology refresh and the periodic health PING. Blocking I/O
//! with hard timeouts keeps it simple.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use coral_codec::{parse_len, CodecError, RespCursor};
use coral_common::error::{ProxyError, ProxyResult};

/// One decoded reply from the probed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReply {
    /// `+...` status payload without the sigil.
    Status(String),
    /// `-...` error payload without the sigil.
    Error(String),
    /// `:<n>` integer.
    Integer(i64),
    /// `$<len>` bulk; `None` is the nil bulk.
    Bulk(Option<Vec<u8>>),
    /// `*<len>` array of nested replies.
    Array(Vec<ProbeReply>),
}

/// `INFO` fields the topology refresh cares about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoSummary {
    /// `redis_version`.
    pub version: String,
    /// `loading` — replica still loading its dataset.
    pub loading: bool,
    /// `master_link_status` — `up` when the replica tracks its master.
    pub master_link_status: String,
}

/// Blocking probe connection with connect/read/write timeouts.
#[derive(Debug)]
pub struct ProbeClient {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl ProbeClient {
    /// Dials `addr` and authenticates when a password is configured.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Io` on resolution/dial/timeout failures and
    /// `ProxyError::Protocol` when AUTH is rejected.
    pub fn connect(
        addr: &str,
        password: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> ProxyResult<Self> {
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|error| ProxyError::Io(format!("resolve {addr} failed: {error}")))?
            .next()
            .ok_or_else(|| ProxyError::Io(format!("resolve {addr} returned no address")))?;
        let stream = TcpStream::connect_timeout(&socket_addr, connect_timeout)
            .map_err(|error| ProxyError::Io(format!("dial {addr} failed: {error}")))?;
        stream
            .set_read_timeout(Some(io_timeout))
            .map_err(|error| ProxyError::Io(format!("set read timeout failed: {error}")))?;
        stream
            .set_write_timeout(Some(io_timeout))
            .map_err(|error| ProxyError::Io(format!("set write timeout failed: {error}")))?;

        let mut client = Self {
            stream,
            buffer: Vec::new(),
        };
        if !password.is_empty() {
            match client.execute(&[b"auth", password.as_bytes()])? {
                ProbeReply::Status(_) => {}
                other => {
                    return Err(ProxyError::Protocol(format!(
                        "auth rejected by {addr}: {other:?}"
                    )));
                }
            }
        }
        Ok(client)
    }

    /// Sends `PING` and verifies the `+PONG` answer.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Protocol` on any other reply, `ProxyError::Io` on I/O failure.
    pub fn ping(&mut self) -> ProxyResult<()> {
        match self.execute(&[b"ping"])? {
            ProbeReply::Status(status) if status == "PONG" => Ok(()),
            other => Err(ProxyError::Protocol(format!("unexpected ping reply: {other:?}"))),
        }
    }

    /// Sends `INFO` and extracts the fields used by topology verification.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Protocol` when the reply is not a bulk payload.
    pub fn info(&mut self) -> ProxyResult<InfoSummary> {
        match self.execute(&[b"info"])? {
            ProbeReply::Bulk(Some(payload)) => Ok(parse_info(&payload)),
            other => Err(ProxyError::Protocol(format!("unexpected info reply: {other:?}"))),
        }
    }

    /// Writes one command as a RESP array and reads its reply.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Io` on socket failure, `ProxyError::Protocol` on framing errors.
    pub fn execute(&mut self, args: &[&[u8]]) -> ProxyResult<ProbeReply> {
        let mut frame = Vec::with_capacity(32);
        frame.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            frame.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            frame.extend_from_slice(arg);
            frame.extend_from_slice(b"\r\n");
        }
        self.stream
            .write_all(&frame)
            .map_err(|error| ProxyError::Io(format!("probe write failed: {error}")))?;
        self.read_reply()
    }

    fn read_reply(&mut self) -> ProxyResult<ProbeReply> {
        let mut chunk = [0_u8; 4096];
        loop {
            {
                let mut cursor = RespCursor::new(&self.buffer);
                match read_probe_reply(&mut cursor) {
                    Ok(reply) => {
                        let consumed = cursor.read_size();
                        let _ = self.buffer.drain(..consumed);
                        return Ok(reply);
                    }
                    Err(
                        CodecError::EmptyLine | CodecError::ShortLine | CodecError::LfNotFound,
                    ) => {}
                    Err(error) => {
                        return Err(ProxyError::Protocol(format!("probe reply invalid: {error}")));
                    }
                }
            }
            let read_len = self
                .stream
                .read(&mut chunk)
                .map_err(|error| ProxyError::Io(format!("probe read failed: {error}")))?;
            if read_len == 0 {
                return Err(ProxyError::Io("probe peer closed".to_owned()));
            }
            self.buffer.extend_from_slice(&chunk[..read_len]);
        }
    }
}

fn read_probe_reply(cursor: &mut RespCursor<'_>) -> Result<ProbeReply, CodecError> {
    let line = cursor.read_line()?;
    if line.is_empty() {
        return Err(CodecError::BadLine);
    }
    match line[0] {
        b'+' => Ok(ProbeReply::Status(
            String::from_utf8_lossy(&line[1..]).into_owned(),
        )),
        b'-' => Ok(ProbeReply::Error(
            String::from_utf8_lossy(&line[1..]).into_owned(),
        )),
        b':' => {
            let text = core::str::from_utf8(&line[1..]).map_err(|_| CodecError::InvalidResp)?;
            text.parse()
                .map(ProbeReply::Integer)
                .map_err(|_| CodecError::InvalidResp)
        }
        b'$' => {
            let len = parse_len(&line[1..])?;
            if len < 0 {
                return Ok(ProbeReply::Bulk(None));
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let payload = cursor.read_n(len as usize)?.to_vec();
            let crlf = cursor.read_n(2)?;
            if crlf != b"\r\n" {
                return Err(CodecError::BadLine);
            }
            Ok(ProbeReply::Bulk(Some(payload)))
        }
        b'*' => {
            let len = parse_len(&line[1..])?;
            if len < 0 {
                return Ok(ProbeReply::Array(Vec::new()));
            }
            let mut items = Vec::with_capacity(len.unsigned_abs() as usize);
            for _ in 0..len {
                items.push(read_probe_reply(cursor)?);
            }
            Ok(ProbeReply::Array(items))
        }
        _ => Err(CodecError::InvalidResp),
    }
}

/// Extracts the verification fields from an `INFO` payload.
#[must_use]
pub fn parse_info(payload: &[u8]) -> InfoSummary {
    let mut summary = InfoSummary::default();
    let text = String::from_utf8_lossy(payload);
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("redis_version:") {
            summary.version = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("loading:") {
            summary.loading = value.trim() != "0";
        } else if let Some(value) = line.strip_prefix("master_link_status:") {
            summary.master_link_status = value.trim().to_owned();
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::{parse_info, read_probe_reply, ProbeReply};
    use coral_codec::RespCursor;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn parse_info_extracts_verification_fields() {
        let payload = b"# Server\r\nredis_version:6.2.14\r\n# Replication\r\nrole:slave\r\nmaster_link_status:up\r\nloading:0\r\n";
        let summary = parse_info(payload);
        assert_that!(summary.version, eq("6.2.14"));
        assert_that!(summary.loading, eq(false));
        assert_that!(summary.master_link_status, eq("up"));
    }

    #[rstest]
    fn parse_info_flags_loading_replicas() {
        let summary = parse_info(b"loading:1\r\nmaster_link_status:down\r\n");
        assert_that!(summary.loading, eq(true));
        assert_that!(summary.master_link_status, eq("down"));
    }

    #[rstest]
    fn probe_reply_reader_handles_scalar_kinds() {
        let mut cursor = RespCursor::new(b"+PONG\r\n");
        assert_that!(
            read_probe_reply(&mut cursor),
            eq(&Ok(ProbeReply::Status("PONG".to_owned())))
        );

        let mut cursor = RespCursor::new(b":42\r\n");
        assert_that!(read_probe_reply(&mut cursor), eq(&Ok(ProbeReply::Integer(42))));

        let mut cursor = RespCursor::new(b"$3\r\nfoo\r\n");
        assert_that!(
            read_probe_reply(&mut cursor),
            eq(&Ok(ProbeReply::Bulk(Some(b"foo".to_vec()))))
        );

        let mut cursor = RespCursor::new(b"$-1\r\n");
        assert_that!(read_probe_reply(&mut cursor), eq(&Ok(ProbeReply::Bulk(None))));
    }

    #[rstest]
    fn probe_reply_reader_handles_nested_arrays() {
        let mut cursor = RespCursor::new(b"*2\r\n$1\r\na\r\n:7\r\n");
        assert_that!(
            read_probe_reply(&mut cursor),
            eq(&Ok(ProbeReply::Array(vec![
                ProbeReply::Bulk(Some(b"a".to_vec())),
                ProbeReply::Integer(7),
            ])))
        );
    }
}
