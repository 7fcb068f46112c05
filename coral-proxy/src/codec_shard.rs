//! Shard-side RESP decoder: backend replies → fragment completion → message
//! aggregation.
//!
//! Replies match fragments purely by order: the write path guarantees FIFO per
//! shard connection, so the head of `in_frag_queue` is always the owner of the
//! next decoded reply.

use coral_cluster::key_slot;
use coral_codec::command::ReplyKind;
use coral_codec::lines::{RespError, OK};
use coral_codec::{parse_len, CodecError, RespCursor};

use crate::message::MsgRef;

/// Outcome of feeding bytes to a connection that is still running its prelude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Every expected `+OK` arrived; `consumed` bytes belong to the prelude.
    Initialized {
        /// Prelude bytes to discard.
        consumed: usize,
    },
    /// The backend rejected our credentials; the engine must shut down.
    AuthFatal,
}

/// Shard-side decoder parameterized by the frame-size limit.
#[derive(Debug, Clone, Copy)]
pub struct ShardCodec {
    /// Maximum accepted reply frame length in bytes.
    pub msg_max_length: usize,
}

impl ShardCodec {
    /// Creates a decoder with the configured frame-size limit.
    #[must_use]
    pub fn new(msg_max_length: usize) -> Self {
        Self { msg_max_length }
    }

    /// Consumes the pipelined initialization prelude (`AUTH` and/or `READONLY`).
    ///
    /// # Errors
    ///
    /// `Incomplete` while the `+OK` tokens are still partial,
    /// `InvalidInitializing` on any unexpected payload.
    pub fn decode_initializing(
        &self,
        view: &[u8],
        step: u8,
    ) -> Result<InitOutcome, CodecError> {
        if view.is_empty() {
            return Err(CodecError::Incomplete);
        }
        if step < 1 || step > 2 {
            return Err(CodecError::InvalidInitializing);
        }

        let expected_len = usize::from(step) * OK.len();
        if view.len() >= expected_len && view[..expected_len].chunks(OK.len()).all(|c| c == OK) {
            return Ok(InitOutcome::Initialized {
                consumed: expected_len,
            });
        }

        match view[0] {
            b'-' => {
                let mut cursor = RespCursor::new(view);
                let Ok(line) = cursor.read_line() else {
                    return Err(CodecError::Incomplete);
                };
                if classify_error_line(line).is_auth_fatal() {
                    return Ok(InitOutcome::AuthFatal);
                }
                Err(CodecError::InvalidInitializing)
            }
            b'+' => {
                // A strict prefix of the expected OK run means more bytes are coming.
                let mut expected = Vec::with_capacity(expected_len);
                for _ in 0..step {
                    expected.extend_from_slice(OK);
                }
                if expected.starts_with(view) {
                    Err(CodecError::Incomplete)
                } else {
                    Err(CodecError::InvalidInitializing)
                }
            }
            _ => Err(CodecError::InvalidInitializing),
        }
    }

    /// Decodes one complete top-level reply, returning its kind and length.
    ///
    /// # Errors
    ///
    /// `Incomplete`-class errors while the frame is partial, `InvalidResp` on
    /// framing violations.
    pub fn decode_reply(&self, view: &[u8]) -> Result<(ReplyKind, usize), CodecError> {
        let mut cursor = RespCursor::new(view);
        if cursor.is_empty() {
            return Err(CodecError::Incomplete);
        }
        let kind = read_reply(&mut cursor)?;
        Ok((kind, cursor.read_size()))
    }

    /// Whether a reply body exceeds the configured limit.
    #[must_use]
    pub fn size_too_large(&self, len: usize) -> bool {
        len > self.msg_max_length
    }

    /// MGET aggregation: splice per-fragment entries back into original key order.
    ///
    /// Fails the message with `unknown mget error` when a key cannot be matched to
    /// a sub-reply entry, and with `rsp msg length too large` when the assembled
    /// array exceeds the limit.
    pub fn aggregate_mget(&self, msg: &MsgRef) {
        let mut failure = None;
        {
            let mut inner = msg.borrow_mut();
            inner.done = true;

            let mut rsp = Vec::with_capacity(64);
            rsp.push(b'*');
            rsp.extend_from_slice(inner.keys.len().to_string().as_bytes());
            rsp.extend_from_slice(b"\r\n");

            for key in &inner.keys {
                let slot = key_slot(key);
                let entry = inner.slot_keys.get(&slot).and_then(|keys| {
                    let index = keys.iter().position(|candidate| candidate == key)?;
                    let frag = inner.frags.get(&slot)?;
                    frag.borrow().mget_entries.get(index).cloned()
                });
                match entry {
                    Some(entry) => rsp.extend_from_slice(&entry),
                    None => {
                        failure = Some(RespError::UnknownMget);
                        break;
                    }
                }
            }

            if failure.is_none() {
                if self.size_too_large(rsp.len()) {
                    failure = Some(RespError::RspTooLarge);
                } else {
                    inner.rsp = rsp;
                }
            }
        }
        if let Some(error) = failure {
            msg.borrow_mut().fail(error);
        }
    }

    /// MSET aggregation: `+OK` only when every fragment confirmed.
    pub fn aggregate_mset(&self, msg: &MsgRef) {
        let mut inner = msg.borrow_mut();
        inner.done = true;
        let all_ok = inner.frags.values().all(|frag| frag.borrow().ok);
        if all_ok {
            inner.rsp = OK.to_vec();
        } else {
            drop(inner);
            msg.borrow_mut().fail(RespError::Unknown);
        }
    }

    /// DEL aggregation: sum of per-shard deletion counts.
    pub fn aggregate_del(&self, msg: &MsgRef) {
        let mut inner = msg.borrow_mut();
        inner.done = true;
        inner.rsp = format!(":{}\r\n", inner.del_total).into_bytes();
    }

    /// Single-shard aggregation: the fragment's reply bytes are the answer.
    pub fn aggregate_default(&self, msg: &MsgRef, rsp: &[u8]) {
        if self.size_too_large(rsp.len()) {
            msg.borrow_mut().fail(RespError::RspTooLarge);
            return;
        }
        let mut inner = msg.borrow_mut();
        inner.done = true;
        inner.rsp.clear();
        inner.rsp.extend_from_slice(rsp);
    }
}

/// Recursive RESP reply reader; advances the cursor past one complete reply.
fn read_reply(cursor: &mut RespCursor<'_>) -> Result<ReplyKind, CodecError> {
    let line = cursor.read_line()?;
    if line.is_empty() {
        return Err(CodecError::BadLine);
    }
    match line[0] {
        b'+' => {
            if line.starts_with(b"+OK") {
                Ok(ReplyKind::Ok)
            } else if line.starts_with(b"+PONG") {
                Ok(ReplyKind::Pong)
            } else {
                Ok(ReplyKind::Status)
            }
        }
        b':' => Ok(ReplyKind::Integer),
        b'-' => Ok(classify_error_line(line)),
        b'$' => {
            let len = parse_len(&line[1..])?;
            if len < 0 {
                return Ok(ReplyKind::Bulk);
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let _ = cursor.read_n(len as usize)?;
            let crlf = cursor.read_n(2)?;
            if crlf != b"\r\n" {
                return Err(CodecError::InvalidResp);
            }
            Ok(ReplyKind::Bulk)
        }
        b'*' => {
            let len = parse_len(&line[1..])?;
            for _ in 0..len.max(0) {
                let _ = read_reply(cursor)?;
            }
            Ok(ReplyKind::MultiBulk)
        }
        _ => Err(CodecError::InvalidResp),
    }
}

/// Classifies a `-...` line into the reply kinds the proxy reacts to.
fn classify_error_line(line: &[u8]) -> ReplyKind {
    if line.starts_with(b"-NOAUTH Authentication required") {
        ReplyKind::NeedAuth
    } else if line.starts_with(b"-ERR invalid password") {
        ReplyKind::AuthFailed
    } else if line.starts_with(b"-ERR Client sent AUTH, but no password is set")
        || line.starts_with(
            b"-ERR AUTH <password> called without any password configured for the default user.",
        )
    {
        ReplyKind::NeedNtAuth
    } else if line.starts_with(b"-MOVED") {
        ReplyKind::Moved
    } else if line.starts_with(b"-ASK") {
        ReplyKind::Ask
    } else {
        ReplyKind::Error
    }
}

/// Splits an MGET sub-reply into one RESP entry per requested key.
///
/// Each entry is a complete `$<len>\r\n<payload>\r\n` bulk or the nil marker, so
/// the aggregator can splice entries verbatim.
#[must_use]
pub fn parse_mget_entries(rsp: &[u8]) -> Vec<Vec<u8>> {
    let mut cursor = RespCursor::new(rsp);
    let Ok(header) = cursor.read_line() else {
        return Vec::new();
    };
    if header.is_empty() || header[0] != b'*' {
        return Vec::new();
    }
    let count = parse_len(&header[1..]).unwrap_or(0).max(0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let mut entries = Vec::with_capacity(count as usize);

    loop {
        let Ok(line) = cursor.read_line() else {
            return entries;
        };
        if line.is_empty() {
            return entries;
        }
        let Ok(len) = parse_len(&line[1..]) else {
            return entries;
        };
        if len < 0 {
            let mut entry = Vec::with_capacity(line.len() + 2);
            entry.extend_from_slice(line);
            entry.extend_from_slice(b"\r\n");
            entries.push(entry);
            continue;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let Ok(payload) = cursor.read_n(len as usize) else {
            return entries;
        };
        if cursor.read_n(2).is_err() {
            return entries;
        }
        let mut entry = Vec::with_capacity(line.len() + payload.len() + 4);
        entry.extend_from_slice(line);
        entry.extend_from_slice(b"\r\n");
        entry.extend_from_slice(payload);
        entry.extend_from_slice(b"\r\n");
        entries.push(entry);
    }
}

/// Parses a `:<n>\r\n` integer reply body, zero when malformed.
#[must_use]
pub fn parse_integer_reply(rsp: &[u8]) -> i64 {
    if rsp.len() < 4 || rsp[0] != b':' {
        return 0;
    }
    parse_len(&rsp[1..rsp.len() - 2]).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{parse_integer_reply, parse_mget_entries, InitOutcome, ShardCodec};
    use crate::message::{FragmentPool, MessagePool, MsgRef};
    use coral_cluster::key_slot;
    use coral_codec::command::{CommandKind, ReplyKind};
    use coral_codec::CodecError;
    use googletest::prelude::*;
    use rstest::rstest;

    fn codec() -> ShardCodec {
        ShardCodec::new(64)
    }

    /// Builds a completed MGET message: keys in request order, per-slot reply
    /// entries already parsed into the fragments.
    fn mget_message(keys: &[&[u8]], entries_by_slot: &[(u16, &[&[u8]])]) -> MsgRef {
        let mut messages = MessagePool::new();
        let mut frags = FragmentPool::new();
        let msg = messages.get();
        {
            let mut inner = msg.borrow_mut();
            inner.kind = CommandKind::Mget;
            for key in keys {
                inner.keys.push(key.to_vec());
                inner
                    .slot_keys
                    .entry(key_slot(key))
                    .or_default()
                    .push(key.to_vec());
            }
        }
        for (slot, entries) in entries_by_slot {
            let frag = frags.get();
            {
                let mut frag_inner = frag.borrow_mut();
                frag_inner.mget_entries = entries.iter().map(|entry| entry.to_vec()).collect();
                frag_inner.done = true;
            }
            let _ = msg.borrow_mut().frags.insert(*slot, frag);
        }
        let count = msg.borrow().frags.len();
        msg.borrow_mut().frag_done_count = count;
        msg
    }

    #[rstest]
    fn aggregate_mget_restores_original_key_order() {
        let foo_slot = key_slot(b"Foo");
        let bar_slot = key_slot(b"Bar");
        let msg = mget_message(
            &[b"Foo", b"Bar"],
            &[
                (bar_slot, &[b"$3\r\nbar\r\n".as_slice()]),
                (foo_slot, &[b"$3\r\nfoo\r\n".as_slice()]),
            ],
        );

        codec().aggregate_mget(&msg);
        assert_that!(msg.borrow().done, eq(true));
        assert_that!(
            &msg.borrow().rsp,
            eq(&b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n".to_vec())
        );
    }

    #[rstest]
    fn aggregate_mget_preserves_duplicate_keys() {
        let foo_slot = key_slot(b"Foo");
        let msg = mget_message(
            &[b"Foo", b"Foo"],
            &[(foo_slot, &[b"$3\r\nfoo\r\n".as_slice(), b"$3\r\nfoo\r\n".as_slice()])],
        );

        codec().aggregate_mget(&msg);
        assert_that!(
            &msg.borrow().rsp,
            eq(&b"*2\r\n$3\r\nfoo\r\n$3\r\nfoo\r\n".to_vec())
        );
    }

    #[rstest]
    fn aggregate_mget_without_a_matching_entry_fails() {
        let foo_slot = key_slot(b"Foo");
        let msg = mget_message(&[b"Foo"], &[(foo_slot, &[] as &[&[u8]])]);

        codec().aggregate_mget(&msg);
        assert_that!(
            &msg.borrow().rsp,
            eq(&b"-ERR unknown mget error\r\n".to_vec())
        );
    }

    #[rstest]
    fn aggregate_mget_rejects_oversized_assembly() {
        let foo_slot = key_slot(b"Foo");
        let msg = mget_message(&[b"Foo"], &[(foo_slot, &[b"$3\r\nfoo\r\n".as_slice()])]);

        let tight = ShardCodec::new(4);
        tight.aggregate_mget(&msg);
        assert_that!(
            &msg.borrow().rsp,
            eq(&b"-ERR rsp msg length too large\r\n".to_vec())
        );
    }

    #[rstest]
    fn aggregate_mset_requires_every_fragment_ok() {
        let mut messages = MessagePool::new();
        let mut frags = FragmentPool::new();
        let msg = messages.get();
        msg.borrow_mut().kind = CommandKind::Mset;
        for (slot, ok) in [(1_u16, true), (2_u16, true)] {
            let frag = frags.get();
            frag.borrow_mut().ok = ok;
            frag.borrow_mut().done = true;
            let _ = msg.borrow_mut().frags.insert(slot, frag);
        }
        msg.borrow_mut().frag_done_count = 2;

        codec().aggregate_mset(&msg);
        assert_that!(&msg.borrow().rsp, eq(&b"+OK\r\n".to_vec()));

        let failing = messages.get();
        failing.borrow_mut().kind = CommandKind::Mset;
        let frag = frags.get();
        frag.borrow_mut().ok = false;
        frag.borrow_mut().done = true;
        let _ = failing.borrow_mut().frags.insert(1, frag);
        failing.borrow_mut().frag_done_count = 1;

        codec().aggregate_mset(&failing);
        assert_that!(&failing.borrow().rsp, eq(&b"-ERR unknown error\r\n".to_vec()));
    }

    #[rstest]
    fn aggregate_del_replies_with_the_sum() {
        let mut messages = MessagePool::new();
        let msg = messages.get();
        msg.borrow_mut().kind = CommandKind::Del;
        msg.borrow_mut().del_total = 3;

        codec().aggregate_del(&msg);
        assert_that!(&msg.borrow().rsp, eq(&b":3\r\n".to_vec()));
    }

    #[rstest]
    #[case(b"+OK\r\n".as_slice(), ReplyKind::Ok)]
    #[case(b"+PONG\r\n".as_slice(), ReplyKind::Pong)]
    #[case(b"+QUEUED\r\n".as_slice(), ReplyKind::Status)]
    #[case(b":12\r\n".as_slice(), ReplyKind::Integer)]
    #[case(b"-NOAUTH Authentication required\r\n".as_slice(), ReplyKind::NeedAuth)]
    #[case(b"-ERR invalid password\r\n".as_slice(), ReplyKind::AuthFailed)]
    #[case(
        b"-ERR Client sent AUTH, but no password is set\r\n".as_slice(),
        ReplyKind::NeedNtAuth
    )]
    #[case(b"-MOVED 15495 127.0.0.1:8000\r\n".as_slice(), ReplyKind::Moved)]
    #[case(b"-ASK 15495 127.0.0.1:8000\r\n".as_slice(), ReplyKind::Ask)]
    #[case(b"-ERR wrongtype\r\n".as_slice(), ReplyKind::Error)]
    #[case(b"$1\r\n1\r\n".as_slice(), ReplyKind::Bulk)]
    #[case(b"$-1\r\n".as_slice(), ReplyKind::Bulk)]
    #[case(b"*0\r\n".as_slice(), ReplyKind::MultiBulk)]
    fn decode_reply_classifies_each_kind(#[case] input: &[u8], #[case] expect: ReplyKind) {
        let (kind, consumed) = codec().decode_reply(input).expect("reply must decode");
        assert_that!(kind, eq(expect));
        assert_that!(consumed, eq(input.len()));
    }

    #[rstest]
    fn decode_reply_stops_at_frame_boundary() {
        let (kind, consumed) = codec()
            .decode_reply(b"$1\r\n1\r\n$2")
            .expect("first frame must decode");
        assert_that!(kind, eq(ReplyKind::Bulk));
        assert_that!(consumed, eq(7));

        let (kind, consumed) = codec()
            .decode_reply(b"*1\r\n$3\r\nfoo\r\najfioejfoejaeojf")
            .expect("array frame must decode");
        assert_that!(kind, eq(ReplyKind::MultiBulk));
        assert_that!(consumed, eq(13));
    }

    #[rstest]
    #[case(b"+OK".as_slice(), CodecError::LfNotFound)]
    #[case(b"+OK\r".as_slice(), CodecError::LfNotFound)]
    #[case(b"+OK\n".as_slice(), CodecError::CrNotFound)]
    #[case(b"$1\r\n".as_slice(), CodecError::EmptyLine)]
    #[case(b"$1\r\na".as_slice(), CodecError::EmptyLine)]
    #[case(b"*1\r\n".as_slice(), CodecError::EmptyLine)]
    #[case(b"*1\r\n$2\r\na".as_slice(), CodecError::ShortLine)]
    fn decode_reply_surfaces_partial_frames(#[case] input: &[u8], #[case] expect: CodecError) {
        assert_that!(codec().decode_reply(input), eq(Err(expect)));
    }

    #[rstest]
    fn initializing_consumes_exactly_the_prelude() {
        let outcome = codec()
            .decode_initializing(b"+OK\r\n+OK\r\n+PONG\r\n", 2)
            .expect("two oks must initialize");
        assert_that!(outcome, eq(InitOutcome::Initialized { consumed: 10 }));
    }

    #[rstest]
    fn initializing_waits_for_partial_ok_run() {
        assert_that!(
            codec().decode_initializing(b"+OK\r\n+O", 2),
            eq(Err(CodecError::Incomplete))
        );
    }

    #[rstest]
    fn initializing_detects_fatal_auth_errors() {
        let outcome = codec()
            .decode_initializing(b"-ERR invalid password\r\n", 1)
            .expect("auth error must classify");
        assert_that!(outcome, eq(InitOutcome::AuthFatal));

        let outcome = codec()
            .decode_initializing(b"-NOAUTH Authentication required\r\n", 2)
            .expect("noauth must classify");
        assert_that!(outcome, eq(InitOutcome::AuthFatal));
    }

    #[rstest]
    fn initializing_rejects_unexpected_payload() {
        assert_that!(
            codec().decode_initializing(b"-ERR unknown command\r\n", 1),
            eq(Err(CodecError::InvalidInitializing))
        );
        assert_that!(
            codec().decode_initializing(b":1\r\n", 1),
            eq(Err(CodecError::InvalidInitializing))
        );
        assert_that!(
            codec().decode_initializing(b"+OK\r\n", 3),
            eq(Err(CodecError::InvalidInitializing))
        );
    }

    #[rstest]
    fn mget_entries_split_bulks_and_nils() {
        let entries = parse_mget_entries(b"*3\r\n$3\r\nfoo\r\n$-1\r\n$2\r\nab\r\n");
        assert_that!(entries.len(), eq(3));
        assert_that!(&entries[0], eq(&b"$3\r\nfoo\r\n".to_vec()));
        assert_that!(&entries[1], eq(&b"$-1\r\n".to_vec()));
        assert_that!(&entries[2], eq(&b"$2\r\nab\r\n".to_vec()));
    }

    #[rstest]
    fn mget_entries_keep_binary_payloads_intact() {
        let entries = parse_mget_entries(b"*1\r\n$4\r\na\r\nb\r\n");
        assert_that!(entries.len(), eq(1));
        assert_that!(&entries[0], eq(&b"$4\r\na\r\nb\r\n".to_vec()));
    }

    #[rstest]
    #[case(b":3\r\n".as_slice(), 3)]
    #[case(b":0\r\n".as_slice(), 0)]
    #[case(b"+OK\r\n".as_slice(), 0)]
    fn integer_reply_parse(#[case] input: &[u8], #[case] expect: i64) {
        assert_that!(parse_integer_reply(input), eq(expect));
    }
}
