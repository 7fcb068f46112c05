//! Client-side RESP decoder: one inbound frame → one [`Message`] with its
//! per-slot fragments.
//!
//! Error contract: `InvalidResp`/`BadLine` mean the client violated framing and
//! the loop closes it; every other error means the frame is not complete yet and
//! the loop retries after more bytes arrive.

use tracing::warn;

use coral_cluster::key_slot;
use coral_codec::command::CommandKind;
use coral_codec::lines::format_resp_for_log;
use coral_codec::{fold_ascii_lower, parse_len, CodecError, RespCursor};
use coral_common::ids::SlotId;

use crate::message::{FragmentPool, MessagePool, MsgRef};

/// Longest command name the table can match.
const MAX_COMMAND_NAME: usize = 24;

/// Client-side decoder parameterized by the frame-size limit.
#[derive(Debug, Clone, Copy)]
pub struct ClientCodec {
    /// Maximum accepted request frame length in bytes.
    pub msg_max_length: usize,
}

impl ClientCodec {
    /// Creates a decoder with the configured frame-size limit.
    #[must_use]
    pub fn new(msg_max_length: usize) -> Self {
        Self { msg_max_length }
    }

    /// Decodes one complete request from `view`.
    ///
    /// Returns the message and the number of bytes consumed; the caller discards
    /// exactly that prefix. The message's client token and fragment back-pointers
    /// are wired by the caller, which owns the connection.
    ///
    /// # Errors
    ///
    /// `InvalidResp`/`BadLine` on framing violations; any other `CodecError`
    /// means incomplete input.
    pub fn decode(
        &self,
        view: &[u8],
        messages: &mut MessagePool,
        frags: &mut FragmentPool,
    ) -> Result<(MsgRef, usize), CodecError> {
        let mut cursor = RespCursor::new(view);
        if cursor.is_empty() {
            return Err(CodecError::Incomplete);
        }

        let header = cursor.read_line().map_err(|_| CodecError::Incomplete)?;
        if header.is_empty() || header[0] != b'*' {
            warn!(
                frame = %format_resp_for_log(cursor.peek_all()),
                "unexpected request header"
            );
            return Err(CodecError::InvalidResp);
        }
        let count = parse_len(&header[1..])?;
        if count < 1 {
            return Err(CodecError::InvalidResp);
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let count = count as usize;

        let name = parse_bulk(&mut cursor)?;
        let n = count - 1;
        let kind = classify_name(name, n);

        let msg = messages.get();
        msg.borrow_mut().kind = kind;

        match kind {
            CommandKind::Mget => self.split_keys(&mut cursor, &msg, frags, n, b"mget")?,
            CommandKind::Del => self.split_keys(&mut cursor, &msg, frags, n, b"del")?,
            CommandKind::Mset => self.split_pairs(&mut cursor, &msg, frags, n)?,
            CommandKind::Eval | CommandKind::Evalsha => {
                self.route_by_script_key(&mut cursor, &msg, frags, n)?;
            }
            CommandKind::Auth => {
                let password = parse_bulk(&mut cursor)?;
                msg.borrow_mut().keys.push(password.to_vec());
            }
            CommandKind::Ping
            | CommandKind::Quit
            | CommandKind::Unknown
            | CommandKind::TooLarge
            | CommandKind::WrongArgumentsNumber => {
                for _ in 0..n {
                    let _ = parse_bulk(&mut cursor)?;
                }
            }
            _ => self.single_key(&mut cursor, &msg, frags, n)?,
        }

        let consumed = cursor.read_size();
        if consumed > self.msg_max_length {
            let mut inner = msg.borrow_mut();
            inner.kind = CommandKind::TooLarge;
            inner.frags.clear();
            inner.keys.clear();
            inner.slot_keys.clear();
        }
        Ok((msg, consumed))
    }

    /// Default path: the original frame forwards verbatim, routed by the first key.
    fn single_key(
        &self,
        cursor: &mut RespCursor<'_>,
        msg: &MsgRef,
        frags: &mut FragmentPool,
        n: usize,
    ) -> Result<(), CodecError> {
        let mut key: &[u8] = &[];
        for index in 0..n {
            let arg = parse_bulk(cursor)?;
            if index == 0 {
                key = arg;
            }
        }

        let frag = frags.get();
        {
            let mut inner = frag.borrow_mut();
            inner.key = key.to_vec();
            inner.req = cursor.read_buf().to_vec();
        }
        let _ = msg.borrow_mut().frags.insert(key_slot(key), frag);
        Ok(())
    }

    /// MGET/DEL path: group keys per slot and synthesize one sub-request each.
    fn split_keys(
        &self,
        cursor: &mut RespCursor<'_>,
        msg: &MsgRef,
        frags: &mut FragmentPool,
        n: usize,
        command: &[u8],
    ) -> Result<(), CodecError> {
        let mut inner = msg.borrow_mut();
        for _ in 0..n {
            let key = parse_bulk(cursor)?.to_vec();
            let slot = key_slot(&key);
            inner.keys.push(key.clone());
            inner.slot_keys.entry(slot).or_default().push(key);
        }

        let grouped: Vec<(SlotId, usize)> = inner
            .slot_keys
            .iter()
            .map(|(slot, keys)| (*slot, keys.len()))
            .collect();
        for (slot, key_count) in grouped {
            let frag = frags.get();
            {
                let keys = &inner.slot_keys[&slot];
                let mut frag_inner = frag.borrow_mut();
                frag_inner.key = keys[0].clone();
                frag_inner.req = synthesize(command, key_count + 1, keys.iter().map(Vec::as_slice));
            }
            let _ = inner.frags.insert(slot, frag);
        }
        Ok(())
    }

    /// MSET path: pairs group by the key's slot.
    fn split_pairs(
        &self,
        cursor: &mut RespCursor<'_>,
        msg: &MsgRef,
        frags: &mut FragmentPool,
        n: usize,
    ) -> Result<(), CodecError> {
        let mut inner = msg.borrow_mut();
        let mut grouped: Vec<(SlotId, Vec<Vec<u8>>)> = Vec::new();
        let mut index = 0;
        while index < n {
            let key = parse_bulk(cursor)?.to_vec();
            let value = parse_bulk(cursor)?.to_vec();
            let slot = key_slot(&key);
            inner.keys.push(key.clone());
            match grouped.iter_mut().find(|(existing, _)| *existing == slot) {
                Some((_, pairs)) => {
                    pairs.push(key);
                    pairs.push(value);
                }
                None => grouped.push((slot, vec![key, value])),
            }
            index += 2;
        }

        for (slot, pairs) in grouped {
            let frag = frags.get();
            {
                let mut frag_inner = frag.borrow_mut();
                frag_inner.key = pairs[0].clone();
                frag_inner.req =
                    synthesize(b"mset", pairs.len() + 1, pairs.iter().map(Vec::as_slice));
            }
            let _ = inner.frags.insert(slot, frag);
        }
        Ok(())
    }

    /// EVAL/EVALSHA path: routed by the first script key, frame forwarded verbatim.
    fn route_by_script_key(
        &self,
        cursor: &mut RespCursor<'_>,
        msg: &MsgRef,
        frags: &mut FragmentPool,
        n: usize,
    ) -> Result<(), CodecError> {
        if n < 3 {
            msg.borrow_mut().kind = CommandKind::WrongArgumentsNumber;
            for _ in 0..n {
                let _ = parse_bulk(cursor)?;
            }
            return Ok(());
        }

        let mut key: &[u8] = &[];
        for index in 0..n {
            let arg = parse_bulk(cursor)?;
            if index == 2 {
                key = arg;
            }
        }

        let frag = frags.get();
        {
            let mut inner = frag.borrow_mut();
            inner.key = key.to_vec();
            inner.req = cursor.read_buf().to_vec();
        }
        let _ = msg.borrow_mut().frags.insert(key_slot(key), frag);
        Ok(())
    }
}

/// Folds and classifies a command name against the table.
fn classify_name(name: &[u8], n: usize) -> CommandKind {
    if name.len() > MAX_COMMAND_NAME {
        return CommandKind::Unknown;
    }
    let mut folded = [0_u8; MAX_COMMAND_NAME];
    let folded = &mut folded[..name.len()];
    folded.copy_from_slice(name);
    fold_ascii_lower(folded);
    CommandKind::classify(folded, n)
}

/// Reads one `$<len>\r\n<payload>\r\n` bulk argument.
fn parse_bulk<'a>(cursor: &mut RespCursor<'a>) -> Result<&'a [u8], CodecError> {
    let line = cursor.read_line()?;
    if line.is_empty() || line[0] != b'$' {
        return Err(CodecError::InvalidResp);
    }
    let len = parse_len(&line[1..])?;
    if len < 0 {
        return Err(CodecError::InvalidResp);
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let payload = cursor.read_n(len as usize)?;
    let crlf = cursor.read_n(2).map_err(|_| CodecError::ShortLine)?;
    if crlf != b"\r\n" {
        return Err(CodecError::BadLine);
    }
    Ok(payload)
}

/// Builds `*<count>\r\n$<cmdlen>\r\n<cmd>\r\n` followed by one bulk per argument.
fn synthesize<'a>(
    command: &[u8],
    count: usize,
    args: impl Iterator<Item = &'a [u8]>,
) -> Vec<u8> {
    let mut req = Vec::with_capacity(64);
    req.push(b'*');
    req.extend_from_slice(count.to_string().as_bytes());
    req.extend_from_slice(b"\r\n$");
    req.extend_from_slice(command.len().to_string().as_bytes());
    req.extend_from_slice(b"\r\n");
    req.extend_from_slice(command);
    req.extend_from_slice(b"\r\n");
    for arg in args {
        push_bulk(&mut req, arg);
    }
    req
}

fn push_bulk(req: &mut Vec<u8>, arg: &[u8]) {
    req.push(b'$');
    req.extend_from_slice(arg.len().to_string().as_bytes());
    req.extend_from_slice(b"\r\n");
    req.extend_from_slice(arg);
    req.extend_from_slice(b"\r\n");
}
