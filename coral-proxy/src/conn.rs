//! Connection state for the event loop.
//!
//! One type covers both connection kinds: a shared header (socket, buffers,
//! addresses) plus a kind-specific tail. The loop branches on the kind at every
//! callback, so a closed-world sum type beats a trait object here.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::message::{FragQueue, FragRef, MsgQueue};

/// Hard cap on io vector entries per writev syscall.
pub const IOV_MAX: usize = 1024;

/// Why a connection was torn down, for the close counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side first.
    Eof,
    /// Socket or protocol error.
    Err,
    /// The proxy decided to close.
    ProxyEof,
}

/// Initialization progress of a shard connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// No prelude configured or sent yet.
    None,
    /// Prelude written, waiting for its `+OK` tokens.
    Initializing,
    /// Ready for fragments.
    Initialized,
}

/// Client-side tail: parsed requests waiting for their ordered replies.
#[derive(Debug, Default)]
pub struct ClientState {
    /// Requests in strict arrival order.
    pub in_msgs: MsgQueue,
}

/// Shard-side tail: per-connection fragment pipeline plus init state.
#[derive(Debug)]
pub struct ShardState {
    /// Backend address this connection belongs to.
    pub addr: String,
    /// Connection was dialed for a replica pool.
    pub is_replica: bool,
    /// Prelude progress.
    pub init_status: InitStatus,
    /// Number of prelude commands awaiting `+OK` (1 or 2).
    pub init_step: u8,
    /// Fragments written and awaiting replies, FIFO.
    pub in_frags: FragQueue,
    /// Fragments queued for the next write-signal flush.
    pub out_frags: FragQueue,
}

/// Kind-specific connection tail.
#[derive(Debug)]
pub enum ConnKind {
    /// Accepted client connection.
    Client(ClientState),
    /// Dialed backend connection.
    Shard(ShardState),
}

/// One registered connection.
#[derive(Debug)]
pub struct ProxyConn {
    /// Non-blocking socket registered in the poller.
    pub socket: TcpStream,
    /// Poller token; tokens are never reused within a process.
    pub token: Token,
    /// Peer address for logs and per-address metrics.
    pub peer_addr: String,
    /// Still registered and usable.
    pub opened: bool,
    /// Leftover inbound bytes a previous parse could not finish.
    pub inbound: Vec<u8>,
    /// Elastic outbound buffer for short writes.
    pub outbound: Vec<u8>,
    /// Interest currently registered with the poller.
    pub interest: Interest,
    /// Kind-specific tail.
    pub kind: ConnKind,
}

impl ProxyConn {
    /// Wraps an accepted client socket.
    #[must_use]
    pub fn client(socket: TcpStream, token: Token, peer_addr: String) -> Self {
        Self {
            socket,
            token,
            peer_addr,
            opened: true,
            inbound: Vec::new(),
            outbound: Vec::new(),
            interest: Interest::READABLE,
            kind: ConnKind::Client(ClientState::default()),
        }
    }

    /// Wraps a freshly dialed shard socket.
    #[must_use]
    pub fn shard(socket: TcpStream, token: Token, addr: String, is_replica: bool) -> Self {
        Self {
            socket,
            token,
            peer_addr: addr.clone(),
            opened: true,
            inbound: Vec::new(),
            outbound: Vec::new(),
            interest: Interest::READABLE,
            kind: ConnKind::Shard(ShardState {
                addr,
                is_replica,
                init_status: InitStatus::None,
                init_step: 0,
                in_frags: VecDeque::new(),
                out_frags: VecDeque::new(),
            }),
        }
    }

    /// Whether this is a client connection.
    #[must_use]
    pub fn is_client(&self) -> bool {
        matches!(self.kind, ConnKind::Client(_))
    }

    /// Client tail accessor; panics on shard connections, which is a logic bug.
    pub fn client_state(&mut self) -> &mut ClientState {
        match &mut self.kind {
            ConnKind::Client(state) => state,
            ConnKind::Shard(_) => unreachable!("client_state on a shard connection"),
        }
    }

    /// Shard tail accessor; panics on client connections, which is a logic bug.
    pub fn shard_state(&mut self) -> &mut ShardState {
        match &mut self.kind {
            ConnKind::Shard(state) => state,
            ConnKind::Client(_) => unreachable!("shard_state on a client connection"),
        }
    }

    /// Reads one chunk into `scratch`.
    ///
    /// Returns `Ok(None)` when the socket has no bytes right now, `Ok(Some(0))`
    /// on EOF, otherwise the chunk length.
    ///
    /// # Errors
    ///
    /// Propagates socket errors other than `WouldBlock`.
    pub fn read_chunk(&mut self, scratch: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.read(scratch) {
            Ok(read_len) => Ok(Some(read_len)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Writes `data`, buffering whatever the socket does not take immediately.
    ///
    /// Ordering rule: once the outbound buffer is non-empty, new data is always
    /// appended behind it.
    ///
    /// # Errors
    ///
    /// Propagates socket errors other than `WouldBlock`; the caller closes.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.outbound.is_empty() {
            self.outbound.extend_from_slice(data);
            return Ok(());
        }
        match self.socket.write(data) {
            Ok(sent) if sent < data.len() => {
                self.outbound.extend_from_slice(&data[sent..]);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                self.outbound.extend_from_slice(data);
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Vectored variant of [`ProxyConn::write`], capped at [`IOV_MAX`] slices per syscall.
    ///
    /// # Errors
    ///
    /// Propagates socket errors other than `WouldBlock`.
    pub fn writev(&mut self, bufs: &[&[u8]]) -> io::Result<()> {
        if !self.outbound.is_empty() {
            for buf in bufs {
                self.outbound.extend_from_slice(buf);
            }
            return Ok(());
        }

        let mut remaining: Vec<&[u8]> = bufs.iter().copied().filter(|buf| !buf.is_empty()).collect();
        while !remaining.is_empty() {
            let batch: Vec<IoSlice<'_>> = remaining
                .iter()
                .take(IOV_MAX)
                .map(|buf| IoSlice::new(buf))
                .collect();
            match self.socket.write_vectored(&batch) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped reading"))
                }
                Ok(mut sent) => {
                    let mut index = 0;
                    while index < remaining.len() && sent >= remaining[index].len() {
                        sent -= remaining[index].len();
                        index += 1;
                    }
                    remaining.drain(..index);
                    if let Some(first) = remaining.first_mut() {
                        *first = &first[sent..];
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    for buf in &remaining {
                        self.outbound.extend_from_slice(buf);
                    }
                    return Ok(());
                }
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }

    /// Flushes the outbound buffer as far as the socket allows.
    ///
    /// Returns whether the buffer drained completely.
    ///
    /// # Errors
    ///
    /// Propagates socket errors other than `WouldBlock`.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.outbound.is_empty() {
            match self.socket.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped reading"))
                }
                Ok(sent) => {
                    let _ = self.outbound.drain(..sent);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(error) => return Err(error),
            }
        }
        Ok(true)
    }

    /// Interest this connection should be registered with right now.
    #[must_use]
    pub fn desired_interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Drops any unread inbound bytes, resynchronizing after a timeout.
    pub fn discard_inbound(&mut self) {
        self.inbound.clear();
    }
}

/// Moves every queued out-fragment into the in-flight queue, returning the
/// handles in write order. The caller writes their bytes and indexes deadlines.
pub fn drain_out_frags(state: &mut ShardState) -> Vec<FragRef> {
    let mut drained = Vec::with_capacity(state.out_frags.len());
    while let Some(frag) = state.out_frags.pop_front() {
        state.in_frags.push_back(std::rc::Rc::clone(&frag));
        drained.push(frag);
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::{drain_out_frags, InitStatus, ShardState};
    use crate::message::FragmentPool;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::collections::VecDeque;

    fn empty_shard_state() -> ShardState {
        ShardState {
            addr: "127.0.0.1:7000".to_owned(),
            is_replica: false,
            init_status: InitStatus::None,
            init_step: 0,
            in_frags: VecDeque::new(),
            out_frags: VecDeque::new(),
        }
    }

    #[rstest]
    fn drain_preserves_fifo_order() {
        let mut frags = FragmentPool::new();
        let mut state = empty_shard_state();
        let first = frags.get();
        let second = frags.get();
        state.out_frags.push_back(first);
        state.out_frags.push_back(second);

        let drained = drain_out_frags(&mut state);
        assert_that!(drained.len(), eq(2));
        assert_that!(state.out_frags.len(), eq(0));
        assert_that!(state.in_frags.len(), eq(2));
        assert_that!(drained[0].borrow().id < drained[1].borrow().id, eq(true));
        assert_that!(
            state.in_frags[0].borrow().id,
            eq(drained[0].borrow().id)
        );
    }
}
