//! Request/fragment object model, their FIFO queues and the timeout index.
//!
//! One [`Message`] is one parsed client command. Multi-key commands split into one
//! [`Fragment`] per touched slot; single-key commands carry exactly one fragment
//! holding the original frame. Owning queues hold strong handles; back-pointers are
//! weak and never used to release, so a dead upgrade is the signal that the other
//! side of the graph is already gone.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Instant;

use mio::Token;

use coral_codec::command::{CommandKind, ReplyKind};
use coral_codec::lines::RespError;
use coral_common::ids::{FragId, MsgId, SlotId};

/// Shared handle to one message.
pub type MsgRef = Rc<RefCell<Message>>;
/// Shared handle to one fragment.
pub type FragRef = Rc<RefCell<Fragment>>;

/// One parsed client request.
#[derive(Debug)]
pub struct Message {
    /// Monotonic id, unique per loop.
    pub id: MsgId,
    /// Token of the owning client connection.
    pub client: Token,
    /// Parsed command kind, or a synthetic parse outcome.
    pub kind: CommandKind,
    /// Per-slot sub-requests.
    pub frags: HashMap<SlotId, FragRef>,
    /// Aggregated reply bytes, written back to the client once done.
    pub rsp: Vec<u8>,
    /// Terminal error replacing the reply, when set.
    pub error: Option<RespError>,
    /// Original key order, kept for MGET reassembly and for AUTH payload transport.
    pub keys: Vec<Vec<u8>>,
    /// Keys grouped per slot, kept for MGET reassembly.
    pub slot_keys: HashMap<SlotId, Vec<Vec<u8>>>,
    /// Number of fragments that finished.
    pub frag_done_count: usize,
    /// Accumulated deletion count for DEL.
    pub del_total: i64,
    /// All fragments finished or a terminal error was recorded.
    pub done: bool,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            id: 0,
            client: Token(0),
            kind: CommandKind::Unknown,
            frags: HashMap::new(),
            rsp: Vec::new(),
            error: None,
            keys: Vec::new(),
            slot_keys: HashMap::new(),
            frag_done_count: 0,
            del_total: 0,
            done: false,
        }
    }
}

impl Message {
    /// Resets a recycled message for its next request.
    pub fn reset(&mut self) {
        self.id = 0;
        self.client = Token(0);
        self.kind = CommandKind::Unknown;
        self.frags.clear();
        self.rsp.clear();
        self.error = None;
        self.keys.clear();
        self.slot_keys.clear();
        self.frag_done_count = 0;
        self.del_total = 0;
        self.done = false;
    }

    /// Whether every fragment reported completion.
    #[must_use]
    pub fn all_frags_done(&self) -> bool {
        self.frag_done_count >= self.frags.len()
    }

    /// Fails the whole message: every fragment is marked done and the reply
    /// becomes the error line.
    pub fn fail(&mut self, error: RespError) {
        self.error = Some(error);
        self.frag_done_count = self.frags.len();
        self.rsp.clear();
        self.rsp.extend_from_slice(error.line());
        self.done = true;
        for frag in self.frags.values() {
            frag.borrow_mut().done = true;
        }
    }
}

/// One per-shard sub-request.
#[derive(Debug, Default)]
pub struct Fragment {
    /// Monotonic id, unique per loop.
    pub id: FragId,
    /// Parent message; dead when the client already went away.
    pub msg: Weak<RefCell<Message>>,
    /// Owning client connection; `None` marks the proxy's own topology probe.
    pub client: Option<Token>,
    /// Routing key the fragment was built from.
    pub key: Vec<u8>,
    /// Wire bytes of the sub-request, sent verbatim.
    pub req: Vec<u8>,
    /// Raw reply bytes copied out of the read buffer.
    pub rsp: Vec<u8>,
    /// Per-key reply entries parsed out of an MGET sub-reply.
    pub mget_entries: Vec<Vec<u8>>,
    /// Classification of the received reply.
    pub reply_kind: ReplyKind,
    /// Error recorded for this fragment, if any.
    pub error: Option<RespError>,
    /// MSET sub-reply was `+OK`.
    pub ok: bool,
    /// Reply fully processed.
    pub done: bool,
    /// When the fragment was created, for latency accounting.
    pub created_at: Option<Instant>,
    /// Deadline while waiting in a shard's in-flight queue.
    pub deadline: Option<Instant>,
}

impl Fragment {
    /// Id of the parent message, zero when the parent is gone.
    #[must_use]
    pub fn msg_id(&self) -> MsgId {
        self.msg.upgrade().map_or(0, |msg| msg.borrow().id)
    }

    /// Command kind of the parent message.
    #[must_use]
    pub fn msg_kind(&self) -> CommandKind {
        self.msg
            .upgrade()
            .map_or(CommandKind::Unknown, |msg| msg.borrow().kind)
    }

    /// Extracts `(addr, slot)` from a `-MOVED <slot> <addr>` / `-ASK <slot> <addr>` reply.
    #[must_use]
    pub fn parse_moved_or_ask(&self) -> Option<(String, SlotId)> {
        if self.rsp.len() < 10 {
            return None;
        }
        let skip = match self.reply_kind {
            ReplyKind::Moved => 7,
            ReplyKind::Ask => 5,
            _ => return None,
        };
        let body = core::str::from_utf8(&self.rsp[skip..self.rsp.len() - 2]).ok()?;
        let (slot, addr) = body.split_once(' ')?;
        let slot: SlotId = slot.parse().ok()?;
        Some((addr.to_owned(), slot))
    }
}

/// Recycling pool for message allocations.
#[derive(Debug, Default)]
pub struct MessagePool {
    free: Vec<MsgRef>,
    next_id: MsgId,
}

impl MessagePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a reset message with a fresh id.
    pub fn get(&mut self) -> MsgRef {
        self.next_id += 1;
        let msg = self
            .free
            .pop()
            .unwrap_or_else(|| Rc::new(RefCell::new(Message::default())));
        {
            let mut inner = msg.borrow_mut();
            inner.reset();
            inner.id = self.next_id;
        }
        msg
    }

    /// Returns a message to the pool once no queue holds it anymore.
    pub fn put(&mut self, msg: MsgRef) {
        if Rc::strong_count(&msg) == 1 {
            self.free.push(msg);
        }
    }
}

/// Fragment id allocator; fragments are short-lived enough that fresh
/// allocations beat recycling here.
#[derive(Debug, Default)]
pub struct FragmentPool {
    next_id: FragId,
}

impl FragmentPool {
    /// Creates the allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a fragment stamped with id and creation time.
    pub fn get(&mut self) -> FragRef {
        self.next_id += 1;
        Rc::new(RefCell::new(Fragment {
            id: self.next_id,
            created_at: Some(Instant::now()),
            ..Fragment::default()
        }))
    }
}

/// FIFO queue of messages awaiting their ordered reply.
pub type MsgQueue = VecDeque<MsgRef>;

/// FIFO queue of fragments.
pub type FragQueue = VecDeque<FragRef>;

/// Whether every queued message finished, head to tail.
#[must_use]
pub fn all_done(queue: &MsgQueue) -> bool {
    queue.iter().all(|msg| msg.borrow().done)
}

/// Ordered index of in-flight fragments keyed by deadline.
#[derive(Debug, Default)]
pub struct TimeoutIndex {
    tree: BTreeMap<(Instant, FragId), FragRef>,
}

impl TimeoutIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fragment under its deadline; a fragment without a client or
    /// parent never times out and is skipped.
    pub fn insert(&mut self, frag: &FragRef, deadline: Instant) {
        {
            let inner = frag.borrow();
            if inner.client.is_none() || inner.msg.upgrade().is_none() {
                return;
            }
        }
        frag.borrow_mut().deadline = Some(deadline);
        let id = frag.borrow().id;
        let _ = self.tree.insert((deadline, id), Rc::clone(frag));
    }

    /// Removes a fragment by its recorded deadline.
    pub fn remove(&mut self, frag: &FragRef) {
        let (deadline, id) = {
            let inner = frag.borrow();
            match inner.deadline {
                Some(deadline) => (deadline, inner.id),
                None => return,
            }
        };
        let _ = self.tree.remove(&(deadline, id));
        frag.borrow_mut().deadline = None;
    }

    /// Returns the earliest-deadline fragment without removing it.
    #[must_use]
    pub fn peek_min(&self) -> Option<(Instant, FragRef)> {
        self.tree
            .iter()
            .next()
            .map(|((deadline, _), frag)| (*deadline, Rc::clone(frag)))
    }

    /// Removes and returns the earliest-deadline fragment.
    pub fn pop_min(&mut self) -> Option<FragRef> {
        let key = *self.tree.keys().next()?;
        let frag = self.tree.remove(&key)?;
        frag.borrow_mut().deadline = None;
        Some(frag)
    }

    /// Number of indexed fragments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Estimated depth of the index, reported to the `timeout_tree` gauges.
    #[must_use]
    pub fn depth_estimate(&self) -> f64 {
        if self.tree.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let len = self.tree.len() as f64;
        (len + 1.0).log2().ceil()
    }
}

#[cfg(test)]
mod tests {
    use super::{all_done, FragmentPool, MessagePool, MsgQueue, TimeoutIndex};
    use coral_codec::command::ReplyKind;
    use coral_codec::lines::RespError;
    use googletest::prelude::*;
    use mio::Token;
    use rstest::rstest;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    #[rstest]
    fn message_pool_assigns_monotonic_ids_and_recycles() {
        let mut pool = MessagePool::new();
        let first = pool.get();
        assert_that!(first.borrow().id, eq(1));

        pool.put(first);
        let second = pool.get();
        assert_that!(second.borrow().id, eq(2));
        assert_that!(second.borrow().frags.len(), eq(0));
    }

    #[rstest]
    fn message_fail_marks_every_fragment_done() {
        let mut messages = MessagePool::new();
        let mut frags = FragmentPool::new();
        let msg = messages.get();
        let frag = frags.get();
        frag.borrow_mut().msg = Rc::downgrade(&msg);
        let _ = msg.borrow_mut().frags.insert(42, Rc::clone(&frag));

        msg.borrow_mut().fail(RespError::RequestTimeout);

        assert_that!(msg.borrow().done, eq(true));
        assert_that!(frag.borrow().done, eq(true));
        assert_that!(&msg.borrow().rsp, eq(&b"-ERR proxy request timeout\r\n".to_vec()));
    }

    #[rstest]
    fn parse_moved_extracts_addr_and_slot() {
        let mut frags = FragmentPool::new();
        let frag = frags.get();
        {
            let mut inner = frag.borrow_mut();
            inner.reply_kind = ReplyKind::Moved;
            inner.rsp = b"-MOVED 15495 127.0.0.1:8000\r\n".to_vec();
        }
        assert_that!(
            frag.borrow().parse_moved_or_ask(),
            eq(&Some(("127.0.0.1:8000".to_owned(), 15495)))
        );
    }

    #[rstest]
    fn parse_ask_extracts_addr_and_slot() {
        let mut frags = FragmentPool::new();
        let frag = frags.get();
        {
            let mut inner = frag.borrow_mut();
            inner.reply_kind = ReplyKind::Ask;
            inner.rsp = b"-ASK 15495 127.0.0.1:8000\r\n".to_vec();
        }
        assert_that!(
            frag.borrow().parse_moved_or_ask(),
            eq(&Some(("127.0.0.1:8000".to_owned(), 15495)))
        );
    }

    #[rstest]
    fn all_done_requires_every_message() {
        let mut pool = MessagePool::new();
        let mut queue = MsgQueue::new();
        let first = pool.get();
        let second = pool.get();
        first.borrow_mut().done = true;
        queue.push_back(Rc::clone(&first));
        queue.push_back(Rc::clone(&second));

        assert_that!(all_done(&queue), eq(false));
        second.borrow_mut().done = true;
        assert_that!(all_done(&queue), eq(true));
    }

    #[rstest]
    fn timeout_index_orders_by_deadline() {
        let mut messages = MessagePool::new();
        let mut frags = FragmentPool::new();
        let mut index = TimeoutIndex::new();
        let now = Instant::now();

        let msg = messages.get();
        let late = frags.get();
        late.borrow_mut().msg = Rc::downgrade(&msg);
        late.borrow_mut().client = Some(Token(7));
        let soon = frags.get();
        soon.borrow_mut().msg = Rc::downgrade(&msg);
        soon.borrow_mut().client = Some(Token(7));

        index.insert(&late, now + Duration::from_millis(500));
        index.insert(&soon, now + Duration::from_millis(100));
        assert_that!(index.len(), eq(2));

        let min = index.pop_min().expect("index must hold two fragments");
        assert_that!(min.borrow().id, eq(soon.borrow().id));
    }

    #[rstest]
    fn timeout_index_skips_anonymous_fragments() {
        let mut frags = FragmentPool::new();
        let mut index = TimeoutIndex::new();
        let probe = frags.get();
        index.insert(&probe, Instant::now() + Duration::from_millis(10));
        assert_that!(index.is_empty(), eq(true));
    }

    #[rstest]
    fn timeout_index_remove_by_recorded_deadline() {
        let mut messages = MessagePool::new();
        let mut frags = FragmentPool::new();
        let mut index = TimeoutIndex::new();
        let msg = messages.get();
        let frag = frags.get();
        frag.borrow_mut().msg = Rc::downgrade(&msg);
        frag.borrow_mut().client = Some(Token(3));

        index.insert(&frag, Instant::now() + Duration::from_millis(50));
        index.remove(&frag);
        assert_that!(index.is_empty(), eq(true));
        assert_that!(frag.borrow().deadline, eq(None));
    }
}
