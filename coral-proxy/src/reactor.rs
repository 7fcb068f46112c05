//! The single-threaded event loop.
//!
//! One thread owns the poller, every socket, the pools, the topology view and
//! the timeout index. Shard writes are deferred through the trigger queue so
//! the read path never stalls behind them. This loop is single-instance by
//! design; none of the state it owns is shareable across loops.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, warn};

use coral_codec::command::{CommandKind, ReplyKind};
use coral_codec::lines::{format_resp_for_log, RespError, OK, PONG};
use coral_codec::CodecError;
use coral_common::error::{ProxyError, ProxyResult};

use crate::codec_shard::{parse_integer_reply, parse_mget_entries, InitOutcome};
use crate::conn::{drain_out_frags, CloseReason, ConnKind, InitStatus, ProxyConn};
use crate::engine::Engine;
use crate::message::{all_done, FragRef, MsgRef};
use crate::topology::{extract_bulk_payload, LiveNodeVerifier, CLUSTER_NODES_REQUEST};


/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(0);
/// First token handed to accepted/dialed connections; tokens are never reused.
const CONNECTION_TOKEN_START: usize = 1;
/// Scratch read buffer size; rounded up to a power of two.
const DEFAULT_READ_BUFFER: usize = 64 * 1024;
/// Poll wait used by [`ProxyLoop::run`].
const RUN_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Literal `READONLY` prelude written on replica connections.
pub const READONLY_REQUEST: &[u8] = b"*1\r\n$8\r\nREADONLY\r\n";

/// Thin wrapper giving the loop exactly the poller surface it consumes.
#[derive(Debug)]
pub struct Poller {
    poll: Poll,
}

impl Poller {
    fn new() -> io::Result<Self> {
        Ok(Self { poll: Poll::new()? })
    }

    fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }

    fn add(&self, source: &mut impl Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    fn add_read(&self, source: &mut impl Source, token: Token) -> io::Result<()> {
        self.add(source, token, Interest::READABLE)
    }

    fn mod_interest(
        &self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    fn delete(&self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }
}

/// Deferred work executed on the loop thread between readiness batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopTask {
    /// Drain one shard connection's out-fragment queue onto the wire.
    FlushShard(Token),
}

/// What to do with a connection after one readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnAction {
    Keep,
    Close(CloseReason),
}

/// The request-forwarding event loop.
pub struct ProxyLoop {
    poller: Poller,
    events: Events,
    ready: Vec<(Token, bool, bool, bool)>,
    listener: TcpListener,
    next_token: usize,
    conns: HashMap<Token, ProxyConn>,
    scratch: Vec<u8>,
    tasks: VecDeque<LoopTask>,
    next_tick: Instant,
    client_count: i64,
    server_count: i64,
    /// Loop-owned engine state.
    pub engine: Engine,
}

impl ProxyLoop {
    /// Binds the RESP listener and readies the loop.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Io` when binding or poller setup fails.
    pub fn bind(engine: Engine) -> ProxyResult<Self> {
        let poller = Poller::new().map_err(|error| io_error("create poller", &error))?;
        let addr = SocketAddr::from(([0, 0, 0, 0], engine.config.port));
        let mut listener =
            TcpListener::bind(addr).map_err(|error| io_error("bind listener", &error))?;
        poller
            .add_read(&mut listener, LISTENER_TOKEN)
            .map_err(|error| io_error("register listener", &error))?;

        Ok(Self {
            poller,
            events: Events::with_capacity(1024),
            ready: Vec::with_capacity(1024),
            listener,
            next_token: CONNECTION_TOKEN_START,
            conns: HashMap::new(),
            scratch: vec![0; DEFAULT_READ_BUFFER.next_power_of_two()],
            tasks: VecDeque::new(),
            next_tick: Instant::now() + Duration::from_secs(1),
            client_count: 0,
            server_count: 0,
            engine,
        })
    }

    /// Address the listener actually bound, for tests and startup logs.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Io` when the socket refuses to report it.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|error| io_error("query listener addr", &error))
    }

    /// Runs until the shutdown signal fires or a fatal error surfaces.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::EngineShutdown` on a fatal backend auth mismatch and
    /// `ProxyError::Io` on unrecoverable poller failures.
    pub fn run(&mut self) -> ProxyResult<()> {
        if self.engine.config.redis.preconnect {
            self.preconnect()?;
        }

        let result = loop {
            if self.engine.shutdown.is_signaled() {
                break Ok(());
            }
            match self.poll_once(Some(RUN_POLL_TIMEOUT)) {
                Ok(_) => {}
                Err(error) => break Err(error),
            }
        };

        self.close_all();
        self.engine.shutdown.mark_stopped();
        result
    }

    /// Dials one connection to every known backend, failing boot on any miss.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Io` naming the address that refused the dial.
    pub fn preconnect(&mut self) -> ProxyResult<()> {
        let addrs = self.engine.addrs.clone();
        for addr in addrs {
            if self.acquire_shard(&addr).is_err() {
                return Err(ProxyError::Io(format!("preconnect failed, addr: {addr}")));
            }
        }
        Ok(())
    }

    /// Processes one readiness batch plus deferred work, timers and the ticker.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::EngineShutdown` on fatal backend auth mismatch,
    /// `ProxyError::Io` when polling itself fails.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> ProxyResult<usize> {
        self.poller
            .wait(&mut self.events, timeout)
            .map_err(|error| io_error("poll wait", &error))?;

        self.ready.clear();
        for event in &self.events {
            self.ready.push((
                event.token(),
                event.is_readable(),
                event.is_writable(),
                event.is_read_closed() || event.is_write_closed() || event.is_error(),
            ));
        }

        let ready_count = self.ready.len();
        for index in 0..ready_count {
            let (token, readable, writable, closed) = self.ready[index];
            if token == LISTENER_TOKEN {
                self.accept_clients();
                continue;
            }
            self.handle_conn_event(token, readable, writable, closed)?;
        }

        self.drain_tasks();
        self.sweep_timeouts();
        self.maybe_tick();
        self.drain_tasks();
        Ok(ready_count)
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut socket, peer)) => {
                    let ip = peer.ip().to_string();
                    if !self.engine.authorizer.is_authorized(&ip) {
                        warn!(%peer, "unauthorized access, rejecting client");
                        continue;
                    }
                    let _ = socket.set_nodelay(true);
                    let token = self.alloc_token();
                    if let Err(error) = self.poller.add_read(&mut socket, token) {
                        error!(%error, "register accepted client failed");
                        continue;
                    }
                    debug!(fd = token.0, %peer, "client conn open");
                    let _ = self
                        .conns
                        .insert(token, ProxyConn::client(socket, token, peer.to_string()));
                    self.engine.stats.total_connections.inc();
                    self.client_count += 1;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) => {
                    error!(%error, "accept failed");
                    return;
                }
            }
        }
    }

    fn handle_conn_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        closed: bool,
    ) -> ProxyResult<()> {
        let Some(mut conn) = self.conns.remove(&token) else {
            return Ok(());
        };

        let mut action = ConnAction::Keep;
        if writable && !conn.outbound.is_empty() && conn.flush().is_err() {
            action = ConnAction::Close(CloseReason::Err);
        }

        if readable && action == ConnAction::Keep {
            action = if conn.is_client() {
                self.client_read(&mut conn)?
            } else {
                self.shard_read(&mut conn)?
            };
        }

        if closed && action == ConnAction::Keep && !readable {
            action = ConnAction::Close(CloseReason::Eof);
        }

        match action {
            ConnAction::Keep => {
                self.refresh_interest(&mut conn);
                let _ = self.conns.insert(token, conn);
            }
            ConnAction::Close(reason) => self.close_conn(conn, reason),
        }
        Ok(())
    }

    fn refresh_interest(&mut self, conn: &mut ProxyConn) {
        let desired = conn.desired_interest();
        if desired == conn.interest {
            return;
        }
        if let Err(error) = self
            .poller
            .mod_interest(&mut conn.socket, conn.token, desired)
        {
            error!(fd = conn.token.0, %error, "refresh poll interest failed");
            return;
        }
        conn.interest = desired;
    }

    fn refresh_interest_token(&mut self, token: Token) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        self.refresh_interest(&mut conn);
        let _ = self.conns.insert(token, conn);
    }

    // ---------------------------------------------------------------- clients

    fn client_read(&mut self, conn: &mut ProxyConn) -> ProxyResult<ConnAction> {
        let mut scratch = std::mem::take(&mut self.scratch);
        let result = self.client_read_inner(conn, &mut scratch);
        self.scratch = scratch;
        result
    }

    fn client_read_inner(
        &mut self,
        conn: &mut ProxyConn,
        scratch: &mut [u8],
    ) -> ProxyResult<ConnAction> {
        loop {
            match conn.read_chunk(scratch) {
                Ok(None) => break,
                Ok(Some(0)) => return Ok(ConnAction::Close(CloseReason::Eof)),
                Ok(Some(read_len)) => {
                    conn.inbound.extend_from_slice(&scratch[..read_len]);
                    let action = self.process_client_inbound(conn)?;
                    if action != ConnAction::Keep {
                        return Ok(action);
                    }
                }
                Err(error) => {
                    debug!(fd = conn.token.0, %error, "client read failed");
                    return Ok(ConnAction::Close(CloseReason::Err));
                }
            }
        }
        Ok(ConnAction::Keep)
    }

    fn process_client_inbound(&mut self, conn: &mut ProxyConn) -> ProxyResult<ConnAction> {
        let buf = std::mem::take(&mut conn.inbound);
        let mut offset = 0;
        let mut action = ConnAction::Keep;

        while offset < buf.len() {
            let decoded = self.engine.client_codec.decode(
                &buf[offset..],
                &mut self.engine.messages,
                &mut self.engine.frags,
            );
            match decoded {
                Ok((msg, consumed)) => {
                    offset += consumed;
                    if let Some(reason) = self.on_client_msg(conn, msg)? {
                        action = ConnAction::Close(reason);
                        break;
                    }
                }
                Err(CodecError::InvalidResp | CodecError::BadLine) => {
                    warn!(fd = conn.token.0, "client closed because of invalid resp");
                    action = ConnAction::Close(CloseReason::Err);
                    break;
                }
                Err(_) => break,
            }
        }

        conn.inbound = buf[offset..].to_vec();
        Ok(action)
    }

    /// Reacts to one parsed client message: inline kinds are answered here,
    /// forwardable kinds are routed, split and queued onto shard connections.
    fn on_client_msg(
        &mut self,
        conn: &mut ProxyConn,
        msg: MsgRef,
    ) -> ProxyResult<Option<CloseReason>> {
        self.engine.stats.total_requests.inc();
        let kind = msg.borrow().kind;
        let msg_id = msg.borrow().id;

        match kind {
            CommandKind::Unknown => {
                warn!(msg = msg_id, fd = conn.token.0, "unknown command");
                return Ok(self.inline_reply(conn, RespError::UnknownCommand.line(), msg));
            }
            CommandKind::TooLarge => {
                info!(msg = msg_id, fd = conn.token.0, "request message too large");
                return Ok(self.inline_reply(conn, RespError::ReqTooLarge.line(), msg));
            }
            CommandKind::WrongArgumentsNumber => {
                info!(msg = msg_id, fd = conn.token.0, "wrong arguments number");
                return Ok(self.inline_reply(conn, RespError::WrongArgumentsNumber.line(), msg));
            }
            CommandKind::Ping => {
                return Ok(self.inline_reply(conn, PONG, msg));
            }
            CommandKind::Quit => {
                let failed = self.inline_reply(conn, OK, msg);
                return Ok(failed.or(Some(CloseReason::ProxyEof)));
            }
            CommandKind::Auth => {
                let line = if self.engine.config.redis.password.is_empty() {
                    RespError::NoPasswordSet.line()
                } else if msg
                    .borrow()
                    .keys
                    .first()
                    .is_some_and(|password| password.as_slice() == self.engine.config.redis.password.as_bytes())
                {
                    OK
                } else {
                    RespError::InvalidPassword.line()
                };
                return Ok(self.inline_reply(conn, line, msg));
            }
            _ => {}
        }

        for label in kind.stats_labels() {
            self.engine.stats.cmd.inc(label);
        }
        if matches!(kind, CommandKind::Mget | CommandKind::Mset | CommandKind::Del) {
            self.engine.stats.fragments.inc(kind.name());
        }

        {
            let mut inner = msg.borrow_mut();
            inner.client = conn.token;
        }
        {
            let inner = msg.borrow();
            for frag in inner.frags.values() {
                let mut frag_inner = frag.borrow_mut();
                frag_inner.msg = Rc::downgrade(&msg);
                frag_inner.client = Some(conn.token);
            }
        }

        // Resolve every fragment's shard connection before enqueueing any of
        // them, so a routing failure never leaves half a message in flight.
        let slots: Vec<u16> = msg.borrow().frags.keys().copied().collect();
        let mut placements: Vec<(FragRef, Token)> = Vec::with_capacity(slots.len());
        for slot in slots {
            if self.engine.slot_map.get(slot).is_none() {
                error!(msg = msg_id, fd = conn.token.0, slot, "waiting for slot loading");
                return Ok(self.inline_reply(conn, RespError::UnknownSlot.line(), msg));
            }

            let mut attempt = 0;
            let shard_token = loop {
                attempt += 1;
                let Some(target) = self.engine.route(kind, slot) else {
                    error!(msg = msg_id, fd = conn.token.0, slot, "no routable address");
                    return Ok(self.inline_reply(conn, RespError::AddrNotFound.line(), msg));
                };
                match self.acquire_shard(&target.addr) {
                    Ok(token) => break token,
                    Err(_) if attempt < 2 => continue,
                    Err(error) => {
                        error!(msg = msg_id, fd = conn.token.0, slot, addr = %target.addr, "shard acquire failed");
                        return Ok(self.inline_reply(conn, error.line(), msg));
                    }
                }
            };
            let frag = Rc::clone(&msg.borrow().frags[&slot]);
            placements.push((frag, shard_token));
        }

        for (frag, shard_token) in placements {
            if let Some(shard) = self.conns.get_mut(&shard_token) {
                debug!(
                    msg = msg_id,
                    frag = frag.borrow().id,
                    fd = conn.token.0,
                    shard_fd = shard_token.0,
                    "frag enqueue"
                );
                shard.shard_state().out_frags.push_back(frag);
                self.tasks.push_back(LoopTask::FlushShard(shard_token));
            }
        }

        conn.client_state().in_msgs.push_back(msg);
        Ok(None)
    }

    /// Writes an inline reply and releases the message; inline replies bypass
    /// the ordered queue by design.
    fn inline_reply(
        &mut self,
        conn: &mut ProxyConn,
        line: &[u8],
        msg: MsgRef,
    ) -> Option<CloseReason> {
        let failed = conn.write(line).is_err();
        self.engine.messages.put(msg);
        if failed {
            Some(CloseReason::Err)
        } else {
            None
        }
    }

    // ----------------------------------------------------------------- shards

    fn shard_read(&mut self, conn: &mut ProxyConn) -> ProxyResult<ConnAction> {
        let mut scratch = std::mem::take(&mut self.scratch);
        let result = self.shard_read_inner(conn, &mut scratch);
        self.scratch = scratch;
        result
    }

    fn shard_read_inner(
        &mut self,
        conn: &mut ProxyConn,
        scratch: &mut [u8],
    ) -> ProxyResult<ConnAction> {
        loop {
            match conn.read_chunk(scratch) {
                Ok(None) => break,
                Ok(Some(0)) => return Ok(ConnAction::Close(CloseReason::Eof)),
                Ok(Some(read_len)) => {
                    conn.inbound.extend_from_slice(&scratch[..read_len]);
                    let action = self.process_shard_inbound(conn)?;
                    if action != ConnAction::Keep {
                        return Ok(action);
                    }
                }
                Err(error) => {
                    warn!(fd = conn.token.0, %error, "shard read failed");
                    return Ok(ConnAction::Close(CloseReason::Err));
                }
            }
        }
        Ok(ConnAction::Keep)
    }

    fn process_shard_inbound(&mut self, conn: &mut ProxyConn) -> ProxyResult<ConnAction> {
        let buf = std::mem::take(&mut conn.inbound);
        let mut offset = 0;
        let mut action = ConnAction::Keep;

        while offset < buf.len() {
            if conn.shard_state().init_status == InitStatus::Initializing {
                let step = conn.shard_state().init_step;
                match self.engine.shard_codec.decode_initializing(&buf[offset..], step) {
                    Ok(InitOutcome::Initialized { consumed }) => {
                        offset += consumed;
                        conn.shard_state().init_status = InitStatus::Initialized;
                        debug!(fd = conn.token.0, "shard initialized");
                        continue;
                    }
                    Ok(InitOutcome::AuthFatal) => {
                        error!(
                            fd = conn.token.0,
                            "proxy shutdown because of invalid auth with backend"
                        );
                        return Err(ProxyError::EngineShutdown);
                    }
                    Err(CodecError::InvalidInitializing) => {
                        error!(fd = conn.token.0, "unexpected initialize response");
                        action = ConnAction::Close(CloseReason::Err);
                        break;
                    }
                    Err(_) => break,
                }
            }

            match self.engine.shard_codec.decode_reply(&buf[offset..]) {
                Ok((kind, consumed)) => {
                    let rsp = buf[offset..offset + consumed].to_vec();
                    offset += consumed;
                    if !self.on_shard_reply(conn, kind, rsp)? {
                        action = ConnAction::Close(CloseReason::Err);
                        break;
                    }
                }
                Err(CodecError::InvalidResp | CodecError::BadLine) => {
                    let preview = &buf[offset..buf.len().min(offset + 64)];
                    error!(
                        fd = conn.token.0,
                        frame = %format_resp_for_log(preview),
                        "backend response parse failed"
                    );
                    action = ConnAction::Close(CloseReason::Err);
                    break;
                }
                Err(_) => break,
            }
        }

        conn.inbound = buf[offset..].to_vec();
        Ok(action)
    }

    /// Matches one decoded reply to the head in-flight fragment and advances its
    /// message. Returns `false` when the connection must close.
    fn on_shard_reply(
        &mut self,
        conn: &mut ProxyConn,
        kind: ReplyKind,
        rsp: Vec<u8>,
    ) -> ProxyResult<bool> {
        let Some(frag) = conn.shard_state().in_frags.pop_front() else {
            error!(fd = conn.token.0, "reply without a matching in-flight fragment");
            return Ok(false);
        };
        self.engine.timeouts.remove(&frag);
        {
            let mut inner = frag.borrow_mut();
            inner.reply_kind = kind;
            inner.rsp = rsp;
        }

        if kind.is_auth_fatal() {
            error!(
                frag = frag.borrow().id,
                fd = conn.token.0,
                "proxy shutdown because of invalid auth, backend rejected request"
            );
            return Err(ProxyError::EngineShutdown);
        }

        if frag.borrow().client.is_none() {
            let payload = frag.borrow().rsp.clone();
            self.engine.topo_queue.push(payload);
            return Ok(true);
        }

        let Some(msg) = frag.borrow().msg.upgrade() else {
            debug!(frag = frag.borrow().id, fd = conn.token.0, "client conn already gone");
            return Ok(true);
        };

        if kind.is_redirection() {
            warn!(
                msg = msg.borrow().id,
                frag = frag.borrow().id,
                fd = conn.token.0,
                "moved/ask redirection"
            );
            self.on_moved(&frag);
            return Ok(true);
        }

        if frag.borrow().done {
            debug!(frag = frag.borrow().id, "frag already done");
            return Ok(true);
        }

        self.observe_latency(&frag, conn.token);

        if self.engine.shard_codec.size_too_large(frag.borrow().rsp.len()) {
            frag.borrow_mut().error = Some(RespError::RspTooLarge);
        }

        msg.borrow_mut().frag_done_count += 1;
        let frag_error = frag.borrow().error;
        if let Some(error) = frag_error {
            msg.borrow_mut().fail(error);
        } else {
            let msg_kind = msg.borrow().kind;
            match msg_kind {
                CommandKind::Mget => {
                    let entries = parse_mget_entries(&frag.borrow().rsp);
                    {
                        let mut inner = frag.borrow_mut();
                        inner.mget_entries = entries;
                        inner.done = true;
                    }
                    if msg.borrow().all_frags_done() {
                        self.engine.shard_codec.aggregate_mget(&msg);
                    }
                }
                CommandKind::Mset => {
                    {
                        let mut inner = frag.borrow_mut();
                        inner.ok = kind == ReplyKind::Ok;
                        inner.done = true;
                        if !inner.ok {
                            warn!(frag = inner.id, "unknown mset error");
                        }
                    }
                    if msg.borrow().all_frags_done() {
                        self.engine.shard_codec.aggregate_mset(&msg);
                    }
                }
                CommandKind::Del => {
                    let count = parse_integer_reply(&frag.borrow().rsp);
                    frag.borrow_mut().done = true;
                    {
                        let mut inner = msg.borrow_mut();
                        inner.del_total += count;
                    }
                    if msg.borrow().all_frags_done() {
                        self.engine.shard_codec.aggregate_del(&msg);
                    }
                }
                _ => {
                    frag.borrow_mut().done = true;
                    let rsp = frag.borrow().rsp.clone();
                    self.engine.shard_codec.aggregate_default(&msg, &rsp);
                }
            }
        }

        if msg.borrow().done {
            let client = msg.borrow().client;
            self.try_reply_client(client);
        }
        Ok(true)
    }

    /// Transparent MOVED/ASK handling: the same fragment object is re-queued on
    /// the redirect target. The slot map stays as-is; the next topology probe
    /// catches up with the migration.
    fn on_moved(&mut self, frag: &FragRef) {
        let Some((addr, slot)) = frag.borrow().parse_moved_or_ask() else {
            warn!(frag = frag.borrow().id, "unparsable moved/ask reply");
            return;
        };
        info!(frag = frag.borrow().id, %addr, slot, "following redirection");
        frag.borrow_mut().rsp.clear();

        match self.acquire_shard(&addr) {
            Ok(token) => {
                if let Some(shard) = self.conns.get_mut(&token) {
                    shard.shard_state().out_frags.push_back(Rc::clone(frag));
                    self.tasks.push_back(LoopTask::FlushShard(token));
                }
            }
            Err(error) => {
                error!(frag = frag.borrow().id, %addr, ?error, "redirection target unavailable");
            }
        }
    }

    fn observe_latency(&mut self, frag: &FragRef, shard_token: Token) {
        let Some(created) = frag.borrow().created_at else {
            return;
        };
        let cost_ms = created.elapsed().as_secs_f64() * 1000.0;
        self.engine.stats.request_latency.observe(cost_ms);

        let threshold = self.engine.config.redis.slowlog_slower_than;
        #[allow(clippy::cast_precision_loss)]
        let threshold_ms = threshold as f64;
        if threshold > 0 && cost_ms >= threshold_ms {
            let inner = frag.borrow();
            warn!(
                msg = inner.msg_id(),
                frag = inner.id,
                shard_fd = shard_token.0,
                cost_ms,
                request_type = inner.msg_kind().name(),
                request_len = inner.req.len(),
                response_len = inner.rsp.len(),
                "slow request"
            );
        }
    }

    /// Writes the ordered reply run for one client: only when every queued
    /// message is done does anything leave the proxy, head to tail.
    fn try_reply_client(&mut self, client_token: Token) {
        let mut close = false;
        {
            let Some(conn) = self.conns.get_mut(&client_token) else {
                warn!(fd = client_token.0, "client conn already closed");
                return;
            };
            if !conn.opened {
                return;
            }
            let state = conn.client_state();
            if state.in_msgs.is_empty() {
                return;
            }
            if !all_done(&state.in_msgs) {
                return;
            }

            let msgs: Vec<MsgRef> = state.in_msgs.drain(..).collect();
            {
                let refs: Vec<std::cell::Ref<'_, crate::message::Message>> =
                    msgs.iter().map(|msg| msg.borrow()).collect();
                let slices: Vec<&[u8]> = refs.iter().map(|inner| inner.rsp.as_slice()).collect();
                if conn.writev(&slices).is_err() {
                    close = true;
                }
            }
            for msg in msgs {
                self.engine.messages.put(msg);
            }
        }

        if close {
            self.close_conn_token(client_token, CloseReason::Err);
        } else {
            self.refresh_interest_token(client_token);
        }
    }

    // ------------------------------------------------------------ shard pools

    /// Returns a usable shard connection token for `addr`, dialing when the pool
    /// is under its cap and rotating otherwise. Failures ban the pool.
    fn acquire_shard(&mut self, addr: &str) -> Result<Token, RespError> {
        let (below_cap, is_replica) = match self.engine.pools.get(addr) {
            None => return Err(RespError::UnknownProxyPool),
            Some(pool) => (pool.below_cap(), pool.is_replica),
        };

        if !below_cap {
            let conns = &self.conns;
            if let Some(pool) = self.engine.pools.get_mut(addr) {
                if let Some(token) = pool.rotate(conns) {
                    pool.clear_ban();
                    return Ok(token);
                }
            }
        }

        match self.dial_shard(addr, is_replica) {
            Ok(token) => {
                if let Some(pool) = self.engine.pools.get_mut(addr) {
                    pool.push_front(token);
                    pool.clear_ban();
                }
                Ok(token)
            }
            Err(error) => {
                self.engine
                    .stats
                    .redis_connections_create_conn_error
                    .inc(addr);
                error!(%addr, %error, "dial failed, banning for a period");
                let base = self.engine.retry_backoff_base();
                if let Some(pool) = self.engine.pools.get_mut(addr) {
                    pool.apply_dial_failure(base, Instant::now());
                }
                Err(RespError::UnknownProxyPoolConn)
            }
        }
    }

    /// Blocking dial with the configured connect timeout, then hands the socket
    /// to the poller and writes the initialization prelude.
    fn dial_shard(&mut self, addr: &str, is_replica: bool) -> io::Result<Token> {
        let socket_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolves to nothing"))?;
        let timeout = Duration::from_millis(self.engine.config.redis.conn_timeout.max(1));
        let std_socket = std::net::TcpStream::connect_timeout(&socket_addr, timeout)?;
        let _ = std_socket.set_nodelay(true);
        std_socket.set_nonblocking(true)?;
        let socket = mio::net::TcpStream::from_std(std_socket);

        let token = self.alloc_token();
        let mut conn = ProxyConn::shard(socket, token, addr.to_owned(), is_replica);

        let mut prelude = Vec::new();
        let mut step: u8 = 0;
        if !self.engine.auth_prelude.is_empty() {
            step += 1;
            prelude.extend_from_slice(&self.engine.auth_prelude);
        }
        if is_replica {
            step += 1;
            prelude.extend_from_slice(READONLY_REQUEST);
        }
        if step > 0 {
            {
                let state = conn.shard_state();
                state.init_step = step;
                state.init_status = InitStatus::Initializing;
            }
            debug!(fd = token.0, %addr, step, "shard initializing");
            conn.write(&prelude)?;
        } else {
            conn.shard_state().init_status = InitStatus::Initialized;
        }

        let interest = conn.desired_interest();
        self.poller.add(&mut conn.socket, token, interest)?;
        conn.interest = interest;
        debug!(fd = token.0, %addr, is_replica, "shard conn open");
        let _ = self.conns.insert(token, conn);
        self.engine.stats.total_connections.inc();
        self.server_count += 1;
        Ok(token)
    }

    // -------------------------------------------------------- deferred writes

    fn drain_tasks(&mut self) {
        while let Some(task) = self.tasks.pop_front() {
            match task {
                LoopTask::FlushShard(token) => self.flush_shard(token),
            }
        }
    }

    /// Drains one shard's out-queue: fragments move to the in-flight queue and
    /// the timeout index before their bytes hit the wire, so a write failure
    /// still surfaces through the sweep.
    fn flush_shard(&mut self, token: Token) {
        let timeout = self.engine.request_timeout();
        let mut close = false;
        {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            if !conn.opened {
                return;
            }
            let state = conn.shard_state();
            if state.out_frags.is_empty() {
                return;
            }

            let drained = drain_out_frags(state);
            if let Some(timeout) = timeout {
                let deadline = Instant::now() + timeout;
                for frag in &drained {
                    self.engine.timeouts.insert(frag, deadline);
                }
            }

            let refs: Vec<std::cell::Ref<'_, crate::message::Fragment>> =
                drained.iter().map(|frag| frag.borrow()).collect();
            let slices: Vec<&[u8]> = refs.iter().map(|inner| inner.req.as_slice()).collect();
            if conn.writev(&slices).is_err() {
                close = true;
            }
        }

        if close {
            self.close_conn_token(token, CloseReason::Err);
        } else {
            self.refresh_interest_token(token);
        }
    }

    // --------------------------------------------------------------- timeouts

    /// Expires past-due fragments: the owning message fails with the timeout
    /// error, the client gets the line immediately and its unread input is
    /// dropped to resynchronize.
    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        loop {
            let Some((deadline, frag)) = self.engine.timeouts.peek_min() else {
                break;
            };
            if frag.borrow().done {
                self.engine.timeouts.remove(&frag);
                continue;
            }
            if deadline > now {
                break;
            }
            self.engine.timeouts.remove(&frag);

            if let Some(created) = frag.borrow().created_at {
                self.engine
                    .stats
                    .request_latency
                    .observe(created.elapsed().as_secs_f64() * 1000.0);
            }

            let client_token = frag.borrow().client;
            let parent = frag.borrow().msg.upgrade();
            if let Some(msg) = parent {
                let mut inner = msg.borrow_mut();
                inner.fail(RespError::RequestTimeout);
                // The error line goes out directly below; the ordered flush must
                // not repeat it for this message.
                inner.rsp.clear();
            }

            let Some(token) = client_token else {
                continue;
            };
            let mut close = false;
            match self.conns.get_mut(&token) {
                Some(conn) if conn.opened => {
                    warn!(
                        frag = frag.borrow().id,
                        fd = token.0,
                        "request timeout, consider raising the request timeout"
                    );
                    if conn.write(RespError::RequestTimeout.line()).is_err() {
                        close = true;
                    }
                    conn.discard_inbound();
                }
                _ => {
                    info!(frag = frag.borrow().id, "timeout for an already closed client");
                    continue;
                }
            }
            if close {
                self.close_conn_token(token, CloseReason::Err);
            } else {
                self.refresh_interest_token(token);
                self.try_reply_client(token);
            }
        }
    }

    // ----------------------------------------------------------------- ticker

    fn maybe_tick(&mut self) {
        let now = Instant::now();
        if now < self.next_tick {
            return;
        }
        self.next_tick = now + Duration::from_secs(1);

        self.apply_health_reports(now);
        self.consume_topology_payloads();
        if self.engine.topology.server_changed() {
            self.apply_server_change();
        }
        self.update_gauges();
        self.write_topology_probe();
    }

    fn apply_health_reports(&mut self, now: Instant) {
        for report in self.engine.prober.drain_reports() {
            let Some(pool) = self.engine.pools.get_mut(&report.addr) else {
                continue;
            };
            if report.healthy {
                pool.ban_order = 0;
                if pool.auto_ban {
                    info!(addr = %report.addr, "backend reconnected");
                }
                pool.auto_ban = false;
            } else {
                pool.ban_until = Some(now + report.ban_for);
                pool.auto_ban = true;
                error!(addr = %report.addr, "backend unreachable, banned for a period");
            }
        }
    }

    fn consume_topology_payloads(&mut self) {
        let payloads = self.engine.topo_queue.drain();
        if payloads.is_empty() {
            return;
        }
        let verifier = LiveNodeVerifier {
            password: self.engine.config.redis.password.clone(),
            connect_timeout: Duration::from_secs(1),
        };
        for raw in payloads {
            let Some(text) = extract_bulk_payload(&raw) else {
                continue;
            };
            match self.engine.topology.parse(&text, &verifier) {
                Ok(nodes) => self.engine.topology.update(nodes),
                Err(error) => warn!(%error, "cluster nodes snapshot rejected"),
            }
        }
    }

    /// Applies a pending membership change: stale pools close, retained pools
    /// flip roles, new pools appear, and the slot map is rebuilt from masters.
    fn apply_server_change(&mut self) {
        info!(addrs = ?self.engine.addrs, "server change: start applying new topology");

        let stale: Vec<String> = self
            .engine
            .pools
            .keys()
            .filter(|addr| !self.engine.topology.nodes.contains_key(*addr))
            .cloned()
            .collect();
        for addr in stale {
            if let Some(mut pool) = self.engine.pools.remove(&addr) {
                for token in pool.take_all() {
                    self.close_conn_token(token, CloseReason::ProxyEof);
                }
            }
            self.engine.stats.redis_connections_active.remove(&addr);
            info!(%addr, "server change: removed backend");
        }

        let entries: Vec<(String, bool)> = self
            .engine
            .topology
            .nodes
            .iter()
            .map(|(addr, node)| {
                (
                    addr.clone(),
                    node.role == coral_cluster::NodeRole::Replica,
                )
            })
            .collect();
        for (addr, is_replica) in entries {
            if self.engine.pools.contains_key(&addr) {
                let recycled = self
                    .engine
                    .pools
                    .get_mut(&addr)
                    .map_or_else(Vec::new, |pool| pool.set_is_replica(is_replica));
                for token in recycled {
                    self.close_conn_token(token, CloseReason::ProxyEof);
                }
            } else {
                let _ = self.engine.pools.insert(
                    addr.clone(),
                    crate::pool::Pool::new(
                        addr.clone(),
                        is_replica,
                        self.engine.config.redis.server_connections,
                    ),
                );
                info!(%addr, is_replica, "server change: added backend");
            }
        }

        self.engine.slot_map.reset();
        for (index, replicaset) in self.engine.topology.replicasets.iter().enumerate() {
            for range in &replicaset.master.slots {
                for slot in range.start..=range.end {
                    self.engine.slot_map.set(slot, index);
                }
            }
        }

        self.engine.addrs = self.engine.pools.keys().cloned().collect();
        self.engine.prober.update_addrs(self.engine.addrs.clone());
        self.engine.topology.clear_server_changed();
        info!(addrs = ?self.engine.addrs, "server change: done");
    }

    fn update_gauges(&mut self) {
        for (addr, pool) in &self.engine.pools {
            #[allow(clippy::cast_possible_wrap)]
            self.engine
                .stats
                .redis_connections_active
                .set(addr, pool.active_count() as i64);
        }
        self.engine
            .stats
            .curr_connections
            .set("client", self.client_count);
        self.engine
            .stats
            .curr_connections
            .set("server", self.server_count);
        self.engine
            .stats
            .curr_connections
            .set("total", self.client_count + self.server_count);

        #[allow(clippy::cast_possible_wrap)]
        let length = self.engine.timeouts.len() as i64;
        self.engine.stats.timeout_tree.set("length", length);
        #[allow(clippy::cast_possible_truncation)]
        let depth = self.engine.timeouts.depth_estimate() as i64;
        self.engine.stats.timeout_tree.set("depth", depth);
        self.engine.stats.timeout_tree.set("stddev", 0);
    }

    /// Sends the proxy's own `CLUSTER NODES` probe to one random backend as an
    /// anonymous fragment.
    fn write_topology_probe(&mut self) {
        let Some(addr) = self.engine.random_addr().map(str::to_owned) else {
            error!("no backend addr known for topology probe");
            return;
        };
        let token = match self.acquire_shard(&addr) {
            Ok(token) => token,
            Err(error) => {
                error!(%addr, ?error, "topology probe acquire failed");
                return;
            }
        };

        let frag = self.engine.frags.get();
        frag.borrow_mut()
            .req
            .extend_from_slice(CLUSTER_NODES_REQUEST);
        if let Some(shard) = self.conns.get_mut(&token) {
            shard.shard_state().out_frags.push_back(frag);
            self.tasks.push_back(LoopTask::FlushShard(token));
        }
    }

    // ---------------------------------------------------------------- closing

    fn close_conn_token(&mut self, token: Token, reason: CloseReason) {
        if let Some(conn) = self.conns.remove(&token) {
            self.close_conn(conn, reason);
        }
    }

    fn close_conn(&mut self, mut conn: ProxyConn, reason: CloseReason) {
        if !conn.opened {
            return;
        }
        let _ = conn.flush();
        let _ = self.poller.delete(&mut conn.socket);
        conn.opened = false;

        match &mut conn.kind {
            ConnKind::Client(_) => {
                self.client_count -= 1;
                match reason {
                    CloseReason::Eof => self.engine.stats.client_connections_client_eof.inc(),
                    CloseReason::Err => self.engine.stats.client_connections_client_err.inc(),
                    CloseReason::ProxyEof => {}
                }
                debug!(fd = conn.token.0, peer = %conn.peer_addr, "client conn closed");
            }
            ConnKind::Shard(state) => {
                self.server_count -= 1;
                match reason {
                    CloseReason::Eof => self.engine.stats.redis_connections_eof.inc(&state.addr),
                    CloseReason::Err => self.engine.stats.redis_connections_err.inc(&state.addr),
                    CloseReason::ProxyEof => {}
                }
                if let Some(pool) = self.engine.pools.get_mut(&state.addr) {
                    pool.forget(conn.token);
                }
                while let Some(frag) = state.in_frags.pop_front() {
                    let inner = frag.borrow();
                    if inner.done || inner.msg.upgrade().is_none() {
                        continue;
                    }
                    error!(
                        frag = inner.id,
                        fd = conn.token.0,
                        "backend closed with fragment in flight"
                    );
                }
                info!(fd = conn.token.0, addr = %state.addr, "shard conn closed");
            }
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.close_conn_token(token, CloseReason::ProxyEof);
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token = self.next_token.saturating_add(1);
        token
    }
}

fn io_error(context: &str, error: &io::Error) -> ProxyError {
    ProxyError::Io(format!("{context} failed: {error}"))
}
