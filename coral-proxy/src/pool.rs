//! Per-backend-address connection pool with health banning.
//!
//! The pool stores tokens, not sockets: the loop's connection map owns every
//! socket, and pool operations resolve tokens through it. One pipelined
//! connection per shard is the intended configuration; a larger `max_active`
//! turns the MRU rotation into plain round-robin.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use mio::Token;
use tracing::info;

use crate::conn::ProxyConn;

/// Cap on the ban backoff exponent.
pub const MAX_BAN_ORDER: u32 = 5;

/// One backend address's reusable shard connections plus health state.
#[derive(Debug)]
pub struct Pool {
    /// Backend `ip:port`.
    pub addr: String,
    /// Connections dial with the `READONLY` prelude when set.
    pub is_replica: bool,
    /// Maximum connections kept for this address.
    pub max_active: usize,
    /// Exponent of the current ban backoff, capped at [`MAX_BAN_ORDER`].
    pub ban_order: u32,
    /// When the current ban lapses.
    pub ban_until: Option<Instant>,
    /// Health probe marked this address offline.
    pub auto_ban: bool,
    active: VecDeque<Token>,
}

impl Pool {
    /// Creates an empty pool for one address.
    #[must_use]
    pub fn new(addr: String, is_replica: bool, max_active: usize) -> Self {
        Self {
            addr,
            is_replica,
            max_active: max_active.max(1),
            ban_order: 0,
            ban_until: None,
            auto_ban: false,
            active: VecDeque::new(),
        }
    }

    /// Number of held connections.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether another dial is allowed under the cap.
    #[must_use]
    pub fn below_cap(&self) -> bool {
        self.active.len() < self.max_active
    }

    /// Records a freshly dialed connection as most-recently-used.
    pub fn push_front(&mut self, token: Token) {
        self.active.push_front(token);
    }

    /// Rotates the least-recently-used open connection to the front and returns
    /// it, discarding tokens whose connection is already gone.
    pub fn rotate(&mut self, conns: &HashMap<Token, ProxyConn>) -> Option<Token> {
        while let Some(token) = self.active.pop_back() {
            let open = conns.get(&token).is_some_and(|conn| conn.opened);
            if !open {
                continue;
            }
            self.active.push_front(token);
            return Some(token);
        }
        None
    }

    /// Forgets one connection, used when the loop closes it.
    pub fn forget(&mut self, token: Token) {
        self.active.retain(|held| *held != token);
    }

    /// Drains every held token; the caller closes the connections.
    pub fn take_all(&mut self) -> Vec<Token> {
        self.active.drain(..).collect()
    }

    /// Flips the replica flag; on change every connection is recycled so the
    /// next dial runs the right prelude.
    ///
    /// Returns the tokens to close, empty when the flag did not change.
    pub fn set_is_replica(&mut self, is_replica: bool) -> Vec<Token> {
        if self.is_replica == is_replica {
            return Vec::new();
        }
        self.is_replica = is_replica;
        info!(addr = %self.addr, is_replica, "pool role changed, recycling connections");
        self.take_all()
    }

    /// Applies one dial failure: exponential ban with capped order.
    pub fn apply_dial_failure(&mut self, base: Duration, now: Instant) {
        self.ban_until = Some(now + base * 2_u32.pow(self.ban_order));
        if self.ban_order < MAX_BAN_ORDER {
            self.ban_order += 1;
        }
        self.auto_ban = true;
    }

    /// Clears the request-path ban state after a successful acquire.
    pub fn clear_ban(&mut self) {
        self.ban_order = 0;
    }

    /// Whether the address is currently usable for replica reads.
    ///
    /// A banned pool whose ban lapsed is un-banned as a side effect, matching the
    /// acquisition-time recovery rule.
    pub fn replica_is_live(&mut self, now: Instant) -> bool {
        if !self.auto_ban {
            return true;
        }
        match self.ban_until {
            Some(until) if until <= now => {
                self.auto_ban = false;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Pool, MAX_BAN_ORDER};
    use googletest::prelude::*;
    use mio::Token;
    use rstest::rstest;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    fn pool() -> Pool {
        Pool::new("127.0.0.1:7000".to_owned(), false, 2)
    }

    #[rstest]
    fn rotation_skips_unknown_tokens() {
        let mut pool = pool();
        pool.push_front(Token(10));
        pool.push_front(Token(11));

        // No live connection map entries: everything is discarded.
        let conns = HashMap::new();
        assert_that!(pool.rotate(&conns), eq(None));
        assert_that!(pool.active_count(), eq(0));
    }

    #[rstest]
    fn ban_backoff_doubles_and_caps() {
        let mut pool = pool();
        let base = Duration::from_millis(100);
        let now = Instant::now();

        pool.apply_dial_failure(base, now);
        assert_that!(pool.ban_order, eq(1));
        assert_that!(pool.ban_until, eq(Some(now + base)));

        pool.apply_dial_failure(base, now);
        assert_that!(pool.ban_order, eq(2));
        assert_that!(pool.ban_until, eq(Some(now + base * 2)));

        for _ in 0..10 {
            pool.apply_dial_failure(base, now);
        }
        assert_that!(pool.ban_order, eq(MAX_BAN_ORDER));
        assert_that!(pool.ban_until, eq(Some(now + base * 32)));
    }

    #[rstest]
    fn lapsed_ban_recovers_at_acquisition() {
        let mut pool = pool();
        let now = Instant::now();
        pool.auto_ban = true;
        pool.ban_until = Some(now - Duration::from_millis(1));

        assert_that!(pool.replica_is_live(now), eq(true));
        assert_that!(pool.auto_ban, eq(false));
    }

    #[rstest]
    fn active_ban_keeps_replica_out() {
        let mut pool = pool();
        let now = Instant::now();
        pool.auto_ban = true;
        pool.ban_until = Some(now + Duration::from_secs(30));

        assert_that!(pool.replica_is_live(now), eq(false));
        assert_that!(pool.auto_ban, eq(true));
    }

    #[rstest]
    fn set_is_replica_recycles_only_on_change() {
        let mut pool = pool();
        pool.push_front(Token(5));

        assert_that!(pool.set_is_replica(false).len(), eq(0));
        assert_that!(pool.active_count(), eq(1));

        let recycled = pool.set_is_replica(true);
        assert_that!(recycled.len(), eq(1));
        assert_that!(pool.active_count(), eq(0));
    }
}
