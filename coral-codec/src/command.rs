//! Static command table: name → kind → arity rule → read/write class.
//!
//! The table mirrors the command surface the proxy forwards. Commands absent from it
//! are answered with `unknown command` without touching a backend.

/// Argument-count rule, counted after the command name (key plus parameters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly this many arguments.
    Exact(usize),
    /// At least this many arguments.
    AtLeast(usize),
    /// At least this many arguments and an even total.
    EvenAtLeast(usize),
}

impl Arity {
    /// Whether `n` arguments satisfy the rule.
    #[must_use]
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Self::Exact(want) => n == want,
            Self::AtLeast(min) => n >= min,
            Self::EvenAtLeast(min) => n >= min && n % 2 == 0,
        }
    }
}

/// Classification of one backend reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyKind {
    /// Not yet classified.
    #[default]
    Unknown,
    /// `+...` status other than OK/PONG.
    Status,
    /// `+OK`.
    Ok,
    /// `+PONG`.
    Pong,
    /// `-...` error other than the recognized ones.
    Error,
    /// `-NOAUTH Authentication required`.
    NeedAuth,
    /// Backend has no password configured but got AUTH.
    NeedNtAuth,
    /// `-ERR invalid password`.
    AuthFailed,
    /// `:<n>`.
    Integer,
    /// `$<len>` bulk (including nil).
    Bulk,
    /// `*<len>` array.
    MultiBulk,
    /// `-ASK <slot> <addr>`.
    Ask,
    /// `-MOVED <slot> <addr>`.
    Moved,
}

impl ReplyKind {
    /// Whether this reply means the backend rejected our credentials setup.
    #[must_use]
    pub fn is_auth_fatal(self) -> bool {
        matches!(self, Self::NeedAuth | Self::NeedNtAuth | Self::AuthFailed)
    }

    /// Whether this reply is a cluster redirection.
    #[must_use]
    pub fn is_redirection(self) -> bool {
        matches!(self, Self::Moved | Self::Ask)
    }
}

macro_rules! command_table {
    ($(($variant:ident, $name:literal, $arity:expr, $write:literal)),+ $(,)?) => {
        /// One forwardable client command, plus the synthetic parse outcomes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[allow(missing_docs)]
        pub enum CommandKind {
            /// Name not present in the table.
            #[default]
            Unknown,
            /// Frame exceeded the configured maximum length.
            TooLarge,
            /// Argument count violates the arity rule.
            WrongArgumentsNumber,
            $($variant,)+
        }

        impl CommandKind {
            /// Looks a lowercased command name up in the table.
            #[must_use]
            pub fn lookup(name: &[u8]) -> Self {
                match name {
                    $($name => Self::$variant,)+
                    _ => Self::Unknown,
                }
            }

            /// Canonical lowercase name, `"unknown"` for the synthetic kinds.
            #[must_use]
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => match core::str::from_utf8($name) {
                        Ok(name) => name,
                        Err(_) => "unknown",
                    },)+
                    _ => "unknown",
                }
            }

            /// Arity rule for the kind; `None` for the synthetic kinds.
            #[must_use]
            pub fn arity(self) -> Option<Arity> {
                match self {
                    $(Self::$variant => Some($arity),)+
                    _ => None,
                }
            }

            /// Whether the command mutates backend state and must go to a master.
            #[must_use]
            pub fn is_write(self) -> bool {
                match self {
                    $(Self::$variant => $write,)+
                    _ => false,
                }
            }
        }
    };
}

command_table![
    // keys / strings, read side
    (Exists, b"exists", Arity::Exact(1), false),
    (Ttl, b"ttl", Arity::Exact(1), false),
    (Pttl, b"pttl", Arity::Exact(1), false),
    (Type, b"type", Arity::Exact(1), false),
    (Dump, b"dump", Arity::Exact(1), false),
    (Bitcount, b"bitcount", Arity::AtLeast(1), false),
    (Get, b"get", Arity::Exact(1), false),
    (Getbit, b"getbit", Arity::Exact(2), false),
    (Getrange, b"getrange", Arity::Exact(3), false),
    (Mget, b"mget", Arity::AtLeast(1), false),
    (Strlen, b"strlen", Arity::Exact(1), false),
    // hashes, read side
    (Hexists, b"hexists", Arity::Exact(2), false),
    (Hget, b"hget", Arity::Exact(2), false),
    (Hgetall, b"hgetall", Arity::Exact(1), false),
    (Hkeys, b"hkeys", Arity::Exact(1), false),
    (Hlen, b"hlen", Arity::Exact(1), false),
    (Hmget, b"hmget", Arity::AtLeast(1), false),
    (Hscan, b"hscan", Arity::AtLeast(1), false),
    (Hvals, b"hvals", Arity::Exact(1), false),
    // lists, read side
    (Lindex, b"lindex", Arity::Exact(2), false),
    (Llen, b"llen", Arity::Exact(1), false),
    (Lrange, b"lrange", Arity::Exact(3), false),
    // sets, read side
    (Srandmember, b"srandmember", Arity::AtLeast(1), false),
    (Sscan, b"sscan", Arity::AtLeast(1), false),
    (Sdiff, b"sdiff", Arity::AtLeast(1), false),
    (Sinter, b"sinter", Arity::AtLeast(1), false),
    (Scard, b"scard", Arity::Exact(1), false),
    (Sismember, b"sismember", Arity::Exact(2), false),
    (Smembers, b"smembers", Arity::Exact(1), false),
    // sorted sets, read side
    (Zcard, b"zcard", Arity::Exact(1), false),
    (Zcount, b"zcount", Arity::Exact(3), false),
    (Zlexcount, b"zlexcount", Arity::Exact(3), false),
    (Zrange, b"zrange", Arity::AtLeast(1), false),
    (Zrangebylex, b"zrangebylex", Arity::AtLeast(1), false),
    (Zrangebyscore, b"zrangebyscore", Arity::AtLeast(1), false),
    (Zrank, b"zrank", Arity::Exact(2), false),
    (Zrevrange, b"zrevrange", Arity::AtLeast(1), false),
    (Zrevrangebyscore, b"zrevrangebyscore", Arity::AtLeast(1), false),
    (Zrevrank, b"zrevrank", Arity::Exact(2), false),
    (Zscore, b"zscore", Arity::Exact(2), false),
    (Zscan, b"zscan", Arity::AtLeast(1), false),
    // keys, write side
    (Del, b"del", Arity::AtLeast(1), true),
    (Expire, b"expire", Arity::Exact(2), true),
    (Expireat, b"expireat", Arity::Exact(2), true),
    (Pexpire, b"pexpire", Arity::Exact(2), true),
    (Pexpireat, b"pexpireat", Arity::Exact(2), true),
    (Persist, b"persist", Arity::Exact(1), true),
    (Sort, b"sort", Arity::AtLeast(1), true),
    // strings, write side
    (Append, b"append", Arity::Exact(2), true),
    (Decr, b"decr", Arity::Exact(1), true),
    (Decrby, b"decrby", Arity::Exact(2), true),
    (Getset, b"getset", Arity::Exact(2), true),
    (Incr, b"incr", Arity::Exact(1), true),
    (Incrby, b"incrby", Arity::Exact(2), true),
    (Incrbyfloat, b"incrbyfloat", Arity::Exact(2), true),
    (Mset, b"mset", Arity::EvenAtLeast(2), true),
    (Psetex, b"psetex", Arity::Exact(3), true),
    (Restore, b"restore", Arity::Exact(3), true),
    (Set, b"set", Arity::AtLeast(1), true),
    (Setbit, b"setbit", Arity::Exact(3), true),
    (Setex, b"setex", Arity::Exact(3), true),
    (Setnx, b"setnx", Arity::Exact(2), true),
    (Setrange, b"setrange", Arity::Exact(3), true),
    (Sunion, b"sunion", Arity::AtLeast(1), true),
    // hashes, write side
    (Hdel, b"hdel", Arity::AtLeast(1), true),
    (Hincrby, b"hincrby", Arity::Exact(3), true),
    (Hincrbyfloat, b"hincrbyfloat", Arity::Exact(3), true),
    (Hmset, b"hmset", Arity::AtLeast(1), true),
    (Hset, b"hset", Arity::Exact(3), true),
    (Hsetnx, b"hsetnx", Arity::Exact(3), true),
    // lists, write side
    (Linsert, b"linsert", Arity::Exact(4), true),
    (Lpop, b"lpop", Arity::Exact(1), true),
    (Lpush, b"lpush", Arity::AtLeast(1), true),
    (Lpushx, b"lpushx", Arity::Exact(2), true),
    (Lrem, b"lrem", Arity::Exact(3), true),
    (Lset, b"lset", Arity::Exact(3), true),
    (Ltrim, b"ltrim", Arity::Exact(3), true),
    (Rpop, b"rpop", Arity::Exact(1), true),
    (Rpoplpush, b"rpoplpush", Arity::Exact(2), true),
    (Rpush, b"rpush", Arity::AtLeast(1), true),
    (Rpushx, b"rpushx", Arity::Exact(2), true),
    // hyperloglog
    (Pfadd, b"pfadd", Arity::AtLeast(1), true),
    (Pfcount, b"pfcount", Arity::Exact(1), false),
    (Pfmerge, b"pfmerge", Arity::AtLeast(1), true),
    // sets, write side
    (Sadd, b"sadd", Arity::AtLeast(1), true),
    (Sdiffstore, b"sdiffstore", Arity::AtLeast(1), true),
    (Sinterstore, b"sinterstore", Arity::AtLeast(1), true),
    (Smove, b"smove", Arity::Exact(3), true),
    (Spop, b"spop", Arity::Exact(1), true),
    (Srem, b"srem", Arity::AtLeast(1), true),
    (Sunionstore, b"sunionstore", Arity::AtLeast(1), true),
    // sorted sets, write side
    (Zadd, b"zadd", Arity::AtLeast(1), true),
    (Zincrby, b"zincrby", Arity::Exact(3), true),
    (Zinterstore, b"zinterstore", Arity::AtLeast(1), true),
    (Zrem, b"zrem", Arity::AtLeast(1), true),
    (Zremrangebyrank, b"zremrangebyrank", Arity::Exact(3), true),
    (Zremrangebylex, b"zremrangebylex", Arity::Exact(3), true),
    (Zremrangebyscore, b"zremrangebyscore", Arity::Exact(3), true),
    (Zunionstore, b"zunionstore", Arity::AtLeast(1), true),
    // scripting
    (Eval, b"eval", Arity::AtLeast(1), true),
    (Evalsha, b"evalsha", Arity::AtLeast(1), true),
    // connection-level, answered inline by the proxy
    (Ping, b"ping", Arity::Exact(0), false),
    (Quit, b"quit", Arity::Exact(0), false),
    (Auth, b"auth", Arity::Exact(1), false),
];

impl CommandKind {
    /// Classifies a command name and validates its argument count in one step.
    ///
    /// `n` counts arguments after the command name. Unknown names stay `Unknown`;
    /// arity violations map to `WrongArgumentsNumber`.
    #[must_use]
    pub fn classify(name: &[u8], n: usize) -> Self {
        let kind = Self::lookup(name);
        match kind.arity() {
            Some(arity) if arity.accepts(n) => kind,
            Some(_) => Self::WrongArgumentsNumber,
            None => kind,
        }
    }

    /// Whether the kind is one of the synthetic parse outcomes.
    #[must_use]
    pub fn is_synthetic(self) -> bool {
        matches!(self, Self::Unknown | Self::TooLarge | Self::WrongArgumentsNumber)
    }

    /// Metric labels for the `cmd` counter family.
    ///
    /// Some commands feed two series: their own name plus their data-type group,
    /// matching the dashboards this proxy ships with.
    #[must_use]
    pub fn stats_labels(self) -> &'static [&'static str] {
        match self {
            Self::Del => &["del"],
            Self::Get => &["get", "string"],
            Self::Set => &["set", "string"],
            Self::Mget => &["mget", "string"],
            Self::Mset => &["mset", "string"],
            Self::Sort => &["sort", "string"],
            Self::Setex | Self::Setnx | Self::Setrange | Self::Getrange | Self::Strlen => {
                &["string"]
            }
            Self::Bitcount | Self::Setbit | Self::Getbit => &["bitmap"],
            Self::Incr | Self::Decr | Self::Decrby | Self::Incrby | Self::Incrbyfloat => {
                &["incr_decr"]
            }
            Self::Hexists
            | Self::Hget
            | Self::Hgetall
            | Self::Hkeys
            | Self::Hlen
            | Self::Hmget
            | Self::Hmset
            | Self::Hdel
            | Self::Hincrby
            | Self::Hincrbyfloat
            | Self::Hset
            | Self::Hsetnx
            | Self::Hscan
            | Self::Hvals => &["hashs"],
            Self::Lrem => &["lrem", "lists"],
            Self::Lpush
            | Self::Rpush
            | Self::Rpushx
            | Self::Lpushx
            | Self::Lpop
            | Self::Rpop
            | Self::Rpoplpush
            | Self::Lrange
            | Self::Lset
            | Self::Ltrim
            | Self::Lindex
            | Self::Llen
            | Self::Linsert => &["lists"],
            Self::Sadd
            | Self::Spop
            | Self::Srem
            | Self::Sscan
            | Self::Smove
            | Self::Srandmember
            | Self::Scard
            | Self::Sismember
            | Self::Smembers
            | Self::Sunion
            | Self::Sdiff
            | Self::Sinter
            | Self::Sinterstore
            | Self::Sdiffstore
            | Self::Sunionstore => &["sets"],
            Self::Zadd
            | Self::Zcount
            | Self::Zincrby
            | Self::Zscan
            | Self::Zcard
            | Self::Zscore
            | Self::Zrange
            | Self::Zrank
            | Self::Zrangebyscore
            | Self::Zrevrange
            | Self::Zrangebylex
            | Self::Zrevrank
            | Self::Zinterstore
            | Self::Zrevrangebyscore
            | Self::Zunionstore
            | Self::Zremrangebyscore
            | Self::Zrem
            | Self::Zremrangebylex
            | Self::Zremrangebyrank => &["sortedsets"],
            _ => &["other"],
        }
    }
}
