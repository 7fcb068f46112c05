//! Engine composition: configuration snapshot, pools, topology view, codecs,
//! id allocators and the shutdown signal.
//!
//! The engine is plain state owned by the event loop; everything here is
//! accessed from the loop thread only. The single multi-threaded touchpoint is
//! the health prober, which communicates over channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::warn;

use coral_cluster::nodes::ClusterTopology;
use coral_cluster::SlotMap;
use coral_codec::command::CommandKind;
use coral_common::config::ProxyConfig;
use coral_common::ids::SlotId;
use coral_common::metrics::ProxyStats;

use crate::codec_client::ClientCodec;
use crate::codec_shard::ShardCodec;
use crate::message::{FragmentPool, MessagePool, TimeoutIndex};
use crate::pool::Pool;
use crate::topology::{HealthProber, TopologyQueue};

/// IP admission predicate, provided by the external whitelist watcher.
pub trait ClientAuthorizer {
    /// Whether a client dialing from `ip` may connect.
    fn is_authorized(&self, ip: &str) -> bool;
}

/// Authorizer admitting every client, used when no whitelist is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ClientAuthorizer for AllowAll {
    fn is_authorized(&self, _ip: &str) -> bool {
        true
    }
}

/// Static IP whitelist.
///
/// The production whitelist is maintained by the external watcher, which
/// rebuilds the engine's authorizer when its file changes; this type is the
/// snapshot it hands over. A disabled whitelist admits everyone.
#[derive(Debug, Clone, Default)]
pub struct IpWhitelist {
    enabled: bool,
    ips: std::collections::HashSet<String>,
}

impl IpWhitelist {
    /// Builds a whitelist from the allowed addresses.
    #[must_use]
    pub fn new(enabled: bool, ips: impl IntoIterator<Item = String>) -> Self {
        Self {
            enabled,
            ips: ips.into_iter().collect(),
        }
    }
}

impl ClientAuthorizer for IpWhitelist {
    fn is_authorized(&self, ip: &str) -> bool {
        !self.enabled || self.ips.contains(ip)
    }
}

/// Cooperative shutdown flag shared with whoever supervises the process.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

/// How often [`ShutdownSignal::stop`] re-checks loop exit.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl ShutdownSignal {
    /// Creates an unsignaled flag pair.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the loop to drain and exit.
    pub fn signal_shutdown(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Marks the loop as fully stopped; called by the loop on exit.
    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Whether the loop already exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Signals shutdown and waits for the loop to exit, polling twice a second.
    ///
    /// Returns `false` when `deadline` lapsed before the loop stopped.
    pub fn stop(&self, deadline: Option<Duration>) -> bool {
        self.signal_shutdown();
        let started = Instant::now();
        loop {
            if self.is_stopped() {
                return true;
            }
            if let Some(deadline) = deadline {
                if started.elapsed() >= deadline {
                    return false;
                }
            }
            std::thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
    }
}

/// Where a routed command should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Backend address to acquire a connection for.
    pub addr: String,
    /// Whether the target is a replica (affects the dial prelude).
    pub is_replica: bool,
}

/// Loop-owned engine state.
pub struct Engine {
    /// Configuration snapshot the process booted with.
    pub config: ProxyConfig,
    /// Metrics sink, shared with the external web sidecar.
    pub stats: Arc<ProxyStats>,
    /// Per-address connection pools.
    pub pools: HashMap<String, Pool>,
    /// Iteration list of known addresses, refreshed on topology change.
    pub addrs: Vec<String>,
    /// Current cluster membership view.
    pub topology: ClusterTopology,
    /// Dense slot → replicaset-index table.
    pub slot_map: SlotMap,
    /// Parked `CLUSTER NODES` payloads.
    pub topo_queue: TopologyQueue,
    /// Message allocator/recycler.
    pub messages: MessagePool,
    /// Fragment id allocator.
    pub frags: FragmentPool,
    /// Deadline index of in-flight fragments.
    pub timeouts: TimeoutIndex,
    /// Client-side decoder.
    pub client_codec: ClientCodec,
    /// Shard-side decoder.
    pub shard_codec: ShardCodec,
    /// Serialized `AUTH` command for shard preludes; empty without a password.
    pub auth_prelude: Vec<u8>,
    /// Client admission predicate.
    pub authorizer: Box<dyn ClientAuthorizer>,
    /// Background health prober handle.
    pub prober: HealthProber,
    /// Shutdown flag shared with the supervisor.
    pub shutdown: ShutdownSignal,
}

impl Engine {
    /// Builds the engine from a validated configuration snapshot.
    #[must_use]
    pub fn new(config: ProxyConfig, authorizer: Box<dyn ClientAuthorizer>) -> Self {
        let seeds = config.seed_addrs();
        let mut pools = HashMap::new();
        for addr in &seeds {
            let _ = pools.insert(
                addr.clone(),
                Pool::new(addr.clone(), false, config.redis.server_connections),
            );
        }

        let auth_prelude = if config.redis.password.is_empty() {
            Vec::new()
        } else {
            let password = config.redis.password.as_bytes();
            let mut prelude = Vec::with_capacity(password.len() + 24);
            prelude.extend_from_slice(b"*2\r\n$4\r\nauth\r\n$");
            prelude.extend_from_slice(password.len().to_string().as_bytes());
            prelude.extend_from_slice(b"\r\n");
            prelude.extend_from_slice(password);
            prelude.extend_from_slice(b"\r\n");
            prelude
        };

        let prober = HealthProber::spawn(
            config.redis.password.clone(),
            Duration::from_millis(config.redis.conn_timeout),
        );
        prober.update_addrs(seeds.clone());

        let msg_max = config.redis.msg_max_length_limit;
        Self {
            config,
            stats: Arc::new(ProxyStats::new()),
            pools,
            addrs: seeds,
            topology: ClusterTopology::new(),
            slot_map: SlotMap::new(),
            topo_queue: TopologyQueue::new(),
            messages: MessagePool::new(),
            frags: FragmentPool::new(),
            timeouts: TimeoutIndex::new(),
            client_codec: ClientCodec::new(msg_max),
            shard_codec: ShardCodec::new(msg_max),
            auth_prelude,
            authorizer,
            prober,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Per-request timeout, `None` when the sweep is disabled.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        if self.config.redis.timeout == 0 {
            None
        } else {
            Some(Duration::from_millis(self.config.redis.timeout))
        }
    }

    /// Base backoff for banning an unreachable backend.
    #[must_use]
    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.config.redis.server_retry_timeout.max(1))
    }

    /// Resolves the backend address for one command on one slot.
    ///
    /// Writes and replica-disabled deployments pin to the master. Reads collect
    /// the live replicas first and pick one uniformly; with none live they fall
    /// back to the master. Returns `None` when the slot has no known owner.
    pub fn route(&mut self, kind: CommandKind, slot: SlotId) -> Option<RouteTarget> {
        let index = self.slot_map.get(slot)?;
        let replicaset = self.topology.replicasets.get(index)?;

        if self.config.redis.disable_slave || kind.is_write() {
            return Some(RouteTarget {
                addr: replicaset.master.addr.clone(),
                is_replica: false,
            });
        }

        let now = Instant::now();
        let mut live: Vec<&str> = Vec::with_capacity(replicaset.replicas.len());
        for replica in &replicaset.replicas {
            match self.pools.get_mut(&replica.addr) {
                Some(pool) => {
                    if pool.replica_is_live(now) {
                        live.push(replica.addr.as_str());
                    }
                }
                None => warn!(addr = %replica.addr, "replica has no pool, skipping"),
            }
        }

        if live.is_empty() {
            return Some(RouteTarget {
                addr: replicaset.master.addr.clone(),
                is_replica: false,
            });
        }
        let pick = rand::thread_rng().gen_range(0..live.len());
        Some(RouteTarget {
            addr: live[pick].to_owned(),
            is_replica: true,
        })
    }

    /// Picks a random known address for the periodic topology probe.
    #[must_use]
    pub fn random_addr(&self) -> Option<&str> {
        if self.addrs.is_empty() {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..self.addrs.len());
        Some(self.addrs[pick].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{AllowAll, ClientAuthorizer, Engine, ShutdownSignal};
    use coral_cluster::nodes::{ClusterNode, NodeRole, Replicaset};
    use coral_cluster::SlotRange;
    use coral_codec::command::CommandKind;
    use coral_common::config::ProxyConfig;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::time::{Duration, Instant};

    fn test_config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.redis.servers = "127.0.0.1:7000".to_owned();
        config
    }

    fn node(addr: &str, role: NodeRole, name: &str, master_id: &str) -> ClusterNode {
        ClusterNode {
            name: name.to_owned(),
            addr: addr.to_owned(),
            ip: "127.0.0.1".to_owned(),
            port: 7000,
            cport: 17000,
            role,
            master_id: master_id.to_owned(),
            flags: String::new(),
            ping_sent: 0,
            pong_received: 0,
            config_epoch: 0,
            connected: true,
            version: String::new(),
            slots: if role == NodeRole::Master {
                vec![SlotRange { start: 0, end: 16383 }]
            } else {
                Vec::new()
            },
        }
    }

    fn engine_with_replicaset() -> Engine {
        let mut engine = Engine::new(test_config(), Box::new(AllowAll));
        let master = node("127.0.0.1:7000", NodeRole::Master, "m1", "-");
        let replica = node("127.0.0.1:7004", NodeRole::Replica, "r1", "m1");
        engine.topology.replicasets = vec![Replicaset {
            master,
            replicas: vec![replica],
        }];
        for slot in 0..coral_common::ids::SLOT_COUNT {
            #[allow(clippy::cast_possible_truncation)]
            engine.slot_map.set(slot as u16, 0);
        }
        let _ = engine.pools.insert(
            "127.0.0.1:7004".to_owned(),
            crate::pool::Pool::new("127.0.0.1:7004".to_owned(), true, 1),
        );
        engine
    }

    #[rstest]
    fn writes_route_to_master() {
        let mut engine = engine_with_replicaset();
        let target = engine
            .route(CommandKind::Set, 100)
            .expect("owned slot must route");
        assert_that!(target.addr, eq("127.0.0.1:7000"));
        assert_that!(target.is_replica, eq(false));
    }

    #[rstest]
    fn reads_route_to_live_replica() {
        let mut engine = engine_with_replicaset();
        let target = engine
            .route(CommandKind::Get, 100)
            .expect("owned slot must route");
        assert_that!(target.addr, eq("127.0.0.1:7004"));
        assert_that!(target.is_replica, eq(true));
    }

    #[rstest]
    fn banned_replica_falls_back_to_master() {
        let mut engine = engine_with_replicaset();
        {
            let pool = engine
                .pools
                .get_mut("127.0.0.1:7004")
                .expect("replica pool exists");
            pool.auto_ban = true;
            pool.ban_until = Some(Instant::now() + Duration::from_secs(60));
        }
        let target = engine
            .route(CommandKind::Get, 100)
            .expect("owned slot must route");
        assert_that!(target.addr, eq("127.0.0.1:7000"));
        assert_that!(target.is_replica, eq(false));
    }

    #[rstest]
    fn disable_slave_pins_reads_to_master() {
        let mut config = test_config();
        config.redis.disable_slave = true;
        let mut engine = Engine::new(config, Box::new(AllowAll));
        let replicaset = engine_with_replicaset().topology.replicasets.remove(0);
        engine.topology.replicasets = vec![replicaset];
        engine.slot_map.set(100, 0);

        let target = engine
            .route(CommandKind::Get, 100)
            .expect("owned slot must route");
        assert_that!(target.is_replica, eq(false));
    }

    #[rstest]
    fn unowned_slot_does_not_route() {
        let mut engine = Engine::new(test_config(), Box::new(AllowAll));
        assert_that!(engine.route(CommandKind::Get, 5), eq(&None));
    }

    #[rstest]
    fn auth_prelude_serializes_the_password() {
        let mut config = test_config();
        config.redis.password = "secret".to_owned();
        let engine = Engine::new(config, Box::new(AllowAll));
        assert_that!(
            &engine.auth_prelude,
            eq(&b"*2\r\n$4\r\nauth\r\n$6\r\nsecret\r\n".to_vec())
        );
    }

    #[rstest]
    fn allow_all_admits_any_ip() {
        assert_that!(AllowAll.is_authorized("10.0.0.1"), eq(true));
    }

    #[rstest]
    fn whitelist_gates_only_when_enabled() {
        let open = super::IpWhitelist::new(false, Vec::new());
        assert_that!(open.is_authorized("10.0.0.1"), eq(true));

        let gated = super::IpWhitelist::new(true, vec!["10.0.0.1".to_owned()]);
        assert_that!(gated.is_authorized("10.0.0.1"), eq(true));
        assert_that!(gated.is_authorized("10.0.0.2"), eq(false));
    }

    #[rstest]
    fn shutdown_signal_round_trips() {
        let signal = ShutdownSignal::new();
        assert_that!(signal.is_signaled(), eq(false));
        signal.signal_shutdown();
        assert_that!(signal.is_signaled(), eq(true));
        signal.mark_stopped();
        assert_that!(signal.stop(Some(Duration::from_millis(1))), eq(true));
    }
}
