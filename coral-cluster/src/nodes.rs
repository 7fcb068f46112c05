//! `CLUSTER NODES` parsing and the published topology view.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::slot::SlotRange;
use coral_common::ids::SlotId;

/// Link state column value for a reachable node.
pub const LINK_STATE_CONNECTED: &str = "connected";

/// Minimum surviving nodes for a snapshot to be trusted.
const MIN_NODES: usize = 3;

/// Role of a backend node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Owns slots, takes writes.
    Master,
    /// Follows a master, may take reads.
    Replica,
}

/// Topology parsing failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Fewer than the minimum usable nodes survived filtering.
    #[error("not enough nodes")]
    NotEnoughNodes,
}

/// One node as advertised by `CLUSTER NODES`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    /// Stable cluster id (hex, sha1-sized).
    pub name: String,
    /// `ip:port` used for client traffic.
    pub addr: String,
    /// IP portion of `addr`.
    pub ip: String,
    /// Port portion of `addr`.
    pub port: u16,
    /// Cluster bus port.
    pub cport: u16,
    /// Master or replica.
    pub role: NodeRole,
    /// For replicas, the master's cluster id.
    pub master_id: String,
    /// Raw flags column.
    pub flags: String,
    /// Unix time of the last ping sent.
    pub ping_sent: i64,
    /// Unix time of the last pong received.
    pub pong_received: i64,
    /// Last config epoch observed for this node.
    pub config_epoch: u64,
    /// Whether the cluster bus link is up.
    pub connected: bool,
    /// Software version reported by `INFO`.
    pub version: String,
    /// Owned slot ranges; empty for replicas.
    pub slots: Vec<SlotRange>,
}

/// One master with its attached replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replicaset {
    /// The slot-owning master.
    pub master: ClusterNode,
    /// Replicas whose `master_id` names the master.
    pub replicas: Vec<ClusterNode>,
}

/// Verification hook for nodes seen for the first time.
///
/// The production implementation runs a blocking `INFO` round-trip; tests stub it.
/// Returning `None` drops the node from the snapshot.
pub trait NodeVerifier {
    /// Returns the node's software version when the node is usable.
    fn verify(&self, node: &ClusterNode) -> Option<String>;
}

/// Verifier that admits every node, for bootstrapping and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllVerifier;

impl NodeVerifier for AcceptAllVerifier {
    fn verify(&self, _node: &ClusterNode) -> Option<String> {
        Some(String::new())
    }
}

/// The proxy's current view of cluster membership.
#[derive(Debug, Default)]
pub struct ClusterTopology {
    /// Known nodes keyed by `ip:port`.
    pub nodes: HashMap<String, ClusterNode>,
    /// Masters with their replicas, rebuilt on every accepted change.
    pub replicasets: Vec<Replicaset>,
    last_signature: String,
    server_changed: bool,
}

impl ClusterTopology {
    /// Creates an empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an accepted change is waiting to be applied by the ticker.
    #[must_use]
    pub fn server_changed(&self) -> bool {
        self.server_changed
    }

    /// Marks the pending change as applied.
    pub fn clear_server_changed(&mut self) {
        self.server_changed = false;
    }

    /// Ingests a parsed snapshot, rebuilding the view when membership changed.
    pub fn update(&mut self, all_nodes: Vec<ClusterNode>) {
        if !self.is_changed(&all_nodes) {
            return;
        }
        self.nodes = all_nodes
            .iter()
            .map(|node| (node.addr.clone(), node.clone()))
            .collect();
        self.replicasets = group_replicasets(all_nodes);
        self.server_changed = true;
    }

    /// Parses one `CLUSTER NODES` payload into a filtered node list.
    ///
    /// Nodes already known by address skip re-verification; new nodes are admitted
    /// only when `verifier` accepts them.
    ///
    /// # Errors
    ///
    /// Returns `TopologyError::NotEnoughNodes` when fewer than three nodes survive,
    /// in which case the previous view must be retained.
    pub fn parse(
        &self,
        payload: &str,
        verifier: &dyn NodeVerifier,
    ) -> Result<Vec<ClusterNode>, TopologyError> {
        let mut all_nodes = Vec::new();
        for line in payload.split('\n') {
            let columns: Vec<&str> = line.split(' ').collect();
            if columns.len() < 8 {
                if !line.trim().is_empty() {
                    warn!(line, "skip cluster node line: lack of columns");
                }
                continue;
            }
            let flags = columns[2];
            if flags.contains("noaddr") || flags.contains("handshake") {
                warn!(line, "skip cluster node: flagged noaddr or handshake");
                continue;
            }
            if flags.contains("fail") {
                warn!(line, "skip cluster node: flagged fail");
                continue;
            }
            if !flags.contains("master") && !flags.contains("slave") {
                warn!(line, "skip cluster node: neither master nor slave");
                continue;
            }
            if columns[7].contains("disconnected") {
                warn!(line, "skip cluster node: link disconnected");
                continue;
            }

            let Some(mut node) = parse_node_line(&columns) else {
                warn!(line, "skip cluster node: malformed line");
                continue;
            };

            if let Some(known) = self.nodes.get(&node.addr) {
                node.version = known.version.clone();
            } else {
                match verifier.verify(&node) {
                    Some(version) => node.version = version,
                    None => {
                        warn!(addr = %node.addr, "skip cluster node: verification failed");
                        continue;
                    }
                }
            }

            all_nodes.push(node);
        }

        if all_nodes.len() < MIN_NODES {
            return Err(TopologyError::NotEnoughNodes);
        }
        Ok(all_nodes)
    }

    fn is_changed(&mut self, all_nodes: &[ClusterNode]) -> bool {
        let mut changed = all_nodes.len() != self.nodes.len();

        let signature = signature(all_nodes);
        if signature != self.last_signature {
            changed = true;
            info!(
                last = %self.last_signature,
                next = %signature,
                "cluster membership change detected"
            );
        }
        self.last_signature = signature;
        changed
    }
}

/// Canonical membership signature: sorted `addr#role#slots` for masters and
/// `addr#role` for replicas, comma-joined.
#[must_use]
pub fn signature(all_nodes: &[ClusterNode]) -> String {
    let mut names: Vec<String> = all_nodes
        .iter()
        .map(|node| match node.role {
            NodeRole::Master => {
                let slots: Vec<String> = node
                    .slots
                    .iter()
                    .map(|range| format!("{}-{}", range.start, range.end))
                    .collect();
                format!("{}#master#{}", node.addr, slots.join(";"))
            }
            NodeRole::Replica => format!("{}#replica", node.addr),
        })
        .collect();
    names.sort();
    names.join(",")
}

/// Groups nodes into replicasets: masters first, replicas attached by `master_id`.
#[must_use]
pub fn group_replicasets(all_nodes: Vec<ClusterNode>) -> Vec<Replicaset> {
    let mut replicasets: Vec<Replicaset> = all_nodes
        .iter()
        .filter(|node| node.role == NodeRole::Master)
        .map(|master| Replicaset {
            master: master.clone(),
            replicas: Vec::new(),
        })
        .collect();

    for node in all_nodes {
        if node.role != NodeRole::Replica {
            continue;
        }
        if let Some(replicaset) = replicasets
            .iter_mut()
            .find(|replicaset| replicaset.master.name == node.master_id)
        {
            replicaset.replicas.push(node);
        }
    }
    replicasets
}

fn parse_node_line(columns: &[&str]) -> Option<ClusterNode> {
    let (addr, ip, port, cport) = parse_addr(columns[1])?;
    let role = if columns[2].contains("master") {
        NodeRole::Master
    } else {
        NodeRole::Replica
    };

    let mut node = ClusterNode {
        name: columns[0].to_owned(),
        addr,
        ip,
        port,
        cport,
        role,
        master_id: columns[3].to_owned(),
        flags: columns[2].to_owned(),
        ping_sent: columns[4].parse().unwrap_or(0),
        pong_received: columns[5].parse().unwrap_or(0),
        config_epoch: columns[6].parse().unwrap_or(0),
        connected: columns[7] == LINK_STATE_CONNECTED,
        version: String::new(),
        slots: Vec::new(),
    };

    if node.role == NodeRole::Replica {
        return Some(node);
    }
    if columns.len() < 9 {
        return None;
    }
    for column in &columns[8..] {
        // Bracketed entries are in-progress slot migrations, not ownership.
        if column.starts_with('[') {
            continue;
        }
        node.slots.push(parse_slot_range(column)?);
    }
    Some(node)
}

/// Splits `ip:port@cport` into the address forms the proxy keys on.
fn parse_addr(column: &str) -> Option<(String, String, u16, u16)> {
    let (ip, ports) = column.split_once(':')?;
    if ip.is_empty() {
        return None;
    }
    let (port_str, cport_str) = match ports.split_once('@') {
        Some((port, cport)) => (port, cport),
        None => (ports, ""),
    };
    let port: u16 = port_str.parse().ok()?;
    let cport: u16 = cport_str.parse().unwrap_or(0);
    Some((format!("{ip}:{port_str}"), ip.to_owned(), port, cport))
}

fn parse_slot_range(column: &str) -> Option<SlotRange> {
    match column.split_once('-') {
        Some((start, end)) => {
            let start: SlotId = start.parse().ok()?;
            let end: SlotId = end.parse().ok()?;
            Some(SlotRange { start, end })
        }
        None => {
            let slot: SlotId = column.parse().ok()?;
            Some(SlotRange {
                start: slot,
                end: slot,
            })
        }
    }
}
