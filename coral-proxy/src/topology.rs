//! Topology refresh plumbing: the bounded payload queue, live node
//! verification, and the background health prober.
//!
//! `CLUSTER NODES` probe replies arrive on shard connections as anonymous
//! fragments; the loop parks their payloads here and the ticker consumes them.
//! The health prober is the only helper running off the loop thread; it talks to
//! the loop exclusively over channels, so pool state stays loop-owned.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use coral_cluster::nodes::{ClusterNode, NodeRole, NodeVerifier};
use coral_cluster::probe::ProbeClient;
use coral_codec::parse_len;

/// Literal `CLUSTER NODES` request written on topology probe connections.
pub const CLUSTER_NODES_REQUEST: &[u8] = b"*2\r\n$7\r\ncluster\r\n$5\r\nnodes\r\n";

/// Upper bound on an accepted `CLUSTER NODES` payload.
const MAX_NODES_PAYLOAD: i64 = 163_840;

/// Queue capacity; refreshes are periodic, so loss under pressure is fine.
const QUEUE_CAPACITY: usize = 3;

/// Probe cadence of the health prober.
const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// How long a double probe failure bans an address.
const PROBE_BAN: Duration = Duration::from_secs(60);

/// Bounded queue of raw `CLUSTER NODES` reply payloads.
#[derive(Debug, Default)]
pub struct TopologyQueue {
    payloads: Vec<Vec<u8>>,
    dropped: u64,
}

impl TopologyQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks one payload; full queues drop and count instead of blocking.
    pub fn push(&mut self, payload: Vec<u8>) {
        if self.payloads.len() >= QUEUE_CAPACITY {
            self.dropped += 1;
            warn!(dropped = self.dropped, "topology payload queue full, dropping");
            return;
        }
        self.payloads.push(payload);
    }

    /// Takes every parked payload.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.payloads)
    }

    /// Payloads dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Extracts the text payload of a `CLUSTER NODES` bulk reply.
///
/// Returns `None` for non-bulk replies (`+OK`, nil) and oversized or truncated
/// payloads.
#[must_use]
pub fn extract_bulk_payload(reply: &[u8]) -> Option<String> {
    if reply.len() < 3 {
        return None;
    }
    if reply.starts_with(b"+") || reply.starts_with(b"$-1") {
        return None;
    }
    if reply[0] != b'$' {
        return None;
    }
    let header_end = reply.iter().position(|byte| *byte == b'\n')?;
    let length = parse_len(&reply[1..header_end.checked_sub(1)?]).ok()?;
    if length < 0 || length > MAX_NODES_PAYLOAD {
        error!(length, "cluster nodes payload rejected by size gate");
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let length = length as usize;
    let payload = reply.get(header_end + 1..header_end + 1 + length)?;
    Some(String::from_utf8_lossy(payload).into_owned())
}

/// Verifier that runs the blocking `INFO` round-trip against new nodes.
#[derive(Debug, Clone)]
pub struct LiveNodeVerifier {
    /// Backend password for the probe dial.
    pub password: String,
    /// Dial timeout for the probe connection.
    pub connect_timeout: Duration,
}

impl NodeVerifier for LiveNodeVerifier {
    fn verify(&self, node: &ClusterNode) -> Option<String> {
        let mut client = ProbeClient::connect(
            &node.addr,
            &self.password,
            self.connect_timeout,
            Duration::from_secs(3),
        )
        .map_err(|probe_error| {
            warn!(addr = %node.addr, error = %probe_error, "node info dial failed");
        })
        .ok()?;
        let info = client
            .info()
            .map_err(|probe_error| {
                warn!(addr = %node.addr, error = %probe_error, "node info round-trip failed");
            })
            .ok()?;
        if node.role == NodeRole::Replica {
            if info.loading {
                warn!(addr = %node.addr, "skip replica: still loading");
                return None;
            }
            if info.master_link_status != "up" {
                warn!(addr = %node.addr, "skip replica: master link down");
                return None;
            }
        }
        Some(info.version)
    }
}

/// Health verdict for one probed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Probed backend address.
    pub addr: String,
    /// Probe (or its one retry) answered `PONG`.
    pub healthy: bool,
    /// Ban period the loop should apply when unhealthy.
    pub ban_for: Duration,
}

/// Handle to the background health prober thread.
#[derive(Debug)]
pub struct HealthProber {
    addr_tx: Sender<Vec<String>>,
    report_rx: Receiver<HealthReport>,
}

impl HealthProber {
    /// Spawns the prober; it exits when this handle is dropped.
    #[must_use]
    pub fn spawn(password: String, connect_timeout: Duration) -> Self {
        let (addr_tx, addr_rx) = mpsc::channel::<Vec<String>>();
        let (report_tx, report_rx) = mpsc::channel::<HealthReport>();

        let _ = thread::Builder::new()
            .name("coral-health-probe".to_owned())
            .spawn(move || {
                probe_loop(&addr_rx, &report_tx, &password, connect_timeout);
            });

        Self { addr_tx, report_rx }
    }

    /// Replaces the probed address list after a topology change.
    pub fn update_addrs(&self, addrs: Vec<String>) {
        let _ = self.addr_tx.send(addrs);
    }

    /// Takes every verdict produced since the last drain.
    pub fn drain_reports(&self) -> Vec<HealthReport> {
        let mut reports = Vec::new();
        while let Ok(report) = self.report_rx.try_recv() {
            reports.push(report);
        }
        reports
    }
}

fn probe_loop(
    addr_rx: &Receiver<Vec<String>>,
    report_tx: &Sender<HealthReport>,
    password: &str,
    connect_timeout: Duration,
) {
    let mut addrs: Vec<String> = Vec::new();
    loop {
        // Collapse queued updates to the latest list; a disconnect ends the thread.
        loop {
            match addr_rx.try_recv() {
                Ok(update) => addrs = update,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        for addr in &addrs {
            let healthy = ping(addr, password, connect_timeout) || {
                thread::sleep(PROBE_INTERVAL);
                ping(addr, password, connect_timeout)
            };
            let report = HealthReport {
                addr: addr.clone(),
                healthy,
                ban_for: PROBE_BAN,
            };
            if report_tx.send(report).is_err() {
                return;
            }
        }

        thread::sleep(PROBE_INTERVAL);
    }
}

fn ping(addr: &str, password: &str, connect_timeout: Duration) -> bool {
    match ProbeClient::connect(addr, password, connect_timeout, Duration::from_secs(3)) {
        Ok(mut client) => client.ping().is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{extract_bulk_payload, TopologyQueue, CLUSTER_NODES_REQUEST};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn request_bytes_are_the_cluster_nodes_literal() {
        assert_that!(
            CLUSTER_NODES_REQUEST,
            eq(b"*2\r\n$7\r\ncluster\r\n$5\r\nnodes\r\n")
        );
    }

    #[rstest]
    fn queue_drops_beyond_capacity() {
        let mut queue = TopologyQueue::new();
        for index in 0..5 {
            queue.push(vec![index]);
        }
        assert_that!(queue.dropped(), eq(2));
        assert_that!(queue.drain().len(), eq(3));
        assert_that!(queue.drain().len(), eq(0));
    }

    #[rstest]
    fn bulk_payload_extraction_strips_header_and_terminator() {
        let reply = b"$20\r\n0123456789\nabcdefghi\r\n";
        let payload = extract_bulk_payload(reply).expect("bulk payload must extract");
        assert_that!(payload, eq("0123456789\nabcdefghi"));
    }

    #[rstest]
    #[case(b"+OK\r\n".as_slice())]
    #[case(b"$-1\r\n".as_slice())]
    #[case(b":1\r\n".as_slice())]
    #[case(b"$5\r\nab".as_slice())]
    fn non_bulk_or_truncated_replies_are_ignored(#[case] reply: &[u8]) {
        assert_that!(extract_bulk_payload(reply), eq(&None));
    }
}
