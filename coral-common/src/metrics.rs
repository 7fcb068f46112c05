//! Prometheus-style metric primitives and the proxy's stats sink.
//!
//! Counters and gauges are plain atomics; labeled variants keep one atomic per label
//! value behind a `parking_lot` lock. The histogram stores cumulative bucket counts
//! the way the exposition format expects them. Rendering to exposition text is done
//! by the external web sidecar via [`ProxyStats::render_prometheus`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Creates a zeroed counter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increments the counter by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter by `n`.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge holding one signed value.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Creates a zeroed gauge.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    /// Replaces the gauge value.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A counter family keyed by one label value.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    values: RwLock<HashMap<String, AtomicU64>>,
}

impl LabeledCounter {
    /// Creates an empty family.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for `label` by one, creating it on first use.
    pub fn inc(&self, label: &str) {
        if let Some(value) = self.values.read().get(label) {
            value.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.values
            .write()
            .entry(label.to_owned())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the counter for `label`, zero when the label never fired.
    #[must_use]
    pub fn get(&self, label: &str) -> u64 {
        self.values
            .read()
            .get(label)
            .map_or(0, |value| value.load(Ordering::Relaxed))
    }

    /// Returns a snapshot of every label with its value.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .values
            .read()
            .iter()
            .map(|(label, value)| (label.clone(), value.load(Ordering::Relaxed)))
            .collect();
        entries.sort();
        entries
    }
}

/// A gauge family keyed by one label value.
#[derive(Debug, Default)]
pub struct LabeledGauge {
    values: RwLock<HashMap<String, AtomicI64>>,
}

impl LabeledGauge {
    /// Creates an empty family.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the gauge for `label`, creating it on first use.
    pub fn set(&self, label: &str, value: i64) {
        if let Some(slot) = self.values.read().get(label) {
            slot.store(value, Ordering::Relaxed);
            return;
        }
        self.values
            .write()
            .entry(label.to_owned())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Removes a label, used when a backend address disappears from the topology.
    pub fn remove(&self, label: &str) {
        let _ = self.values.write().remove(label);
    }

    /// Returns the gauge for `label`, zero when the label was never set.
    #[must_use]
    pub fn get(&self, label: &str) -> i64 {
        self.values
            .read()
            .get(label)
            .map_or(0, |value| value.load(Ordering::Relaxed))
    }

    /// Returns a snapshot of every label with its value.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .values
            .read()
            .iter()
            .map(|(label, value)| (label.clone(), value.load(Ordering::Relaxed)))
            .collect();
        entries.sort();
        entries
    }
}

/// A histogram with fixed upper bounds, observed in milliseconds.
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Creates a histogram over the given upper bounds, which must be sorted.
    #[must_use]
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_millis: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records one observation in milliseconds.
    pub fn observe(&self, millis: f64) {
        for (index, bound) in self.bounds.iter().enumerate() {
            if millis <= *bound {
                self.buckets[index].fetch_add(1, Ordering::Relaxed);
            }
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        self.sum_millis
            .fetch_add(millis.max(0.0).round() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total number of observations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of observed milliseconds, rounded per observation.
    #[must_use]
    pub fn sum_millis(&self) -> u64 {
        self.sum_millis.load(Ordering::Relaxed)
    }

    /// Cumulative count at each configured bound.
    #[must_use]
    pub fn bucket_counts(&self) -> Vec<(f64, u64)> {
        self.bounds
            .iter()
            .zip(self.buckets.iter())
            .map(|(bound, bucket)| (*bound, bucket.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Latency buckets for proxied requests, in milliseconds.
pub const REQUEST_LATENCY_BUCKETS: &[f64] = &[10.0, 20.0, 50.0, 100.0, 200.0, 500.0];

/// The proxy metrics sink; names are stable because dashboards key on them.
#[derive(Debug)]
pub struct ProxyStats {
    /// Connections ever accepted or dialed.
    pub total_connections: Counter,
    /// Client requests successfully parsed.
    pub total_requests: Counter,
    /// Clients that closed their side first.
    pub client_connections_client_eof: Counter,
    /// Client connections torn down on error.
    pub client_connections_client_err: Counter,
    /// Backend closed the connection, by address.
    pub redis_connections_eof: LabeledCounter,
    /// Backend connection errors, by address.
    pub redis_connections_err: LabeledCounter,
    /// Backend dial failures, by address.
    pub redis_connections_create_conn_error: LabeledCounter,
    /// Requests by command group.
    pub cmd: LabeledCounter,
    /// Multi-key fragmenting commands, by command name.
    pub fragments: LabeledCounter,
    /// Current connections by type (`client`/`server`/`total`).
    pub curr_connections: LabeledGauge,
    /// Active backend connections, by address.
    pub redis_connections_active: LabeledGauge,
    /// Timeout index health (`length`/`depth`/`stddev`).
    pub timeout_tree: LabeledGauge,
    /// End-to-end request latency in milliseconds.
    pub request_latency: Histogram,
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStats {
    /// Creates a zeroed sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_connections: Counter::new(),
            total_requests: Counter::new(),
            client_connections_client_eof: Counter::new(),
            client_connections_client_err: Counter::new(),
            redis_connections_eof: LabeledCounter::new(),
            redis_connections_err: LabeledCounter::new(),
            redis_connections_create_conn_error: LabeledCounter::new(),
            cmd: LabeledCounter::new(),
            fragments: LabeledCounter::new(),
            curr_connections: LabeledGauge::new(),
            redis_connections_active: LabeledGauge::new(),
            timeout_tree: LabeledGauge::new(),
            request_latency: Histogram::new(REQUEST_LATENCY_BUCKETS),
        }
    }

    /// Renders every metric in Prometheus exposition format under the given namespace.
    #[must_use]
    pub fn render_prometheus(&self, namespace: &str) -> String {
        let mut out = String::new();
        render_counter(&mut out, namespace, "total_connections", &self.total_connections);
        render_counter(&mut out, namespace, "total_requests", &self.total_requests);
        render_counter(
            &mut out,
            namespace,
            "client_connections_client_eof",
            &self.client_connections_client_eof,
        );
        render_counter(
            &mut out,
            namespace,
            "client_connections_client_err",
            &self.client_connections_client_err,
        );
        render_labeled_counter(&mut out, namespace, "redis_connections_eof", "addr", &self.redis_connections_eof);
        render_labeled_counter(&mut out, namespace, "redis_connections_err", "addr", &self.redis_connections_err);
        render_labeled_counter(
            &mut out,
            namespace,
            "redis_connections_create_conn_error",
            "addr",
            &self.redis_connections_create_conn_error,
        );
        render_labeled_counter(&mut out, namespace, "cmd", "cmd", &self.cmd);
        render_labeled_counter(&mut out, namespace, "fragments", "cmd", &self.fragments);
        render_labeled_gauge(&mut out, namespace, "curr_connections", "type", &self.curr_connections);
        render_labeled_gauge(
            &mut out,
            namespace,
            "redis_connections_active",
            "addr",
            &self.redis_connections_active,
        );
        render_labeled_gauge(&mut out, namespace, "timeout_tree", "type", &self.timeout_tree);

        let name = format!("{namespace}_request_latency");
        out.push_str(&format!("# TYPE {name} histogram\n"));
        for (bound, count) in self.request_latency.bucket_counts() {
            out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} {count}\n"));
        }
        out.push_str(&format!(
            "{name}_bucket{{le=\"+Inf\"}} {}\n",
            self.request_latency.count()
        ));
        out.push_str(&format!("{name}_sum {}\n", self.request_latency.sum_millis()));
        out.push_str(&format!("{name}_count {}\n", self.request_latency.count()));
        out
    }
}

fn render_counter(out: &mut String, namespace: &str, name: &str, counter: &Counter) {
    out.push_str(&format!(
        "# TYPE {namespace}_{name} counter\n{namespace}_{name} {}\n",
        counter.get()
    ));
}

fn render_labeled_counter(
    out: &mut String,
    namespace: &str,
    name: &str,
    label: &str,
    counter: &LabeledCounter,
) {
    out.push_str(&format!("# TYPE {namespace}_{name} counter\n"));
    for (value, count) in counter.snapshot() {
        out.push_str(&format!("{namespace}_{name}{{{label}=\"{value}\"}} {count}\n"));
    }
}

fn render_labeled_gauge(
    out: &mut String,
    namespace: &str,
    name: &str,
    label: &str,
    gauge: &LabeledGauge,
) {
    out.push_str(&format!("# TYPE {namespace}_{name} gauge\n"));
    for (value, current) in gauge.snapshot() {
        out.push_str(&format!("{namespace}_{name}{{{label}=\"{value}\"}} {current}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::{Counter, Histogram, LabeledCounter, LabeledGauge, ProxyStats, REQUEST_LATENCY_BUCKETS};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn counter_accumulates() {
        let counter = Counter::new();
        counter.inc();
        counter.inc_by(4);
        assert_that!(counter.get(), eq(5));
    }

    #[rstest]
    fn labeled_counter_isolates_labels() {
        let counter = LabeledCounter::new();
        counter.inc("get");
        counter.inc("get");
        counter.inc("set");
        assert_that!(counter.get("get"), eq(2));
        assert_that!(counter.get("set"), eq(1));
        assert_that!(counter.get("del"), eq(0));
    }

    #[rstest]
    fn labeled_gauge_supports_removal() {
        let gauge = LabeledGauge::new();
        gauge.set("127.0.0.1:7000", 3);
        gauge.remove("127.0.0.1:7000");
        assert_that!(gauge.get("127.0.0.1:7000"), eq(0));
    }

    #[rstest]
    fn histogram_buckets_are_cumulative() {
        let histogram = Histogram::new(REQUEST_LATENCY_BUCKETS);
        histogram.observe(5.0);
        histogram.observe(30.0);
        histogram.observe(700.0);

        let buckets = histogram.bucket_counts();
        assert_that!(buckets[0], eq((10.0, 1)));
        assert_that!(buckets[2], eq((50.0, 2)));
        assert_that!(buckets[5], eq((500.0, 2)));
        assert_that!(histogram.count(), eq(3));
    }

    #[rstest]
    fn render_includes_stable_metric_names() {
        let stats = ProxyStats::new();
        stats.total_requests.inc();
        stats.cmd.inc("string");
        stats.request_latency.observe(12.0);

        let text = stats.render_prometheus("coral");
        assert_that!(text.contains("coral_total_requests 1"), eq(true));
        assert_that!(text.contains("coral_cmd{cmd=\"string\"} 1"), eq(true));
        assert_that!(text.contains("coral_request_latency_bucket{le=\"+Inf\"} 1"), eq(true));
    }
}
