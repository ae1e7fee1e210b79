//! Controller metrics
//!
//! Prometheus-compatible counters, gauges and a histogram for the
//! reconciliation loop, quorum monitor and failover router.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for pass durations (in milliseconds)
const PASS_BUCKETS: [f64; 10] = [
    1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0, 30000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&PASS_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored as microseconds for precision
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative buckets, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    /// Dispatched actions keyed by verb (create, delete)
    actions: Mutex<BTreeMap<&'static str, Arc<Counter>>>,

    pub passes_total: Counter,
    pub passes_aborted: Counter,
    pub passes_skipped_quorum: Counter,
    pub action_failures: Counter,
    pub heartbeats_total: Counter,
    pub health_transitions: Counter,
    pub endpoint_updates: Counter,

    pub quorum_safe: Gauge,
    pub reachable_voters: Gauge,
    pub voting_members: Gauge,
    pub active_replicas: Gauge,
    pub stuck_replicas: Gauge,
    pub live_endpoints: Gauge,

    pub pass_duration: Histogram,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            actions: Mutex::new(BTreeMap::new()),
            passes_total: Counter::new(),
            passes_aborted: Counter::new(),
            passes_skipped_quorum: Counter::new(),
            action_failures: Counter::new(),
            heartbeats_total: Counter::new(),
            health_transitions: Counter::new(),
            endpoint_updates: Counter::new(),
            quorum_safe: Gauge::new(),
            reachable_voters: Gauge::new(),
            voting_members: Gauge::new(),
            active_replicas: Gauge::new(),
            stuck_replicas: Gauge::new(),
            live_endpoints: Gauge::new(),
            pass_duration: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    pub fn action(&self, verb: &'static str) -> Arc<Counter> {
        let mut actions = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
        actions
            .entry(verb)
            .or_insert_with(|| Arc::new(Counter::new()))
            .clone()
    }

    pub fn record_pass(&self, duration: Duration) {
        self.passes_total.inc();
        self.pass_duration.observe(duration.as_secs_f64() * 1000.0);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 7] = [
            ("minifleet_passes_total", "Reconciliation passes run", &self.passes_total),
            ("minifleet_passes_aborted_total", "Passes superseded by a newer cluster snapshot", &self.passes_aborted),
            ("minifleet_passes_quorum_lost_total", "Passes that skipped mutation for lack of quorum", &self.passes_skipped_quorum),
            ("minifleet_action_failures_total", "Failed create/delete actions", &self.action_failures),
            ("minifleet_heartbeats_total", "Heartbeats received", &self.heartbeats_total),
            ("minifleet_health_transitions_total", "Node health transitions", &self.health_transitions),
            ("minifleet_endpoint_updates_total", "Endpoint upserts and removals published", &self.endpoint_updates),
        ];
        for (name, help, counter) in counters {
            metric_header(&mut out, name, help, "counter");
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        let gauges: [(&str, &str, &Gauge); 6] = [
            ("minifleet_quorum_safe", "1 when a strict majority of voters is reachable", &self.quorum_safe),
            ("minifleet_reachable_voters", "Reachable voting members", &self.reachable_voters),
            ("minifleet_voting_members", "Registered voting members", &self.voting_members),
            ("minifleet_active_replicas", "Replicas in the Active state", &self.active_replicas),
            ("minifleet_stuck_replicas", "Replicas whose retry budget is exhausted", &self.stuck_replicas),
            ("minifleet_live_endpoints", "Endpoints currently published to ingress", &self.live_endpoints),
        ];
        for (name, help, gauge) in gauges {
            metric_header(&mut out, name, help, "gauge");
            let _ = writeln!(out, "{} {}", name, gauge.get());
        }

        metric_header(&mut out, "minifleet_uptime_seconds", "Controller uptime in seconds", "gauge");
        let _ = writeln!(out, "minifleet_uptime_seconds {}", self.uptime_seconds());

        metric_header(&mut out, "minifleet_actions_total", "Actions dispatched per verb", "counter");
        let actions = self.actions.lock().unwrap_or_else(PoisonError::into_inner);
        for (verb, counter) in actions.iter() {
            let _ = writeln!(out, "minifleet_actions_total{{verb=\"{}\"}} {}", verb, counter.get());
        }

        metric_header(
            &mut out,
            "minifleet_pass_duration_ms",
            "Reconciliation pass duration in milliseconds",
            "histogram",
        );
        for (le, count) in self.pass_duration.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "minifleet_pass_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "minifleet_pass_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "minifleet_pass_duration_ms_sum {}", self.pass_duration.sum());
        let _ = writeln!(out, "minifleet_pass_duration_ms_count {}", self.pass_duration.count());

        out
    }
}

fn metric_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
