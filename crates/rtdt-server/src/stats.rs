//! Server statistics.
//!
//! Counters and gauges are plain atomics updated on the hot path. An external
//! exporter reads them through [`crate::Server::stats`]; the report loop logs
//! per-interval rates.

use crate::kernel_stats::UdpProcStats;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds (microseconds) of the forwarding delay histogram buckets.
pub const FWD_DELAY_BUCKETS_US: &[u64] = &[
    1, 5, 50, 100, 250, 500, 750, 1_000, 2_500, 5_000, 10_000, 20_000, 50_000, 100_000,
];

/// Monotonic counter.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn inc(&self) {
        self.add(1);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge.
#[derive(Debug, Default)]
pub(crate) struct Gauge(AtomicI64);

impl Gauge {
    pub(crate) fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram of microsecond observations.
#[derive(Debug)]
pub(crate) struct Histogram {
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub(crate) fn new() -> Self {
        Self {
            // One extra bucket for observations above the last bound
            buckets: (0..=FWD_DELAY_BUCKETS_US.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub(crate) fn observe(&self, d: Duration) {
        let us = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        let idx = FWD_DELAY_BUCKETS_US.partition_point(|&bound| bound < us);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds_us: FWD_DELAY_BUCKETS_US,
            counts: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            sum_us: self.sum.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// Global server statistics.
#[derive(Debug)]
pub(crate) struct Stats {
    pub(crate) bytes_read: Counter,
    pub(crate) pkts_read: Counter,
    pub(crate) bytes_written: Counter,
    pub(crate) pkts_written: Counter,
    pub(crate) no_allowance_bytes: Counter,
    pub(crate) sessions: Gauge,
    pub(crate) peers: Gauge,
    pub(crate) fwd_delay: Histogram,
}

impl Stats {
    pub(crate) fn new() -> Self {
        Self {
            bytes_read: Counter::default(),
            pkts_read: Counter::default(),
            bytes_written: Counter::default(),
            pkts_written: Counter::default(),
            no_allowance_bytes: Counter::default(),
            sessions: Gauge::default(),
            peers: Gauge::default(),
            fwd_delay: Histogram::new(),
        }
    }
}

/// Forwarding delay histogram at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds in microseconds
    pub bounds_us: &'static [u64],
    /// Per-bucket counts; the last entry counts observations above every bound
    pub counts: Vec<u64>,
    /// Sum of all observations in microseconds
    pub sum_us: u64,
    /// Number of observations
    pub count: u64,
}

/// Per-listener statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerStats {
    /// Bound address
    pub addr: SocketAddr,
    /// Established connections
    pub conns: i64,
    /// Connections waiting for handshake completion
    pub pending_conns: i64,
    /// Handshake messages dropped because the handshake queue was full
    pub handshake_stalls: u64,
    /// Datagrams that failed to decrypt
    pub decrypt_fails: u64,
    /// Packets dropped by the sequence window
    pub skipped_seq: u64,
    /// Kernel socket queues and drops
    pub kernel: UdpProcStats,
}

/// Server statistics at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Total bytes read
    pub bytes_read: u64,
    /// Total datagrams read
    pub pkts_read: u64,
    /// Total bytes written
    pub bytes_written: u64,
    /// Total datagrams written
    pub pkts_written: u64,
    /// Bytes not relayed because the sender had no allowance
    pub no_allowance_bytes: u64,
    /// Live sessions
    pub sessions: i64,
    /// Live peer bindings
    pub peers: i64,
    /// Per-packet forwarding delay
    pub fwd_delay: HistogramSnapshot,
    /// Per-listener statistics
    pub listeners: Vec<ListenerStats>,
}

impl StatsSnapshot {
    /// Established connections across all listeners.
    #[must_use]
    pub fn conns(&self) -> i64 {
        self.listeners.iter().map(|l| l.conns).sum()
    }

    /// Pending connections across all listeners.
    #[must_use]
    pub fn pending_conns(&self) -> i64 {
        self.listeners.iter().map(|l| l.pending_conns).sum()
    }
}

fn scale(value: f64, units: &[&str]) -> String {
    let mut v = value;
    let mut idx = 0;
    while v >= 1000.0 && idx < units.len() - 1 {
        v /= 1000.0;
        idx += 1;
    }
    format!("{v:.2}{}", units[idx])
}

/// Human readable byte count with decimal units.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1000 {
        return format!("{bytes}B");
    }
    scale(bytes as f64, &["B", "KB", "MB", "GB", "TB", "PB"])
}

/// Human readable count with decimal suffixes.
#[must_use]
pub fn format_count(n: u64) -> String {
    if n < 1000 {
        return n.to_string();
    }
    scale(n as f64, &["", "K", "M", "G", "T", "P"])
}

/// Human readable per-second rate with decimal suffixes.
#[must_use]
pub fn format_rate(rate: f64) -> String {
    scale(rate, &["", "K", "M", "G", "T", "P"])
}

/// Log line for the traffic seen during `dt`.
pub(crate) fn traffic_report(prev: &StatsSnapshot, cur: &StatsSnapshot, dt: Duration) -> Option<String> {
    let bytes_read = cur.bytes_read.saturating_sub(prev.bytes_read);
    let pkts_read = cur.pkts_read.saturating_sub(prev.pkts_read);
    let bytes_written = cur.bytes_written.saturating_sub(prev.bytes_written);
    let pkts_written = cur.pkts_written.saturating_sub(prev.pkts_written);

    if bytes_read | pkts_read | bytes_written | pkts_written == 0 {
        return None;
    }
    let secs = dt.as_secs_f64();
    if secs == 0.0 {
        return None;
    }

    Some(format!(
        "Stats for the last {:?} - IN: {:>8} ({:>7}B/sec) {:>8} Pkt ({:>7}/sec) ; \
         OUT: {:>8} ({:>7}B/sec) {:>8} Pkt ({:>7}/sec)",
        Duration::from_millis(u64::try_from(dt.as_millis()).unwrap_or(u64::MAX)),
        format_bytes(bytes_read),
        format_rate(bytes_read as f64 / secs),
        format_count(pkts_read),
        format_rate(pkts_read as f64 / secs),
        format_bytes(bytes_written),
        format_rate(bytes_written as f64 / secs),
        format_count(pkts_written),
        format_rate(pkts_written as f64 / secs),
    ))
}
