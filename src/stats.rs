//! Statistics tracking for the proxy.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared by the handler, the upstream client and the
/// dispatcher.
pub struct Stats {
    requests: AtomicU64,
    cached: AtomicU64,
    forwarded: AtomicU64,
    malformed: AtomicU64,
    unresolved: AtomicU64,
    reply_failed: AtomicU64,
    rejected: AtomicU64,
    udp_attempts: AtomicU64,
    tcp_attempts: AtomicU64,
    upstream_resets: AtomicU64,
    /// Cumulative response time of answered requests in microseconds.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            unresolved: AtomicU64::new(0),
            reply_failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            udp_attempts: AtomicU64::new(0),
            tcp_attempts: AtomicU64::new(0),
            upstream_resets: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record_cached(&self, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.cached.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(response_time_ms);
    }

    pub fn record_forwarded(&self, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(response_time_ms);
    }

    pub fn record_malformed(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unresolved(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.unresolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reply_failed(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.reply_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A datagram turned away because every worker was busy.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_attempt(&self) {
        self.udp_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_attempt(&self) {
        self.tcp_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// An unresolved request whose upstream connection was reset.
    pub fn record_upstream_reset(&self) {
        self.upstream_resets.fetch_add(1, Ordering::Relaxed);
    }

    fn add_response_time(&self, response_time_ms: f64) {
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    /// Read the counters without resetting them.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.collect(|counter| counter.load(Ordering::Relaxed))
    }

    /// Read and zero the counters, for per-interval reporting.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        self.collect(|counter| counter.swap(0, Ordering::Relaxed))
    }

    fn collect(&self, read: impl Fn(&AtomicU64) -> u64) -> StatsSnapshot {
        let cached = read(&self.cached);
        let forwarded = read(&self.forwarded);
        let total_us = read(&self.total_response_time_us);

        let answered = cached + forwarded;
        let avg_response_ms = if answered > 0 {
            (total_us as f64 / answered as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests: read(&self.requests),
            cached,
            forwarded,
            malformed: read(&self.malformed),
            unresolved: read(&self.unresolved),
            reply_failed: read(&self.reply_failed),
            rejected: read(&self.rejected),
            udp_attempts: read(&self.udp_attempts),
            tcp_attempts: read(&self.tcp_attempts),
            upstream_resets: read(&self.upstream_resets),
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cached: u64,
    pub forwarded: u64,
    pub malformed: u64,
    pub unresolved: u64,
    pub reply_failed: u64,
    pub rejected: u64,
    pub udp_attempts: u64,
    pub tcp_attempts: u64,
    pub upstream_resets: u64,
    pub avg_response_ms: f64,
}
