//! Engine-wide counters read by the /metrics endpoint.
//! Updated by the ingress queue, pipeline task, alert writer and feed adapter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    /// Ticks accepted at ingress after shape validation.
    pub total_ticks: AtomicU64,
    /// Ticks lost to queue overflow (oldest-batch eviction).
    pub dropped_ticks: AtomicU64,
    /// Ticks rejected at ingress (non-positive or non-finite price).
    pub malformed_ticks: AtomicU64,
    pub alerts_emitted: AtomicU64,
    pub alerts_suppressed_by_cooldown: AtomicU64,
    /// Alert records shed from a full persistence buffer.
    pub alerts_lost: AtomicU64,
    /// Notification jobs dropped on egress back-pressure.
    pub notifications_dropped: AtomicU64,
    /// Per-tick evaluation faults caught and skipped.
    pub tick_faults: AtomicU64,
    pub monitored_users: AtomicU64,
    pub monitored_instruments: AtomicU64,
    pub persistence_buffer_depth: AtomicU64,
    pub feed_connected: AtomicBool,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_feed_connected(&self, v: bool) {
        self.feed_connected.store(v, Ordering::Relaxed);
    }

    pub fn feed_connected(&self) -> bool {
        self.feed_connected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_ticks: self.total_ticks.load(Ordering::Relaxed),
            dropped_ticks: self.dropped_ticks.load(Ordering::Relaxed),
            malformed_ticks: self.malformed_ticks.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            alerts_suppressed_by_cooldown: self
                .alerts_suppressed_by_cooldown
                .load(Ordering::Relaxed),
            alerts_lost: self.alerts_lost.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            tick_faults: self.tick_faults.load(Ordering::Relaxed),
            monitored_users: self.monitored_users.load(Ordering::Relaxed),
            monitored_instruments: self.monitored_instruments.load(Ordering::Relaxed),
            persistence_buffer_depth: self.persistence_buffer_depth.load(Ordering::Relaxed),
            feed_connected: self.feed_connected(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_ticks: u64,
    pub dropped_ticks: u64,
    pub malformed_ticks: u64,
    pub alerts_emitted: u64,
    pub alerts_suppressed_by_cooldown: u64,
    pub alerts_lost: u64,
    pub notifications_dropped: u64,
    pub tick_faults: u64,
    pub monitored_users: u64,
    pub monitored_instruments: u64,
    pub persistence_buffer_depth: u64,
    pub feed_connected: bool,
}

/// Process start time, rendered into /metrics as an ISO-8601 string.
pub struct Uptime {
    started_at: DateTime<Utc>,
}

impl Uptime {
    pub fn new() -> Self {
        Self { started_at: Utc::now() }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Latency
// ---------------------------------------------------------------------------

/// In-memory tick→alert latency histogram. The pipeline records, the API
/// reads. Values stored in microseconds.
pub struct LatencyStats {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

impl LatencyStats {
    /// Tracks 1us to 100s, 3 significant figures.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 100_000_000, 3)
            .expect("valid histogram bounds");
        Self { inner: Mutex::new(histogram) }
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        if let Ok(mut h) = self.inner.lock() {
            let _ = h.record(us.max(1));
        }
    }

    /// Returns (p50_us, p95_us, p99_us). None if no samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Ok(h) = self.inner.lock() else {
            return (None, None, None);
        };
        if h.len() == 0 {
            return (None, None, None);
        }
        (
            Some(h.value_at_quantile(0.5)),
            Some(h.value_at_quantile(0.95)),
            Some(h.value_at_quantile(0.99)),
        )
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}
