//! Observability counters for the monitor
//!
//! Tracks tick ingestion, snapshot rebuilds, broadcast fan-out latency,
//! subscriber churn and upstream failures. Exported as a sorted map and served
//! as JSON on `/metrics`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Broadcast cycles kept for the latency percentiles.
const LATENCY_WINDOW: usize = 1000;

/// Core metrics for the monitor.
pub struct ServiceMetrics {
    // Ingestion
    pub price_ticks_recorded: AtomicU64,
    pub rate_ticks_recorded: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub fetch_failures: AtomicU64,

    // Snapshots
    pub snapshots_built: AtomicU64,

    // Broadcasting
    pub broadcasts: AtomicU64,
    pub broadcast_latency_us: Mutex<LatencyWindow>,

    // Subscribers
    pub connected_subscribers: AtomicU64,
    pub subscribers_evicted: AtomicU64,
    pub connections_rejected: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            price_ticks_recorded: AtomicU64::new(0),
            rate_ticks_recorded: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            snapshots_built: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            broadcast_latency_us: Mutex::new(LatencyWindow::new(LATENCY_WINDOW)),
            connected_subscribers: AtomicU64::new(0),
            subscribers_evicted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
        }
    }

    pub fn record_price_tick(&self) {
        self.price_ticks_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_tick(&self) {
        self.rate_ticks_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots_built.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed fan-out and how many subscribers it evicted.
    pub fn record_broadcast(&self, latency_us: u64, evicted: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.subscribers_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if let Ok(mut window) = self.broadcast_latency_us.lock() {
            window.push(latency_us);
        }
    }

    pub fn set_connected_subscribers(&self, count: usize) {
        self.connected_subscribers
            .store(count as u64, Ordering::Relaxed);
    }

    pub fn record_rejected_connection(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for JSON exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("price_ticks_recorded".to_string(), self.price_ticks_recorded.load(Ordering::Relaxed));
        m.insert("rate_ticks_recorded".to_string(), self.rate_ticks_recorded.load(Ordering::Relaxed));
        m.insert("duplicates_dropped".to_string(), self.duplicates_dropped.load(Ordering::Relaxed));
        m.insert("fetch_failures".to_string(), self.fetch_failures.load(Ordering::Relaxed));
        m.insert("snapshots_built".to_string(), self.snapshots_built.load(Ordering::Relaxed));
        m.insert("broadcasts".to_string(), self.broadcasts.load(Ordering::Relaxed));
        m.insert("connected_subscribers".to_string(), self.connected_subscribers.load(Ordering::Relaxed));
        m.insert("subscribers_evicted".to_string(), self.subscribers_evicted.load(Ordering::Relaxed));
        m.insert("connections_rejected".to_string(), self.connections_rejected.load(Ordering::Relaxed));
        if let Ok(window) = self.broadcast_latency_us.lock() {
            if let Some(p50) = window.percentile(50) {
                m.insert("broadcast_latency_p50_us".to_string(), p50);
            }
            if let Some(p99) = window.percentile(99) {
                m.insert("broadcast_latency_p99_us".to_string(), p99);
            }
        }
        m
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-out durations of the most recent broadcast cycles, in microseconds.
pub struct LatencyWindow {
    cycles: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            cycles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, latency_us: u64) {
        if self.cycles.len() == self.capacity {
            self.cycles.pop_front();
        }
        self.cycles.push_back(latency_us);
    }

    /// Nearest-rank percentile over the window.
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.cycles.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.cycles.iter().copied().collect();
        sorted.sort_unstable();

        let rank = (p.min(100) * sorted.len()).div_ceil(100).max(1);
        Some(sorted[rank - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = ServiceMetrics::new();

        metrics.record_price_tick();
        metrics.record_price_tick();
        metrics.record_duplicate();
        metrics.record_broadcast(120, 2);
        metrics.set_connected_subscribers(7);

        let exported = metrics.export();
        assert_eq!(exported["price_ticks_recorded"], 2);
        assert_eq!(exported["duplicates_dropped"], 1);
        assert_eq!(exported["broadcasts"], 1);
        assert_eq!(exported["subscribers_evicted"], 2);
        assert_eq!(exported["connected_subscribers"], 7);
        assert_eq!(exported["broadcast_latency_p50_us"], 120);
    }

    #[test]
    fn test_latency_percentiles_absent_without_samples() {
        let exported = ServiceMetrics::new().export();
        assert!(!exported.contains_key("broadcast_latency_p99_us"));
    }

    #[test]
    fn test_broadcast_latency_percentiles() {
        let metrics = ServiceMetrics::new();
        for cycle in 1..=100 {
            metrics.record_broadcast(cycle * 10, 0);
        }

        let exported = metrics.export();
        assert_eq!(exported["broadcasts"], 100);
        assert_eq!(exported["broadcast_latency_p50_us"], 500);
        assert_eq!(exported["broadcast_latency_p99_us"], 990);
    }

    #[test]
    fn test_broadcast_latency_reflects_recent_cycles_only() {
        let metrics = ServiceMetrics::new();
        // A stalled period followed by a full window of fast fan-outs.
        for _ in 0..LATENCY_WINDOW {
            metrics.record_broadcast(5_000_000, 1);
        }
        for _ in 0..LATENCY_WINDOW {
            metrics.record_broadcast(250, 0);
        }

        let exported = metrics.export();
        assert_eq!(exported["broadcast_latency_p99_us"], 250);
        assert_eq!(exported["subscribers_evicted"], LATENCY_WINDOW as u64);
    }
}
