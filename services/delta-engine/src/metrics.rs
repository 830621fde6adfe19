//! Observability counters for the delta engine
//!
//! Atomic counters shared between the ingestion path and the delivery
//! flusher, plus a rolling latency window for merges. `export()` renders
//! everything as a sorted map for Prometheus-style exposition.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub struct EngineMetrics {
    // Ingestion
    pub deltas_ingested: AtomicU64,
    pub values_merged: AtomicU64,
    pub merge_latency_ns: Mutex<LatencyTracker>,

    // Arbitration
    pub values_suppressed: AtomicU64,

    // Zones
    pub notifications_emitted: AtomicU64,

    // Delivery
    pub deltas_delivered: AtomicU64,
    pub values_coalesced: AtomicU64,
    pub backpressure_entries: AtomicU64,
    pub backpressure_flushes: AtomicU64,
    pub consumers_connected: AtomicU64,
    pub consumers_disconnected: AtomicU64,

    // Replay
    pub replays: AtomicU64,
    pub replay_deltas: AtomicU64,
    pub replay_duration_ms: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            deltas_ingested: AtomicU64::new(0),
            values_merged: AtomicU64::new(0),
            merge_latency_ns: Mutex::new(LatencyTracker::new(1000)),
            values_suppressed: AtomicU64::new(0),
            notifications_emitted: AtomicU64::new(0),
            deltas_delivered: AtomicU64::new(0),
            values_coalesced: AtomicU64::new(0),
            backpressure_entries: AtomicU64::new(0),
            backpressure_flushes: AtomicU64::new(0),
            consumers_connected: AtomicU64::new(0),
            consumers_disconnected: AtomicU64::new(0),
            replays: AtomicU64::new(0),
            replay_deltas: AtomicU64::new(0),
            replay_duration_ms: AtomicU64::new(0),
        }
    }

    /// Record one merged delta.
    pub fn record_merge(&self, values: u64, latency_ns: u64) {
        self.deltas_ingested.fetch_add(1, Ordering::Relaxed);
        self.values_merged.fetch_add(values, Ordering::Relaxed);
        if let Ok(mut tracker) = self.merge_latency_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_suppressed(&self, values: u64) {
        self.values_suppressed.fetch_add(values, Ordering::Relaxed);
    }

    pub fn record_notification(&self) {
        self.notifications_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, deltas: u64) {
        self.deltas_delivered.fetch_add(deltas, Ordering::Relaxed);
    }

    /// Record values folded into a backpressure buffer.
    pub fn record_coalesced(&self, values: u64) {
        self.values_coalesced.fetch_add(values, Ordering::Relaxed);
    }

    /// Record a consumer switching into backpressure mode.
    pub fn record_backpressure_entry(&self) {
        self.backpressure_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure_flush(&self) {
        self.backpressure_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected_consumers(&self, count: u64) {
        self.consumers_connected.store(count, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.consumers_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record replay metrics.
    pub fn record_replay(&self, deltas: u64, duration_ms: u64) {
        self.replays.fetch_add(1, Ordering::Relaxed);
        self.replay_deltas.store(deltas, Ordering::Relaxed);
        self.replay_duration_ms.store(duration_ms, Ordering::Relaxed);
    }

    /// p99 merge latency in nanoseconds, if any merge was recorded.
    pub fn merge_latency_p99(&self) -> Option<u64> {
        self.merge_latency_ns
            .lock()
            .ok()
            .and_then(|tracker| tracker.percentile(99))
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("deltas_ingested".to_string(), self.deltas_ingested.load(Ordering::Relaxed));
        m.insert("values_merged".to_string(), self.values_merged.load(Ordering::Relaxed));
        m.insert("values_suppressed".to_string(), self.values_suppressed.load(Ordering::Relaxed));
        m.insert("notifications_emitted".to_string(), self.notifications_emitted.load(Ordering::Relaxed));
        m.insert("deltas_delivered".to_string(), self.deltas_delivered.load(Ordering::Relaxed));
        m.insert("values_coalesced".to_string(), self.values_coalesced.load(Ordering::Relaxed));
        m.insert("backpressure_entries".to_string(), self.backpressure_entries.load(Ordering::Relaxed));
        m.insert("backpressure_flushes".to_string(), self.backpressure_flushes.load(Ordering::Relaxed));
        m.insert("consumers_connected".to_string(), self.consumers_connected.load(Ordering::Relaxed));
        m.insert("consumers_disconnected".to_string(), self.consumers_disconnected.load(Ordering::Relaxed));
        m.insert("replays".to_string(), self.replays.load(Ordering::Relaxed));
        m.insert("replay_deltas".to_string(), self.replay_deltas.load(Ordering::Relaxed));
        m.insert("replay_duration_ms".to_string(), self.replay_duration_ms.load(Ordering::Relaxed));
        if let Ok(tracker) = self.merge_latency_ns.lock() {
            m.insert("merge_latency_samples".to_string(), tracker.count() as u64);
            m.insert("merge_latency_avg_ns".to_string(), tracker.average().unwrap_or(0));
            m.insert("merge_latency_p99_ns".to_string(), tracker.percentile(99).unwrap_or(0));
        }
        m
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size window over the most recent latency samples.
pub struct LatencyTracker {
    window: VecDeque<u64>,
    limit: usize,
}

impl LatencyTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.limit == 0 {
            return;
        }
        if self.window.len() == self.limit {
            self.window.pop_front();
        }
        self.window.push_back(value);
    }

    /// Nearest-rank percentile (0-100) over the window.
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.window.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (p.min(100) * sorted.len()).div_ceil(100).max(1);
        sorted.get(rank - 1).copied()
    }

    pub fn average(&self) -> Option<u64> {
        let count = self.window.len() as u64;
        (count > 0).then(|| self.window.iter().sum::<u64>() / count)
    }

    pub fn count(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_recording() {
        let metrics = EngineMetrics::new();
        metrics.record_merge(3, 500);
        metrics.record_merge(2, 1_500);

        let exported = metrics.export();
        assert_eq!(exported["deltas_ingested"], 2);
        assert_eq!(exported["values_merged"], 5);
        assert_eq!(metrics.merge_latency_p99(), Some(1_500));
        assert_eq!(exported["merge_latency_samples"], 2);
        assert_eq!(exported["merge_latency_avg_ns"], 1_000);
        assert_eq!(exported["merge_latency_p99_ns"], 1_500);
    }

    #[test]
    fn test_delivery_counters() {
        let metrics = EngineMetrics::new();
        metrics.record_backpressure_entry();
        metrics.record_coalesced(4);
        metrics.record_backpressure_flush();
        metrics.record_disconnect();
        metrics.set_connected_consumers(3);

        let exported = metrics.export();
        assert_eq!(exported["backpressure_entries"], 1);
        assert_eq!(exported["values_coalesced"], 4);
        assert_eq!(exported["backpressure_flushes"], 1);
        assert_eq!(exported["consumers_disconnected"], 1);
        assert_eq!(exported["consumers_connected"], 3);
    }

    #[test]
    fn test_replay_metrics_recording() {
        let metrics = EngineMetrics::new();
        metrics.record_replay(1000, 500);
        metrics.record_replay(10, 5);

        let exported = metrics.export();
        assert_eq!(exported["replays"], 2);
        assert_eq!(exported["replay_deltas"], 10);
        assert_eq!(exported["replay_duration_ms"], 5);
    }

    #[test]
    fn test_latency_tracker_percentile() {
        let mut tracker = LatencyTracker::new(100);
        for i in 1..=100 {
            tracker.record(i);
        }
        assert_eq!(tracker.percentile(50), Some(50));
        assert_eq!(tracker.percentile(99), Some(99));
        assert_eq!(tracker.percentile(100), Some(100));
    }

    #[test]
    fn test_latency_tracker_window_eviction() {
        let mut tracker = LatencyTracker::new(3);
        tracker.record(10);
        tracker.record(20);
        tracker.record(30);
        tracker.record(40);

        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.average().unwrap(), 30);
    }

    #[test]
    fn test_empty_export_reports_zero_latency() {
        let exported = EngineMetrics::new().export();
        assert_eq!(exported["merge_latency_samples"], 0);
        assert_eq!(exported["merge_latency_p99_ns"], 0);
    }
}
