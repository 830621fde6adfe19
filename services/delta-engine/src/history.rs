//! Bounded in-memory history of ingested deltas
//!
//! Keeps the most recent deltas in arrival order so that the tree can be
//! rebuilt as of an earlier instant. Durable retention is a host concern;
//! once the ring is full the oldest delta is evicted.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use signalk_types::delta::Delta;
use signalk_types::timestamp::Timestamp;

/// Ring capacity used when none is configured.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of retained deltas.
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// A retained delta, stamped with its latest update timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: Timestamp,
    pub delta: Delta,
}

#[derive(Debug, Clone)]
pub struct DeltaHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    evicted: u64,
}

impl DeltaHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
            evicted: 0,
        }
    }

    pub fn from_config(config: &HistoryConfig) -> Self {
        Self::new(config.capacity)
    }

    /// Retain a delta. Deltas without any timestamp are stamped with `now`.
    pub fn push(&mut self, delta: Delta, now: Timestamp) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        let timestamp = delta.latest_timestamp().unwrap_or(now);
        self.entries.push_back(HistoryEntry { timestamp, delta });
    }

    /// Deltas stamped at or before `as_of`, in arrival order.
    ///
    /// Newer deltas are skipped rather than ending the scan: only per-path
    /// ordering is guaranteed, so an older delta on one path may arrive
    /// after a newer one on another.
    pub fn up_to(&self, as_of: Timestamp) -> impl Iterator<Item = &HistoryEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.timestamp <= as_of)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn oldest(&self) -> Option<Timestamp> {
        self.entries.front().map(|e| e.timestamp)
    }

    pub fn newest(&self) -> Option<Timestamp> {
        self.entries.iter().map(|e| e.timestamp).max()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Deltas dropped because the ring was full.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for DeltaHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signalk_types::delta::{PathValue, Update};
    use signalk_types::ids::Context;

    fn ts(ms: i64) -> Timestamp {
        Timestamp::from_millis(ms).unwrap()
    }

    fn delta_at(ms: i64) -> Delta {
        Delta::new(Context::self_alias()).with_update(Update::values(
            "gps".into(),
            ts(ms),
            vec![PathValue::new("x", json!(ms))],
        ))
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut history = DeltaHistory::new(2);
        history.push(delta_at(1), ts(0));
        history.push(delta_at(2), ts(0));
        history.push(delta_at(3), ts(0));

        assert_eq!(history.len(), 2);
        assert_eq!(history.oldest(), Some(ts(2)));
        assert_eq!(history.newest(), Some(ts(3)));
        assert_eq!(history.evicted(), 1);
    }

    #[test]
    fn test_up_to_skips_newer_out_of_order() {
        let mut history = DeltaHistory::default();
        history.push(delta_at(1), ts(0));
        history.push(delta_at(5), ts(0));
        history.push(delta_at(3), ts(0));
        history.push(delta_at(4), ts(0));

        let replayed: Vec<i64> = history.up_to(ts(4)).map(|e| e.timestamp.millis()).collect();
        assert_eq!(replayed, vec![1, 3, 4]);
        assert_eq!(history.up_to(ts(0)).count(), 0);
    }

    #[test]
    fn test_untimed_delta_uses_now() {
        let mut history = DeltaHistory::default();
        history.push(Delta::new(Context::self_alias()), ts(42));
        assert_eq!(history.oldest(), Some(ts(42)));
    }

    #[test]
    fn test_zero_capacity_retains_nothing() {
        let mut history = DeltaHistory::new(0);
        history.push(delta_at(1), ts(0));
        assert!(history.is_empty());
    }
}
