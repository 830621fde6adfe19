//! Coalescing buffer for consumers under backpressure
//!
//! While a consumer cannot keep up, its deltas are folded into an
//! [`Accumulator`] keyed by (context, path, source): a newer observation for
//! the same key replaces the older one in place. When the consumer catches
//! up the buffer is drained into one delta per context, each tagged with a
//! `$backpressure` indicator:
//!
//! ```json
//! { "context": "vessels.urn:mrn:imo:mmsi:1",
//!   "updates": [{ "$source": "gps", "timestamp": "...", "values": [...] }],
//!   "$backpressure": { "accumulated": 42, "duration": 1500 } }
//! ```
//!
//! `accumulated` is the size of the whole buffer at drain time and is the
//! same on every delta of one drain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use signalk_types::delta::{Delta, PathValue, Update};
use signalk_types::ids::{Context, Path, SourceRef};
use signalk_types::timestamp::Timestamp;

/// Latest observation held for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatedValue {
    pub context: Context,
    pub path: Path,
    pub value: Value,
    pub source: SourceRef,
    pub timestamp: Option<Timestamp>,
}

/// Overload indicator attached to drained deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureInfo {
    /// Entries held across the whole buffer when it was drained.
    pub accumulated: usize,
    /// How long the consumer was in backpressure (ms).
    pub duration: u64,
}

/// A drained delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureDelta {
    #[serde(flatten)]
    pub delta: Delta,
    #[serde(rename = "$backpressure")]
    pub backpressure: BackpressureInfo,
}

type EntryKey = (Context, Path, SourceRef);

#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    entries: BTreeMap<EntryKey, AccumulatedValue>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold every value of `delta` into the buffer. Returns the number of
    /// values that replaced an existing entry.
    pub fn accumulate(&mut self, delta: &Delta) -> usize {
        let context = delta.context.clone().unwrap_or_else(Context::self_alias);
        let mut replaced = 0;

        for update in &delta.updates {
            let Some(values) = &update.values else {
                continue;
            };
            let source = update.source_ref();
            for pv in values {
                let key = (context.clone(), pv.path.clone(), source.clone());
                let entry = AccumulatedValue {
                    context: context.clone(),
                    path: pv.path.clone(),
                    value: pv.value.clone(),
                    source: source.clone(),
                    timestamp: update.timestamp,
                };
                if self.entries.insert(key, entry).is_some() {
                    replaced += 1;
                }
            }
        }
        replaced
    }

    /// Build one delta per context, one update per source inside it.
    ///
    /// Does not clear the buffer; see [`Accumulator::take`].
    pub fn drain(&self, elapsed_ms: u64) -> Vec<BackpressureDelta> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let info = BackpressureInfo {
            accumulated: self.entries.len(),
            duration: elapsed_ms,
        };

        let mut by_context: BTreeMap<&Context, BTreeMap<&SourceRef, Update>> = BTreeMap::new();
        for item in self.entries.values() {
            let update = by_context
                .entry(&item.context)
                .or_default()
                .entry(&item.source)
                .or_insert_with(|| Update {
                    source_ref: Some(item.source.clone()),
                    timestamp: item.timestamp,
                    values: Some(Vec::new()),
                    ..Update::default()
                });
            if let Some(values) = update.values.as_mut() {
                values.push(PathValue::new(item.path.clone(), item.value.clone()));
            }
            if item.timestamp > update.timestamp {
                update.timestamp = item.timestamp;
            }
        }

        by_context
            .into_iter()
            .map(|(context, by_source)| BackpressureDelta {
                delta: Delta {
                    context: Some(context.clone()),
                    updates: by_source.into_values().collect(),
                },
                backpressure: info,
            })
            .collect()
    }

    /// Drain and clear in one step.
    pub fn take(&mut self, elapsed_ms: u64) -> Vec<BackpressureDelta> {
        let drained = self.drain(elapsed_ms);
        self.clear();
        drained
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop every entry of one context. Returns the number removed.
    pub fn remove_context(&mut self, context: &Context) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(c, _, _), _| c != context);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, context: &Context, path: &Path, source: &SourceRef) -> Option<&AccumulatedValue> {
        self.entries
            .get(&(context.clone(), path.clone(), source.clone()))
    }
}
