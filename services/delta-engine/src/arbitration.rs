//! Preferred-source arbitration with timeout-based fail-over
//!
//! Each path carries an ordered priority list (index 0 is the most trusted
//! source) and a `last_seen` map of the last timestamp observed per source.
//!
//! Decision for an observation of `source` at `t` on a path:
//! 1. rank 0 → always preferred
//! 2. τ = the source's own configured timeout, or the default timeout
//! 3. H = configured sources ranked above it; for an unconfigured source,
//!    every other source that ever reported on the path
//! 4. preferred iff every h ∈ H is stale: `t - last_seen[h] > τ`
//!    (a source that never reported counts as stale)
//!
//! `last_seen[source] = t` is recorded whatever the outcome. Staleness is
//! evaluated only when an observation arrives; no timers are involved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use signalk_types::delta::{Delta, Update};
use signalk_types::ids::{Context, Path, SourceRef};
use signalk_types::timestamp::Timestamp;
use tracing::{debug, info};

/// Fallback patience for sources missing from a priority list (ms).
pub const DEFAULT_TIMEOUT_MS: i64 = 120_000;

/// One entry of a priority list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcePriority {
    pub source_ref: SourceRef,
    /// Patience in ms before this source takes over from higher-ranked
    /// sources. Negative disables the source.
    pub timeout: i64,
}

impl SourcePriority {
    pub fn new(source_ref: impl Into<String>, timeout: i64) -> Self {
        Self {
            source_ref: SourceRef::new(source_ref),
            timeout,
        }
    }
}

/// Arbitration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArbitrationConfig {
    /// Path-specific priority lists.
    pub priorities: BTreeMap<Path, Vec<SourcePriority>>,
    /// Priority list for paths without a path-specific entry.
    pub source_ranking: Vec<SourcePriority>,
    pub default_timeout: i64,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            priorities: BTreeMap::new(),
            source_ranking: Vec::new(),
            default_timeout: DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Arbitration state of one path.
#[derive(Debug, Clone, Default)]
struct PathArbitration {
    priorities: Vec<SourcePriority>,
    last_seen: BTreeMap<SourceRef, i64>,
}

impl PathArbitration {
    fn with_priorities(priorities: Vec<SourcePriority>) -> Self {
        Self {
            priorities,
            last_seen: BTreeMap::new(),
        }
    }

    fn is_stale(&self, source: &SourceRef, timestamp: i64, patience: i64) -> bool {
        self.last_seen
            .get(source)
            .map_or(true, |seen| timestamp - seen > patience)
    }

    fn decide(&self, source: &SourceRef, timestamp: i64, default_timeout: i64) -> bool {
        match self.priorities.iter().position(|p| p.source_ref == *source) {
            Some(0) => true,
            Some(rank) => {
                let patience = self.priorities[rank].timeout;
                if patience < 0 {
                    return false;
                }
                self.priorities[..rank]
                    .iter()
                    .all(|higher| self.is_stale(&higher.source_ref, timestamp, patience))
            }
            None => self
                .last_seen
                .keys()
                .filter(|other| *other != source)
                .all(|other| self.is_stale(other, timestamp, default_timeout)),
        }
    }
}

/// Registry of per-path arbitration state.
///
/// Paths are created lazily on first observation and live as long as the
/// arbitrator does.
#[derive(Debug, Clone)]
pub struct Arbitrator {
    paths: BTreeMap<Path, PathArbitration>,
    source_ranking: Vec<SourcePriority>,
    default_timeout: i64,
    decisions: u64,
    suppressed: u64,
}

impl Arbitrator {
    pub fn new(default_timeout: i64) -> Self {
        Self {
            paths: BTreeMap::new(),
            source_ranking: Vec::new(),
            default_timeout,
            decisions: 0,
            suppressed: 0,
        }
    }

    pub fn from_config(config: ArbitrationConfig) -> Self {
        info!(
            configured_paths = config.priorities.len(),
            ranked_sources = config.source_ranking.len(),
            default_timeout = config.default_timeout,
            "Arbitrator configured"
        );

        let mut arbitrator = Self::new(config.default_timeout);
        arbitrator.source_ranking = config.source_ranking;
        for (path, priorities) in config.priorities {
            arbitrator
                .paths
                .insert(path, PathArbitration::with_priorities(priorities));
        }
        arbitrator
    }

    /// Replace the priority list of one path, keeping what was seen so far.
    pub fn set_priorities(&mut self, path: Path, priorities: Vec<SourcePriority>) {
        debug!(path = %path, sources = priorities.len(), "Path priorities updated");
        self.paths.entry(path).or_default().priorities = priorities;
    }

    pub fn priorities(&self, path: &Path) -> Option<&[SourcePriority]> {
        self.paths.get(path).map(|p| p.priorities.as_slice())
    }

    /// Decide whether an observation should reach preferred-mode consumers,
    /// and record it as seen.
    pub fn evaluate(&mut self, path: &Path, source: &SourceRef, timestamp: i64) -> bool {
        let ranking = &self.source_ranking;
        let state = self
            .paths
            .entry(path.clone())
            .or_insert_with(|| PathArbitration::with_priorities(ranking.clone()));

        let preferred = state.decide(source, timestamp, self.default_timeout);
        state.last_seen.insert(source.clone(), timestamp);

        self.decisions += 1;
        if !preferred {
            self.suppressed += 1;
            debug!(path = %path, source = %source, timestamp, "Observation not preferred");
        }
        preferred
    }

    /// Keep only preferred values of a self-context delta.
    ///
    /// Deltas for other contexts pass through untouched. Meta entries are
    /// never filtered. Returns `None` when no update survives.
    pub fn filter_preferred(&mut self, delta: &Delta, self_context: &Context) -> Option<Delta> {
        if delta.context.as_ref() != Some(self_context) {
            return Some(delta.clone());
        }

        let mut updates = Vec::with_capacity(delta.updates.len());
        for update in &delta.updates {
            let Some(values) = &update.values else {
                if update.has_meta() {
                    updates.push(update.clone());
                }
                continue;
            };
            let source = update.source_ref();
            let timestamp = update.timestamp.unwrap_or_else(Timestamp::now).millis();
            let kept: Vec<_> = values
                .iter()
                .filter(|pv| self.evaluate(&pv.path, &source, timestamp))
                .cloned()
                .collect();

            if kept.is_empty() && !update.has_meta() {
                continue;
            }
            updates.push(Update {
                values: (!kept.is_empty()).then_some(kept),
                ..update.clone()
            });
        }

        if updates.is_empty() {
            None
        } else {
            Some(Delta {
                context: delta.context.clone(),
                updates,
            })
        }
    }

    pub fn last_seen(&self, path: &Path, source: &SourceRef) -> Option<i64> {
        self.paths.get(path)?.last_seen.get(source).copied()
    }

    pub fn default_timeout(&self) -> i64 {
        self.default_timeout
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// Total decisions taken.
    pub fn decisions(&self) -> u64 {
        self.decisions
    }

    /// Decisions that suppressed an observation.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

impl Default for Arbitrator {
    fn default() -> Self {
        Self::from_config(ArbitrationConfig::default())
    }
}
