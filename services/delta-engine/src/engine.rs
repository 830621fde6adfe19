//! The delta engine: one owner for the tree, the arbitrator, the zone
//! evaluator and the history, wired in ingestion order.
//!
//! Flow per delta: normalize → history → merge → arbitration → delivery →
//! zone evaluation. Notification deltas produced by the zone evaluator are
//! queued and ingested through the same flow before `ingest` returns.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use signalk_types::delta::Delta;
use signalk_types::errors::DeliveryError;
use signalk_types::ids::{Context, Path};
use signalk_types::timestamp::Timestamp;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::arbitration::{Arbitrator, SourcePriority};
use crate::config::EngineConfig;
use crate::delivery::{self, ConsumerId, DeliveryHub, OverflowPolicy, Outbound, SourcePolicy};
use crate::events::{TreeEvent, TreeObserver};
use crate::history::DeltaHistory;
use crate::metrics::EngineMetrics;
use crate::replay::{ReplayEngine, TreeSnapshot};
use crate::state_tree::StateTree;
use crate::zones::ZoneEvaluator;

/// What one `ingest` call did, including any notifications it triggered.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    /// The input delta plus every notification delta fed back.
    pub deltas_processed: usize,
    pub events: Vec<TreeEvent>,
    pub notifications: Vec<Delta>,
    pub delivered: usize,
    pub suppressed: u64,
    pub disconnected: Vec<ConsumerId>,
}

pub struct DeltaEngine {
    config: EngineConfig,
    tree: StateTree,
    arbitrator: Arbitrator,
    zones: ZoneEvaluator,
    history: DeltaHistory,
    hub: Arc<DeliveryHub>,
    metrics: Arc<EngineMetrics>,
}

impl DeltaEngine {
    pub fn new(config: EngineConfig) -> Self {
        let identity = config.identity.resolve();
        let tree = StateTree::with_defaults(identity, config.identity.defaults.clone());
        let zones = ZoneEvaluator::new(tree.self_context().clone());
        let arbitrator = Arbitrator::from_config(config.arbitration.clone());
        let history = DeltaHistory::from_config(&config.history);
        let metrics = Arc::new(EngineMetrics::new());
        let hub = Arc::new(DeliveryHub::new(config.delivery.clone(), Arc::clone(&metrics)));

        info!(
            self_context = %tree.self_context(),
            history_capacity = history.capacity(),
            "Delta engine started"
        );

        Self {
            config,
            tree,
            arbitrator,
            zones,
            history,
            hub,
            metrics,
        }
    }

    /// Ingest one delta using the wall clock for missing timestamps.
    pub fn ingest(&mut self, delta: Delta) -> IngestOutcome {
        self.ingest_at(delta, Timestamp::now())
    }

    /// Ingest one delta; `now` stamps updates that carry no timestamp.
    pub fn ingest_at(&mut self, delta: Delta, now: Timestamp) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        let mut queue = VecDeque::from([delta]);

        while let Some(delta) = queue.pop_front() {
            let delta = self.normalize(delta, now);
            if delta.is_empty() {
                continue;
            }
            outcome.deltas_processed += 1;
            self.history.push(delta.clone(), now);

            let start = Instant::now();
            let events = self.tree.merge(&delta);
            self.metrics
                .record_merge(delta.value_count() as u64, start.elapsed().as_nanos() as u64);

            let suppressed_before = self.arbitrator.suppressed();
            let preferred = self
                .arbitrator
                .filter_preferred(&delta, self.tree.self_context());
            let suppressed = self.arbitrator.suppressed() - suppressed_before;
            self.metrics.record_suppressed(suppressed);
            outcome.suppressed += suppressed;

            let report = self.hub.publish(&delta, preferred.as_ref());
            outcome.delivered += report.delivered;
            outcome.disconnected.extend(report.disconnected);

            let notifications = self.evaluate_zones(&events, preferred.as_ref(), now);
            for notification in &notifications {
                self.metrics.record_notification();
                debug!(paths = notification.value_count(), "Queued zone notification");
            }
            outcome.notifications.extend(notifications.iter().cloned());
            queue.extend(notifications);
            outcome.events.extend(events);
        }

        outcome
    }

    /// Resolve the context and stamp untimed updates.
    fn normalize(&self, mut delta: Delta, now: Timestamp) -> Delta {
        let context = match &delta.context {
            Some(context) => self.tree.resolve_context(context),
            None => self.tree.self_context().clone(),
        };
        delta.context = Some(context);
        for update in &mut delta.updates {
            update.timestamp.get_or_insert(now);
        }
        delta
    }

    fn evaluate_zones(
        &mut self,
        events: &[TreeEvent],
        preferred: Option<&Delta>,
        now: Timestamp,
    ) -> Vec<Delta> {
        let self_context = self.tree.self_context().clone();
        let mut notifications = Vec::new();

        for event in events {
            if let TreeEvent::Meta {
                context,
                path,
                update,
                timestamp,
                ..
            } = event
            {
                if *context == self_context {
                    notifications.extend(self.zones.on_meta_change(path, update, *timestamp));
                }
            }
        }

        let Some(preferred) = preferred.filter(|d| d.context.as_ref() == Some(&self_context)) else {
            return notifications;
        };
        for update in &preferred.updates {
            let timestamp = update.timestamp.unwrap_or(now);
            for pv in update.values.iter().flatten() {
                notifications.extend(self.zones.on_value(&pv.path, &pv.value, timestamp));
            }
        }
        notifications
    }

    pub fn retrieve(&self, context_filter: Option<&str>) -> Value {
        self.tree.retrieve(context_filter)
    }

    pub fn retrieve_filtered(&self, context_filter: Option<&str>, path_filter: Option<&str>) -> Value {
        self.tree.retrieve_filtered(context_filter, path_filter)
    }

    /// The full tree as it stood at `time`.
    ///
    /// Without a time, or with a time at or past the newest retained delta,
    /// this is the live tree.
    pub fn build_full_as_of(&self, time: Option<Timestamp>, path_filter: Option<&str>) -> Value {
        let live = match (time, self.history.newest()) {
            (None, _) | (_, None) => true,
            (Some(time), Some(newest)) => time >= newest,
        };
        if live {
            return self.tree.retrieve_filtered(None, path_filter);
        }
        self.snapshot_with(time, path_filter).tree
    }

    /// Replay the retained history into a checksummed snapshot.
    pub fn snapshot_as_of(&self, time: Option<Timestamp>) -> TreeSnapshot {
        self.snapshot_with(time, None)
    }

    fn snapshot_with(&self, time: Option<Timestamp>, path_filter: Option<&str>) -> TreeSnapshot {
        let engine = match path_filter {
            Some(filter) => ReplayEngine::new().with_path_filter(filter),
            None => ReplayEngine::new(),
        };
        let result = engine.replay(&self.tree, &self.history, time);
        self.metrics
            .record_replay(result.metrics.deltas_replayed, result.metrics.duration_ms as u64);
        result.snapshot
    }

    pub fn cached_deltas(&self, context_filter: Option<&str>) -> Vec<Delta> {
        self.tree.cached_deltas(context_filter)
    }

    pub fn register_consumer(
        &self,
        policy: SourcePolicy,
        overflow: OverflowPolicy,
    ) -> Result<(ConsumerId, mpsc::Receiver<Outbound>), DeliveryError> {
        self.hub.register(policy, overflow)
    }

    pub fn unregister_consumer(&self, consumer_id: ConsumerId) -> Result<(), DeliveryError> {
        self.hub.unregister(consumer_id)
    }

    /// Start the backpressure flusher on the current tokio runtime.
    pub fn spawn_flusher(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_millis(self.config.delivery.flush_interval_ms);
        tokio::spawn(delivery::run_flusher(Arc::clone(&self.hub), period, shutdown))
    }

    pub fn set_priorities(&mut self, path: Path, priorities: Vec<SourcePriority>) {
        self.arbitrator.set_priorities(path, priorities);
    }

    pub fn subscribe<O: TreeObserver + 'static>(&mut self, observer: O) {
        self.tree.subscribe(observer);
    }

    /// Drop stale non-self contexts.
    pub fn prune_contexts(&mut self, max_age_ms: i64, now: Timestamp) -> Vec<Context> {
        self.tree.prune_contexts(max_age_ms, now)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    pub fn arbitrator(&self) -> &Arbitrator {
        &self.arbitrator
    }

    pub fn zones(&self) -> &ZoneEvaluator {
        &self.zones
    }

    pub fn history(&self) -> &DeltaHistory {
        &self.history
    }

    pub fn hub(&self) -> Arc<DeliveryHub> {
        Arc::clone(&self.hub)
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }
}
