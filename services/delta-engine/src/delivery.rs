//! Fan-out of live deltas to consumers with backpressure
//!
//! Every consumer owns a bounded `tokio::sync::mpsc` queue. Publishing never
//! awaits: deltas are offered with `try_send`, and a consumer whose queue is
//! full either switches into backpressure mode (its deltas are coalesced in
//! an [`Accumulator`] until it catches up) or is disconnected, depending on
//! its [`OverflowPolicy`].
//!
//! Flow: publish → per consumer: pick stream by [`SourcePolicy`] →
//! try_send | accumulate | disconnect. A periodic flusher drains the
//! accumulators of consumers whose queues have room again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use signalk_types::delta::Delta;
use signalk_types::errors::DeliveryError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::accumulator::{Accumulator, BackpressureDelta};
use crate::metrics::EngineMetrics;

pub type ConsumerId = u64;

/// Which stream a consumer receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePolicy {
    /// Only values that won arbitration.
    #[default]
    Preferred,
    /// Every merged update, unfiltered.
    All,
}

/// What happens when a consumer's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Coalesce,
    Disconnect,
}

/// A message on a consumer queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Delta(Delta),
    Backpressure(BackpressureDelta),
}

impl Outbound {
    pub fn delta(&self) -> &Delta {
        match self {
            Outbound::Delta(delta) => delta,
            Outbound::Backpressure(flushed) => &flushed.delta,
        }
    }

    pub fn is_backpressure(&self) -> bool {
        matches!(self, Outbound::Backpressure(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Bounded queue size per consumer.
    pub queue_capacity: usize,
    /// Registrations beyond this are refused.
    pub max_consumers: usize,
    /// Period of the backpressure flusher.
    pub flush_interval_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 512,
            max_consumers: 1024,
            flush_interval_ms: 100,
        }
    }
}

/// Outcome of one publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Consumers that received the delta directly.
    pub delivered: usize,
    /// Values folded into backpressure buffers.
    pub coalesced: usize,
    /// Consumers removed during this publish.
    pub disconnected: Vec<ConsumerId>,
}

enum Offer {
    Sent,
    Coalesced { values: usize, entered: bool },
    Overflow,
    Closed,
}

/// Per-consumer delivery state.
struct ConsumerQueue {
    /// Stream this consumer subscribed to.
    policy: SourcePolicy,
    /// Reaction to a full queue.
    overflow: OverflowPolicy,
    /// Sending half of the bounded queue.
    sender: mpsc::Sender<Outbound>,
    /// Coalesced values held while in backpressure.
    accumulator: Accumulator,
    /// Entry time into backpressure; `None` while deltas flow directly.
    backpressure_since: Option<Instant>,
}

impl ConsumerQueue {
    fn offer(&mut self, delta: &Delta) -> Offer {
        if self.backpressure_since.is_some() {
            self.accumulator.accumulate(delta);
            return Offer::Coalesced {
                values: delta.value_count(),
                entered: false,
            };
        }
        match self.sender.try_send(Outbound::Delta(delta.clone())) {
            Ok(()) => Offer::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => match self.overflow {
                OverflowPolicy::Coalesce => {
                    self.backpressure_since = Some(Instant::now());
                    self.accumulator.accumulate(delta);
                    Offer::Coalesced {
                        values: delta.value_count(),
                        entered: true,
                    }
                }
                OverflowPolicy::Disconnect => Offer::Overflow,
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }
}

/// Registry of consumer queues.
pub struct DeliveryHub {
    consumers: Mutex<BTreeMap<ConsumerId, ConsumerQueue>>,
    next_id: AtomicU64,
    config: DeliveryConfig,
    metrics: Arc<EngineMetrics>,
}

impl DeliveryHub {
    pub fn new(config: DeliveryConfig, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            consumers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            config,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConsumerId, ConsumerQueue>> {
        self.consumers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Register a consumer and hand back the receiving end of its queue.
    pub fn register(
        &self,
        policy: SourcePolicy,
        overflow: OverflowPolicy,
    ) -> Result<(ConsumerId, mpsc::Receiver<Outbound>), DeliveryError> {
        let mut consumers = self.lock();
        if consumers.len() >= self.config.max_consumers {
            return Err(DeliveryError::ConsumerLimit {
                limit: self.config.max_consumers,
            });
        }

        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        consumers.insert(
            id,
            ConsumerQueue {
                policy,
                overflow,
                sender,
                accumulator: Accumulator::new(),
                backpressure_since: None,
            },
        );
        self.metrics.set_connected_consumers(consumers.len() as u64);
        debug!(consumer_id = id, ?policy, ?overflow, "Registered consumer");
        Ok((id, receiver))
    }

    pub fn unregister(&self, consumer_id: ConsumerId) -> Result<(), DeliveryError> {
        let mut consumers = self.lock();
        consumers
            .remove(&consumer_id)
            .ok_or(DeliveryError::ConsumerNotFound { consumer_id })?;
        self.metrics.set_connected_consumers(consumers.len() as u64);
        debug!(consumer_id, "Removed consumer");
        Ok(())
    }

    /// Offer a merged delta to every consumer.
    ///
    /// `all` goes to [`SourcePolicy::All`] consumers, `preferred` (when any
    /// value survived arbitration) to [`SourcePolicy::Preferred`] ones.
    pub fn publish(&self, all: &Delta, preferred: Option<&Delta>) -> PublishReport {
        let mut report = PublishReport::default();
        let mut consumers = self.lock();

        for (id, consumer) in consumers.iter_mut() {
            let delta = match consumer.policy {
                SourcePolicy::All => all,
                SourcePolicy::Preferred => match preferred {
                    Some(delta) => delta,
                    None => continue,
                },
            };
            match consumer.offer(delta) {
                Offer::Sent => report.delivered += 1,
                Offer::Coalesced { values, entered } => {
                    report.coalesced += values;
                    if entered {
                        warn!(consumer_id = *id, "Consumer queue full, coalescing");
                        self.metrics.record_backpressure_entry();
                    }
                }
                Offer::Overflow => {
                    warn!(consumer_id = *id, "Backpressure: disconnecting lagging consumer");
                    report.disconnected.push(*id);
                }
                Offer::Closed => {
                    debug!(consumer_id = *id, "Consumer queue closed");
                    report.disconnected.push(*id);
                }
            }
        }

        for id in &report.disconnected {
            consumers.remove(id);
            self.metrics.record_disconnect();
        }
        self.metrics.set_connected_consumers(consumers.len() as u64);
        self.metrics.record_delivered(report.delivered as u64);
        self.metrics.record_coalesced(report.coalesced as u64);
        report
    }

    /// Flush the buffers of consumers in backpressure.
    ///
    /// Each consumer receives as many drained deltas (one per context) as
    /// its queue has room for; only the contexts that were sent leave the
    /// buffer. A consumer leaves backpressure once its buffer is empty.
    /// Returns the number of consumers that left backpressure.
    pub fn flush_backpressure(&self) -> usize {
        let mut consumers = self.lock();
        let mut flushed = 0;
        let mut closed = Vec::new();

        for (id, consumer) in consumers.iter_mut() {
            let Some(since) = consumer.backpressure_since else {
                continue;
            };
            if consumer.sender.is_closed() {
                closed.push(*id);
                continue;
            }
            let elapsed_ms = since.elapsed().as_millis() as u64;
            let room = consumer.sender.capacity();
            let mut sent = 0;
            for delta in consumer.accumulator.drain(elapsed_ms).into_iter().take(room) {
                let context = delta.delta.context.clone();
                if consumer.sender.try_send(Outbound::Backpressure(delta)).is_err() {
                    break;
                }
                if let Some(context) = context {
                    consumer.accumulator.remove_context(&context);
                }
                sent += 1;
            }

            if !consumer.accumulator.is_empty() {
                debug!(
                    consumer_id = *id,
                    sent,
                    pending = consumer.accumulator.len(),
                    "Backpressure partially flushed"
                );
                continue;
            }
            consumer.backpressure_since = None;
            flushed += 1;
            self.metrics.record_backpressure_flush();
            info!(consumer_id = *id, deltas = sent, elapsed_ms, "Backpressure flushed");
        }

        for id in closed {
            consumers.remove(&id);
            self.metrics.record_disconnect();
        }
        self.metrics.set_connected_consumers(consumers.len() as u64);
        flushed
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_in_backpressure(&self, consumer_id: ConsumerId) -> bool {
        self.lock()
            .get(&consumer_id)
            .is_some_and(|c| c.backpressure_since.is_some())
    }

    /// Entries waiting in a consumer's backpressure buffer.
    pub fn pending(&self, consumer_id: ConsumerId) -> Option<usize> {
        self.lock().get(&consumer_id).map(|c| c.accumulator.len())
    }
}

/// Periodically flush backpressure buffers until `shutdown` flips to true
/// or its sender is dropped.
pub async fn run_flusher(
    hub: Arc<DeliveryHub>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    info!(period_ms = period.as_millis() as u64, "Backpressure flusher started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                hub.flush_backpressure();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Backpressure flusher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signalk_types::delta::{PathValue, Update};
    use signalk_types::ids::Context;
    use signalk_types::timestamp::Timestamp;

    fn hub(queue_capacity: usize) -> DeliveryHub {
        DeliveryHub::new(
            DeliveryConfig {
                queue_capacity,
                max_consumers: 4,
                ..DeliveryConfig::default()
            },
            Arc::new(EngineMetrics::new()),
        )
    }

    fn delta(value: i64) -> Delta {
        Delta::new(Context::new("vessels.urn:mrn:imo:mmsi:1")).with_update(Update::values(
            "gps".into(),
            Timestamp::from_millis(value).unwrap(),
            vec![PathValue::new("navigation.speedOverGround", json!(value))],
        ))
    }

    #[tokio::test]
    async fn test_policies_select_stream() {
        let hub = hub(8);
        let (_, mut preferred_rx) = hub
            .register(SourcePolicy::Preferred, OverflowPolicy::Coalesce)
            .unwrap();
        let (_, mut all_rx) = hub.register(SourcePolicy::All, OverflowPolicy::Coalesce).unwrap();

        let report = hub.publish(&delta(1), None);
        assert_eq!(report.delivered, 1);
        assert_eq!(all_rx.recv().await.unwrap().delta(), &delta(1));
        assert!(preferred_rx.try_recv().is_err());

        let report = hub.publish(&delta(2), Some(&delta(2)));
        assert_eq!(report.delivered, 2);
        assert_eq!(preferred_rx.recv().await.unwrap().delta(), &delta(2));
    }

    #[tokio::test]
    async fn test_full_queue_coalesces_then_flushes() {
        let hub = hub(1);
        let (id, mut rx) = hub.register(SourcePolicy::All, OverflowPolicy::Coalesce).unwrap();

        hub.publish(&delta(1), None);
        let report = hub.publish(&delta(2), None);
        assert_eq!(report.coalesced, 1);
        hub.publish(&delta(3), None);
        assert!(hub.is_in_backpressure(id));
        assert_eq!(hub.pending(id), Some(1));

        // queue still full
        assert_eq!(hub.flush_backpressure(), 0);

        assert_eq!(rx.recv().await.unwrap().delta(), &delta(1));
        assert_eq!(hub.flush_backpressure(), 1);
        assert!(!hub.is_in_backpressure(id));

        let flushed = rx.recv().await.unwrap();
        assert!(flushed.is_backpressure());
        let Outbound::Backpressure(flushed) = flushed else {
            panic!("expected a backpressure delta");
        };
        assert_eq!(flushed.backpressure.accumulated, 1);
        let values = flushed.delta.updates[0].values.as_ref().unwrap();
        assert_eq!(values[0].value, json!(3));
    }

    #[tokio::test]
    async fn test_flush_larger_than_queue_is_partial() {
        let hub = hub(1);
        let (id, mut rx) = hub.register(SourcePolicy::All, OverflowPolicy::Coalesce).unwrap();

        let vessel = |n: i64| {
            Delta::new(Context::new(format!("vessels.urn:mrn:imo:mmsi:{n}"))).with_update(
                Update::values(
                    "ais".into(),
                    Timestamp::from_millis(n).unwrap(),
                    vec![PathValue::new("navigation.position", json!(n))],
                ),
            )
        };
        for n in 1..=3 {
            hub.publish(&vessel(n), None);
        }
        assert_eq!(hub.pending(id), Some(2));

        assert_eq!(rx.recv().await.unwrap().delta(), &vessel(1));
        assert_eq!(hub.flush_backpressure(), 0);
        assert!(hub.is_in_backpressure(id));
        assert_eq!(hub.pending(id), Some(1));

        let Outbound::Backpressure(first) = rx.recv().await.unwrap() else {
            panic!("expected a backpressure delta");
        };
        assert_eq!(first.backpressure.accumulated, 2);

        assert_eq!(hub.flush_backpressure(), 1);
        assert!(!hub.is_in_backpressure(id));
        assert_eq!(hub.pending(id), Some(0));

        let Outbound::Backpressure(second) = rx.recv().await.unwrap() else {
            panic!("expected a backpressure delta");
        };
        assert_ne!(first.delta.context, second.delta.context);

        // live deltas flow again
        hub.publish(&vessel(4), None);
        assert_eq!(rx.recv().await.unwrap().delta(), &vessel(4));
    }

    #[tokio::test]
    async fn test_disconnect_policy_drops_consumer() {
        let hub = hub(1);
        let (id, _rx) = hub.register(SourcePolicy::All, OverflowPolicy::Disconnect).unwrap();

        hub.publish(&delta(1), None);
        let report = hub.publish(&delta(2), None);
        assert_eq!(report.disconnected, vec![id]);
        assert_eq!(hub.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_removed() {
        let hub = hub(4);
        let (id, rx) = hub.register(SourcePolicy::All, OverflowPolicy::Coalesce).unwrap();
        drop(rx);

        let report = hub.publish(&delta(1), None);
        assert_eq!(report.disconnected, vec![id]);
        assert_eq!(hub.unregister(id), Err(DeliveryError::ConsumerNotFound { consumer_id: id }));
    }

    #[tokio::test]
    async fn test_consumer_limit() {
        let hub = hub(4);
        let mut receivers = Vec::new();
        for _ in 0..4 {
            receivers.push(hub.register(SourcePolicy::All, OverflowPolicy::Coalesce).unwrap());
        }
        assert_eq!(
            hub.register(SourcePolicy::All, OverflowPolicy::Coalesce).unwrap_err(),
            DeliveryError::ConsumerLimit { limit: 4 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flusher_drains_and_stops() {
        let hub = Arc::new(hub(1));
        let (id, mut rx) = hub.register(SourcePolicy::All, OverflowPolicy::Coalesce).unwrap();
        hub.publish(&delta(1), None);
        hub.publish(&delta(2), None);
        assert!(hub.is_in_backpressure(id));

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_flusher(
            Arc::clone(&hub),
            Duration::from_millis(100),
            stop_rx,
        ));

        assert_eq!(rx.recv().await.unwrap().delta(), &delta(1));
        tokio::time::advance(Duration::from_millis(150)).await;
        let flushed = rx.recv().await.unwrap();
        assert!(flushed.is_backpressure());
        assert!(!hub.is_in_backpressure(id));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
