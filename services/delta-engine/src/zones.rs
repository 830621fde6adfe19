//! Zone-based alarm evaluation for the self vessel
//!
//! Watches the preferred value stream of every self path whose metadata
//! carries `zones`, and turns zone transitions into notification deltas on
//! `notifications.<path>`.
//!
//! Flow:
//! - meta `zones: [...]` → start (or restart) watching the path
//! - meta `zones: null`  → stop watching, emit one `normal` notification
//! - value               → first matching zone (or `normal`) → emit only
//!   when the resolved state differs from the last one emitted

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use signalk_types::delta::{Delta, PathValue, Update};
use signalk_types::ids::{Context, Path, SourceRef};
use signalk_types::timestamp::Timestamp;
use signalk_types::zone::{AlarmState, Notification, Zone, ZoneMethods};
use tracing::{debug, warn};

/// Source of every notification delta produced here.
pub const ZONES_SOURCE: &str = "signalk-server.zones";

/// Message used when no zone matches.
pub const NORMAL_MESSAGE: &str = "Value is within normal range";

#[derive(Debug, Clone)]
struct WatchedPath {
    zones: Vec<Zone>,
    methods: ZoneMethods,
    last_state: Option<AlarmState>,
}

impl WatchedPath {
    fn resolve(&self, value: &Value) -> (AlarmState, String) {
        value
            .as_f64()
            .and_then(|v| self.zones.iter().find(|zone| zone.contains(v)))
            .map_or_else(
                || (AlarmState::Normal, NORMAL_MESSAGE.to_string()),
                |zone| (zone.state, zone.message_or_default()),
            )
    }
}

#[derive(Debug, Clone)]
pub struct ZoneEvaluator {
    self_context: Context,
    source: SourceRef,
    watched: BTreeMap<Path, WatchedPath>,
    notifications_emitted: u64,
}

impl ZoneEvaluator {
    pub fn new(self_context: Context) -> Self {
        Self::with_source(self_context, SourceRef::new(ZONES_SOURCE))
    }

    pub fn with_source(self_context: Context, source: SourceRef) -> Self {
        Self {
            self_context,
            source,
            watched: BTreeMap::new(),
            notifications_emitted: 0,
        }
    }

    /// React to a meta update on a self path.
    ///
    /// `meta` is the object carried by the update, not the merged meta.
    pub fn on_meta_change(
        &mut self,
        path: &Path,
        meta: &Map<String, Value>,
        timestamp: Timestamp,
    ) -> Option<Delta> {
        match meta.get("zones") {
            Some(Value::Null) => {
                let was_watched = self.watched.remove(path).is_some();
                debug!(path = %path, was_watched, "Zones cleared");
                let cleared = Notification {
                    state: AlarmState::Normal,
                    method: Vec::new(),
                    message: None,
                };
                Some(self.notification_delta(path, &cleared, timestamp))
            }
            Some(zones) => {
                let zones: Vec<Zone> = match serde_json::from_value(zones.clone()) {
                    Ok(zones) => zones,
                    Err(e) => {
                        warn!(path = %path, error = %e, "Ignoring malformed zones");
                        return None;
                    }
                };
                debug!(path = %path, zones = zones.len(), "Watching zones");
                self.watched.insert(
                    path.clone(),
                    WatchedPath {
                        zones,
                        methods: parse_methods(path, meta),
                        last_state: None,
                    },
                );
                None
            }
            None => {
                if let Some(watch) = self.watched.get_mut(path) {
                    watch.methods.overlay(parse_methods(path, meta));
                }
                None
            }
        }
    }

    /// Evaluate a preferred value for a self path.
    pub fn on_value(&mut self, path: &Path, value: &Value, timestamp: Timestamp) -> Option<Delta> {
        let watch = self.watched.get_mut(path)?;
        let (state, message) = watch.resolve(value);
        if watch.last_state == Some(state) {
            return None;
        }
        watch.last_state = Some(state);
        let notification = Notification {
            state,
            method: watch.methods.method_for(state),
            message: Some(message),
        };

        debug!(path = %path, state = %state, "Zone state changed");
        Some(self.notification_delta(path, &notification, timestamp))
    }

    fn notification_delta(
        &mut self,
        path: &Path,
        notification: &Notification,
        timestamp: Timestamp,
    ) -> Delta {
        self.notifications_emitted += 1;
        Delta::new(self.self_context.clone()).with_update(Update::values(
            self.source.clone(),
            timestamp,
            vec![PathValue::new(
                path.prefixed("notifications"),
                json!(notification),
            )],
        ))
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched.contains_key(path)
    }

    pub fn watched_paths(&self) -> impl Iterator<Item = &Path> {
        self.watched.keys()
    }

    /// State of the last notification emitted for a watched path.
    pub fn last_state(&self, path: &Path) -> Option<AlarmState> {
        self.watched.get(path).and_then(|w| w.last_state)
    }

    pub fn notifications_emitted(&self) -> u64 {
        self.notifications_emitted
    }
}

fn parse_methods(path: &Path, meta: &Map<String, Value>) -> ZoneMethods {
    serde_json::from_value(Value::Object(meta.clone())).unwrap_or_else(|e| {
        warn!(path = %path, error = %e, "Ignoring malformed alarm methods");
        ZoneMethods::default()
    })
}
