//! Registry of every source that has contributed to the tree
//!
//! Rendered at the tree root under `sources`:
//!
//! ```json
//! {
//!   "n2k":  { "label": "n2k", "type": "NMEA2000",
//!             "115": { "n2k": { "src": "115", "pgns": { "128267": "2024-..." } } } },
//!   "0183": { "label": "0183", "type": "NMEA0183",
//!             "SD": { "talker": "SD", "sentences": { "DBT": "2024-..." } } },
//!   "gps":  {}
//! }
//! ```

use serde_json::{json, Map, Value};
use signalk_types::delta::{SourceDescriptor, Update};
use signalk_types::ids::SourceRef;
use signalk_types::timestamp::Timestamp;
use tracing::debug;

use crate::state_tree::object_slot;

/// Talker used for NMEA 0183 descriptors that do not name one.
const DEFAULT_TALKER: &str = "II";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRegistry {
    root: Map<String, Value>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the source of one update.
    pub fn record(&mut self, update: &Update, timestamp: Timestamp) {
        match (&update.source, &update.source_ref) {
            (Some(descriptor), _) => self.record_descriptor(descriptor, timestamp),
            (None, Some(literal)) => self.record_literal(literal),
            (None, None) => debug!("Update without source"),
        }
    }

    fn record_descriptor(&mut self, descriptor: &SourceDescriptor, timestamp: Timestamp) {
        let is_new = !self.root.contains_key(&descriptor.label);
        let Some(label) = object_slot(&mut self.root, &descriptor.label) else {
            return;
        };
        if is_new {
            label.insert("label".to_string(), json!(descriptor.label));
            if let Some(kind) = &descriptor.kind {
                label.insert("type".to_string(), json!(kind));
            }
        }

        if descriptor.is_nmea2000() {
            record_n2k(label, descriptor, timestamp);
        } else if descriptor.is_nmea0183() {
            record_0183(label, descriptor, timestamp);
        } else {
            label.insert("timestamp".to_string(), json!(timestamp.to_iso_string()));
        }
    }

    /// Literal sources create one nested object per dotted part.
    fn record_literal(&mut self, source: &SourceRef) {
        let mut cursor = &mut self.root;
        for part in source.as_str().split('.') {
            if cursor.get(part).is_some_and(|v| !v.is_object()) {
                return;
            }
            match object_slot(cursor, part) {
                Some(next) => cursor = next,
                None => return,
            }
        }
    }

    /// Look up a registry entry by dotted path, e.g. `n2k.115.n2k.pgns`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Number of top-level labels.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.root.clone())
    }
}

fn record_n2k(label: &mut Map<String, Value>, descriptor: &SourceDescriptor, timestamp: Timestamp) {
    let src = descriptor.src.as_deref().unwrap_or("XX");
    let Some(device) = object_slot(label, src) else {
        return;
    };

    if let Some(instance) = &descriptor.instance {
        if !device.contains_key(instance) {
            device.insert(instance.clone(), Value::Object(Map::new()));
        }
    }

    let Some(n2k) = object_slot(device, "n2k") else {
        return;
    };
    if let Some(src) = &descriptor.src {
        n2k.insert("src".to_string(), json!(src));
    }
    if let Some(can_name) = &descriptor.can_name {
        n2k.insert("canName".to_string(), json!(can_name));
    }
    for (key, value) in &descriptor.other {
        n2k.insert(key.clone(), value.clone());
    }
    let Some(pgns) = object_slot(n2k, "pgns") else {
        return;
    };
    if let Some(pgn) = descriptor.pgn {
        pgns.insert(pgn.to_string(), json!(timestamp.to_iso_string()));
    }
}

fn record_0183(label: &mut Map<String, Value>, descriptor: &SourceDescriptor, timestamp: Timestamp) {
    let talker = descriptor.talker.as_deref().unwrap_or(DEFAULT_TALKER);
    let Some(entry) = object_slot(label, talker) else {
        return;
    };
    entry.insert("talker".to_string(), json!(talker));
    let Some(sentences) = object_slot(entry, "sentences") else {
        return;
    };
    if let Some(sentence) = &descriptor.sentence {
        sentences.insert(sentence.clone(), json!(timestamp.to_iso_string()));
    }
}
