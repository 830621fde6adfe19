//! Delta wire shapes
//!
//! A delta is a timestamped batch of path/value (or path/meta) observations
//! for one context:
//!
//! ```json
//! {
//!   "context": "vessels.self",
//!   "updates": [{
//!     "$source": "gps",
//!     "timestamp": "2024-02-16T22:50:56.789Z",
//!     "values": [{ "path": "navigation.position", "value": { "latitude": 60.1 } }]
//!   }]
//! }
//! ```
//!
//! Every field except `path`/`value` inside an entry is optional. Missing
//! `updates` deserializes as an empty list and an update with neither
//! `values` nor `meta` is simply a no-op downstream.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ids::{Context, Path, SourceRef, UNKNOWN_SOURCE};
use crate::timestamp::Timestamp;

/// One observation batch for a single context.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
    #[serde(default)]
    pub updates: Vec<Update>,
}

impl Delta {
    pub fn new(context: Context) -> Self {
        Self {
            context: Some(context),
            updates: Vec::new(),
        }
    }

    pub fn with_update(mut self, update: Update) -> Self {
        self.updates.push(update);
        self
    }

    /// Latest update timestamp in this delta, if any update carries one.
    pub fn latest_timestamp(&self) -> Option<Timestamp> {
        self.updates.iter().filter_map(|u| u.timestamp).max()
    }

    /// Total number of path values across all updates.
    pub fn value_count(&self) -> usize {
        self.updates
            .iter()
            .map(|u| u.values.as_ref().map_or(0, Vec::len))
            .sum()
    }

    /// Whether the delta carries neither values nor meta.
    pub fn is_empty(&self) -> bool {
        self.updates.iter().all(Update::is_empty)
    }
}

/// Values or meta from one source at one instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Update {
    /// Structured descriptor, canonicalized by [`SourceDescriptor::source_id`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceDescriptor>,
    /// Literal source identity, used as-is.
    #[serde(
        rename = "$source",
        alias = "sourceRef",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_ref: Option<SourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<PathValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Vec<PathMeta>>,
}

impl Update {
    /// A values update from a literal source.
    pub fn values(source: SourceRef, timestamp: Timestamp, values: Vec<PathValue>) -> Self {
        Self {
            source_ref: Some(source),
            timestamp: Some(timestamp),
            values: Some(values),
            ..Self::default()
        }
    }

    /// A meta update from a literal source.
    pub fn meta(source: SourceRef, timestamp: Timestamp, meta: Vec<PathMeta>) -> Self {
        Self {
            source_ref: Some(source),
            timestamp: Some(timestamp),
            meta: Some(meta),
            ..Self::default()
        }
    }

    /// Resolve the canonical source identity.
    ///
    /// A structured descriptor wins over a literal `$source`, and a literal
    /// wins over nothing at all, which resolves to `unknown`.
    pub fn source_ref(&self) -> SourceRef {
        match (&self.source, &self.source_ref) {
            (Some(descriptor), _) => descriptor.source_id(),
            (None, Some(literal)) => literal.clone(),
            (None, None) => SourceRef::unknown(),
        }
    }

    pub fn has_values(&self) -> bool {
        self.values.as_ref().is_some_and(|v| !v.is_empty())
    }

    pub fn has_meta(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| !m.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        !self.has_values() && !self.has_meta()
    }
}

/// A value observed at a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    pub path: Path,
    pub value: Value,
}

impl PathValue {
    pub fn new(path: impl Into<Path>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// Metadata for a path. `value` is shallow-merged into existing meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMeta {
    pub path: Path,
    pub value: Value,
}

impl PathMeta {
    pub fn new(path: impl Into<Path>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// Structured description of a sensor source, as produced by the NMEA
/// 2000 / 0183 parsers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Interface or provider label; `unknown` when the producer omits it.
    #[serde(default = "unknown_label")]
    pub label: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub src: Option<String>,
    #[serde(rename = "canName", default, skip_serializing_if = "Option::is_none")]
    pub can_name: Option<String>,
    /// NMEA 2000 PGN; unparseable values are dropped.
    #[serde(
        default,
        deserialize_with = "lenient_pgn",
        skip_serializing_if = "Option::is_none"
    )]
    pub pgn: Option<u32>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence: Option<String>,
    /// Remaining descriptor fields, kept for the sources registry.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl SourceDescriptor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Flatten the descriptor into a canonical source id.
    ///
    /// Order of preference: `label.canName`, `label.src`, `label.talker`,
    /// `label.instance`, and `label.XX` when none of them is present.
    pub fn source_id(&self) -> SourceRef {
        let suffix = self
            .can_name
            .as_deref()
            .or(self.src.as_deref())
            .or(self.talker.as_deref())
            .or(self.instance.as_deref())
            .unwrap_or("XX");
        SourceRef::new(format!("{}.{}", self.label, suffix))
    }

    pub fn is_nmea2000(&self) -> bool {
        self.kind.as_deref() == Some("NMEA2000") || self.src.is_some()
    }

    pub fn is_nmea0183(&self) -> bool {
        self.kind.as_deref() == Some("NMEA0183") || self.sentence.is_some()
    }
}

fn unknown_label() -> String {
    UNKNOWN_SOURCE.to_string()
}

/// Accept `128267` and `"128267"`; anything else reads as absent so one
/// odd descriptor does not reject the whole delta.
fn lenient_pgn<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let pgn = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    Ok(pgn)
}

/// Accept `"115"` and `115` alike for descriptor ids.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}
