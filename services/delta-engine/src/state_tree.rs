//! Canonical multi-source state tree
//!
//! Holds the merged state of every context seen so far. Each leaf keeps the
//! most recent write from any source at the top level (`value`, `$source`,
//! `timestamp`) and, under `values`, the latest write from each individual
//! source. Per-source entries are never evicted by other sources.
//!
//! Flow: Delta → resolve context → per update: resolve source, record it in
//! the sources registry → write leaves / root fields / meta → emit
//! [`TreeEvent`]s to observers.
//!
//! Malformed input never fails a merge: updates carrying neither values nor
//! meta, meta entries that are not objects and contexts without an id are
//! skipped.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{json, Map, Value};
use signalk_types::delta::{Delta, PathValue, SourceDescriptor, Update};
use signalk_types::ids::{identity_field, Context, Path, SelfIdentity, SourceRef, SELF_ALIAS};
use signalk_types::timestamp::Timestamp;
use tracing::{debug, info};

use crate::events::{TreeEvent, TreeObserver};
use crate::sources::SourceRegistry;

/// Data-model version reported at the tree root.
pub const SCHEMA_VERSION: &str = "1.7.0";

/// Latest value written by one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceValue {
    pub value: Value,
    /// Update timestamp of the write, not arrival time.
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgn: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentence: Option<String>,
}

impl SourceValue {
    fn to_node(&self) -> Value {
        let mut node = Map::new();
        node.insert("value".to_string(), self.value.clone());
        node.insert("timestamp".to_string(), json!(self.timestamp.to_iso_string()));
        insert_message(&mut node, self.pgn, self.sentence.as_deref());
        Value::Object(node)
    }
}

/// A value leaf in the tree.
///
/// The top-level fields mirror the most recent write from any source;
/// `values` keeps the latest write of every source seen on the path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Leaf {
    /// Most recent value, whichever source wrote it.
    pub value: Value,
    /// Source of `value`.
    #[serde(rename = "$source")]
    pub source: SourceRef,
    pub timestamp: Timestamp,
    /// PGN carried by the writing source's descriptor, if NMEA 2000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgn: Option<u32>,
    /// Sentence carried by the writing source's descriptor, if NMEA 0183.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentence: Option<String>,
    /// Per-source latest values. Always populated, even with one source.
    pub values: BTreeMap<SourceRef, SourceValue>,
}

impl Leaf {
    pub fn new(
        value: Value,
        source: SourceRef,
        timestamp: Timestamp,
        descriptor: Option<&SourceDescriptor>,
    ) -> Self {
        let mut leaf = Self {
            value: Value::Null,
            source: source.clone(),
            timestamp,
            pgn: None,
            sentence: None,
            values: BTreeMap::new(),
        };
        leaf.record(value, source, timestamp, descriptor);
        leaf
    }

    /// Write a new observation: last writer wins at the top level, and the
    /// source's own entry under `values` is replaced.
    pub fn record(
        &mut self,
        value: Value,
        source: SourceRef,
        timestamp: Timestamp,
        descriptor: Option<&SourceDescriptor>,
    ) {
        let entry = self
            .values
            .entry(source.clone())
            .or_insert_with(|| SourceValue {
                value: Value::Null,
                timestamp,
                pgn: None,
                sentence: None,
            });
        entry.value = value.clone();
        entry.timestamp = timestamp;
        apply_message(&mut entry.pgn, &mut entry.sentence, descriptor);

        self.value = value;
        self.source = source;
        self.timestamp = timestamp;
        apply_message(&mut self.pgn, &mut self.sentence, descriptor);
    }

    /// Value last written by `source`, if it ever wrote this path.
    pub fn value_from(&self, source: &SourceRef) -> Option<&Value> {
        self.values.get(source).map(|v| &v.value)
    }

    fn to_node(&self) -> Map<String, Value> {
        let mut node = Map::new();
        node.insert("value".to_string(), self.value.clone());
        node.insert("$source".to_string(), json!(self.source.as_str()));
        node.insert("timestamp".to_string(), json!(self.timestamp.to_iso_string()));
        insert_message(&mut node, self.pgn, self.sentence.as_deref());
        let values: Map<String, Value> = self
            .values
            .iter()
            .map(|(source, v)| (source.as_str().to_string(), v.to_node()))
            .collect();
        node.insert("values".to_string(), Value::Object(values));
        node
    }
}

/// A PGN clears the sentence and vice versa; descriptors carrying neither
/// leave both untouched.
fn apply_message(
    pgn: &mut Option<u32>,
    sentence: &mut Option<String>,
    descriptor: Option<&SourceDescriptor>,
) {
    let Some(descriptor) = descriptor else {
        return;
    };
    if let Some(p) = descriptor.pgn {
        *pgn = Some(p);
        *sentence = None;
    }
    if let Some(s) = &descriptor.sentence {
        *sentence = Some(s.clone());
        *pgn = None;
    }
}

fn insert_message(node: &mut Map<String, Value>, pgn: Option<u32>, sentence: Option<&str>) {
    if let Some(pgn) = pgn {
        node.insert("pgn".to_string(), json!(pgn));
    }
    if let Some(sentence) = sentence {
        node.insert("sentence".to_string(), json!(sentence));
    }
}

/// Get (or create) the object stored under `key`, replacing any non-object
/// value found there.
pub(crate) fn object_slot<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
) -> Option<&'a mut Map<String, Value>> {
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
}

/// Recursive object merge; non-object values overwrite.
pub(crate) fn deep_merge(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Per-context state.
#[derive(Debug, Clone, Default)]
struct ContextState {
    /// Identity fields and everything root-merged through the empty path.
    fields: Map<String, Value>,
    leaves: BTreeMap<Path, Leaf>,
    meta: BTreeMap<Path, Map<String, Value>>,
    /// Latest update timestamp merged into this context (ms).
    last_modified: i64,
}

impl ContextState {
    fn new(id: &str) -> Self {
        let (field, value) = identity_field(id);
        let mut fields = Map::new();
        fields.insert(field.to_string(), json!(value));
        Self {
            fields,
            ..Self::default()
        }
    }

    fn render(&self, path_filter: Option<&str>) -> Value {
        let mut root = self.fields.clone();
        let within = |path: &Path| path_filter.map_or(true, |f| path.is_within(f));

        for (path, leaf) in self.leaves.iter().filter(|(p, _)| within(*p)) {
            insert_node(&mut root, path, leaf.to_node());
        }
        for (path, meta) in self.meta.iter().filter(|(p, _)| within(*p)) {
            let mut node = Map::new();
            node.insert("meta".to_string(), Value::Object(meta.clone()));
            insert_node(&mut root, path, node);
        }
        Value::Object(root)
    }
}

/// Place `node` at the dotted `path`, merging with whatever object is
/// already there.
fn insert_node(root: &mut Map<String, Value>, path: &Path, node: Map<String, Value>) {
    let segments: Vec<&str> = path.segments().collect();
    let Some((last, parents)) = segments.split_last() else {
        root.extend(node);
        return;
    };
    let mut cursor = root;
    for segment in parents {
        match object_slot(cursor, segment) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Some(target) = object_slot(cursor, last) {
        target.extend(node);
    }
}

/// The canonical state tree.
pub struct StateTree {
    identity: SelfIdentity,
    self_context: Context,
    defaults: Map<String, Value>,
    contexts: BTreeMap<Context, ContextState>,
    sources: SourceRegistry,
    observers: Vec<Box<dyn TreeObserver>>,
}

impl StateTree {
    pub fn new(identity: SelfIdentity) -> Self {
        Self::with_defaults(identity, Map::new())
    }

    /// Build a tree whose self context starts out with `defaults` merged into
    /// its root (name, design data and the like).
    pub fn with_defaults(identity: SelfIdentity, defaults: Map<String, Value>) -> Self {
        let self_context = identity.context();
        let urn = identity.urn();
        let mut self_state = ContextState::new(&urn);
        deep_merge(&mut self_state.fields, &defaults);

        let mut contexts = BTreeMap::new();
        contexts.insert(self_context.clone(), self_state);

        info!(self_context = %self_context, "State tree created");

        Self {
            identity,
            self_context,
            defaults,
            contexts,
            sources: SourceRegistry::new(),
            observers: Vec::new(),
        }
    }

    /// An empty tree with the same identity and defaults, without observers.
    pub fn fresh(&self) -> Self {
        Self::with_defaults(self.identity.clone(), self.defaults.clone())
    }

    pub fn identity(&self) -> &SelfIdentity {
        &self.identity
    }

    /// The resolved self context, `vessels.<urn>`.
    pub fn self_context(&self) -> &Context {
        &self.self_context
    }

    /// Rewrite the `vessels.self` alias to the resolved self context.
    pub fn resolve_context(&self, context: &Context) -> Context {
        if context.is_self_alias() {
            self.self_context.clone()
        } else {
            context.clone()
        }
    }

    pub fn subscribe<O: TreeObserver + 'static>(&mut self, observer: O) {
        self.observers.push(Box::new(observer));
    }

    /// Merge a delta into the tree and return the writes it produced.
    pub fn merge(&mut self, delta: &Delta) -> Vec<TreeEvent> {
        let context = match &delta.context {
            Some(context) => self.resolve_context(context),
            None => self.self_context.clone(),
        };
        let Some(id) = context.split().1.map(str::to_string) else {
            debug!(context = %context, "Skipping delta for context without id");
            return Vec::new();
        };
        if delta.updates.iter().all(Update::is_empty) {
            return Vec::new();
        }

        let state = self
            .contexts
            .entry(context.clone())
            .or_insert_with(|| ContextState::new(&id));
        let mut events = Vec::new();

        for update in delta.updates.iter().filter(|u| !u.is_empty()) {
            let source = update.source_ref();
            let timestamp = update.timestamp.unwrap_or_else(Timestamp::now);
            self.sources.record(update, timestamp);
            state.last_modified = state.last_modified.max(timestamp.millis());

            for PathValue { path, value } in update.values.iter().flatten() {
                if path.is_root() {
                    if let Value::Object(fields) = value {
                        deep_merge(&mut state.fields, fields);
                    }
                    continue;
                }
                let descriptor = update.source.as_ref();
                let leaf = state
                    .leaves
                    .entry(path.clone())
                    .and_modify(|leaf| {
                        leaf.record(value.clone(), source.clone(), timestamp, descriptor)
                    })
                    .or_insert_with(|| {
                        Leaf::new(value.clone(), source.clone(), timestamp, descriptor)
                    });
                events.push(TreeEvent::Value {
                    context: context.clone(),
                    path: path.clone(),
                    leaf: leaf.clone(),
                });
            }

            for meta in update.meta.iter().flatten() {
                let Value::Object(incoming) = &meta.value else {
                    continue;
                };
                let merged = state.meta.entry(meta.path.clone()).or_default();
                for (key, value) in incoming {
                    merged.insert(key.clone(), value.clone());
                }
                events.push(TreeEvent::Meta {
                    context: context.clone(),
                    path: meta.path.clone(),
                    update: incoming.clone(),
                    merged: merged.clone(),
                    timestamp,
                });
            }
        }

        debug!(
            context = %context,
            updates = delta.updates.len(),
            writes = events.len(),
            "Merged delta"
        );

        self.notify(&events);
        events
    }

    fn notify(&mut self, events: &[TreeEvent]) {
        for event in events {
            for observer in self.observers.iter_mut() {
                match event {
                    TreeEvent::Value {
                        context,
                        path,
                        leaf,
                    } => observer.on_value(context, path, leaf),
                    TreeEvent::Meta {
                        context,
                        path,
                        merged,
                        ..
                    } => observer.on_meta(context, path, merged),
                }
            }
        }
    }

    pub fn leaf(&self, context: &Context, path: &Path) -> Option<&Leaf> {
        self.contexts
            .get(&self.resolve_context(context))
            .and_then(|state| state.leaves.get(path))
    }

    pub fn meta(&self, context: &Context, path: &Path) -> Option<&Map<String, Value>> {
        self.contexts
            .get(&self.resolve_context(context))
            .and_then(|state| state.meta.get(path))
    }

    /// Render the whole tree, or only the contexts matching `context_filter`.
    pub fn retrieve(&self, context_filter: Option<&str>) -> Value {
        self.retrieve_filtered(context_filter, None)
    }

    /// Render the tree keeping only matching contexts and, inside them,
    /// only paths equal to or below `path_filter`.
    pub fn retrieve_filtered(&self, context_filter: Option<&str>, path_filter: Option<&str>) -> Value {
        let filter = context_filter.map(|f| {
            if f == SELF_ALIAS {
                self.self_context.as_str().to_string()
            } else {
                f.to_string()
            }
        });

        let mut root = Map::new();
        root.insert("version".to_string(), json!(SCHEMA_VERSION));
        root.insert("self".to_string(), json!(self.self_context.as_str()));
        root.insert("vessels".to_string(), Value::Object(Map::new()));

        for (context, state) in &self.contexts {
            if let Some(filter) = &filter {
                if !context.matches(filter) {
                    continue;
                }
            }
            let (group, Some(id)) = context.split() else {
                continue;
            };
            if let Some(entities) = object_slot(&mut root, group) {
                entities.insert(id.to_string(), state.render(path_filter));
            }
        }

        root.insert("sources".to_string(), self.sources.to_value());
        Value::Object(root)
    }

    /// One delta per (context, path, source) rebuilt from the latest
    /// per-source values, oldest first.
    pub fn cached_deltas(&self, context_filter: Option<&str>) -> Vec<Delta> {
        let mut deltas: Vec<Delta> = Vec::new();
        for (context, state) in &self.contexts {
            if let Some(filter) = context_filter {
                if !context.matches(filter) && !(filter == SELF_ALIAS && *context == self.self_context) {
                    continue;
                }
            }
            for (path, leaf) in &state.leaves {
                for (source, entry) in &leaf.values {
                    deltas.push(Delta::new(context.clone()).with_update(Update::values(
                        source.clone(),
                        entry.timestamp,
                        vec![PathValue::new(path.clone(), entry.value.clone())],
                    )));
                }
            }
        }
        deltas.sort_by_key(|d| d.latest_timestamp());
        deltas
    }

    /// Drop contexts other than self that have not been modified within
    /// `max_age_ms` of `now`. Returns the removed contexts.
    pub fn prune_contexts(&mut self, max_age_ms: i64, now: Timestamp) -> Vec<Context> {
        let threshold = now.millis() - max_age_ms;
        let stale: Vec<Context> = self
            .contexts
            .iter()
            .filter(|(context, state)| {
                **context != self.self_context && state.last_modified < threshold
            })
            .map(|(context, _)| context.clone())
            .collect();

        for context in &stale {
            self.contexts.remove(context);
            debug!(context = %context, "Pruned context");
        }
        stale
    }

    pub fn contexts(&self) -> impl Iterator<Item = &Context> {
        self.contexts.keys()
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }
}

impl std::fmt::Debug for StateTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTree")
            .field("self_context", &self.self_context)
            .field("contexts", &self.contexts.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
