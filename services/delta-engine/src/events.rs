//! Live-update events emitted by the state tree
//!
//! Every write performed by [`StateTree::merge`](crate::state_tree::StateTree::merge)
//! produces one [`TreeEvent`]. The events are returned to the caller and
//! also pushed synchronously to every registered [`TreeObserver`], in write
//! order, before `merge` returns.

use serde_json::{Map, Value};
use signalk_types::ids::{Context, Path};
use signalk_types::timestamp::Timestamp;

use crate::state_tree::Leaf;

/// A single write to the canonical tree.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeEvent {
    /// A leaf value was written.
    Value {
        context: Context,
        path: Path,
        leaf: Leaf,
    },
    /// Metadata was merged into a path.
    Meta {
        context: Context,
        path: Path,
        /// The object carried by the incoming update.
        update: Map<String, Value>,
        /// The full meta object after the shallow merge.
        merged: Map<String, Value>,
        timestamp: Timestamp,
    },
}

impl TreeEvent {
    pub fn context(&self) -> &Context {
        match self {
            TreeEvent::Value { context, .. } | TreeEvent::Meta { context, .. } => context,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            TreeEvent::Value { path, .. } | TreeEvent::Meta { path, .. } => path,
        }
    }

    /// Get the event type as a string label for logging.
    pub fn event_type_label(&self) -> &'static str {
        match self {
            TreeEvent::Value { .. } => "Value",
            TreeEvent::Meta { .. } => "Meta",
        }
    }
}

/// Synchronous watcher of tree writes.
pub trait TreeObserver: Send {
    fn on_value(&mut self, context: &Context, path: &Path, leaf: &Leaf);

    fn on_meta(&mut self, _context: &Context, _path: &Path, _merged: &Map<String, Value>) {}
}

impl<F> TreeObserver for F
where
    F: FnMut(&Context, &Path, &Leaf) + Send,
{
    fn on_value(&mut self, context: &Context, path: &Path, leaf: &Leaf) {
        self(context, path, leaf)
    }
}
