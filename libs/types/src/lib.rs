//! Types library for the vessel delta engine
//!
//! Shared data-model definitions: identifiers, timestamps, the delta wire
//! shape, alarm zones and the error taxonomy. Hosts that only parse or
//! produce deltas depend on this crate alone.
//!
//! # Modules
//! - `ids`: Context, Path, SourceRef and the self-vessel identity
//! - `timestamp`: ISO-8601 timestamps compared as integer milliseconds
//! - `delta`: Delta, Update, PathValue, PathMeta, SourceDescriptor
//! - `zone`: Zone, AlarmState, AlarmMethod, ZoneMethods, Notification
//! - `errors`: Error taxonomy

pub mod ids;
pub mod timestamp;
pub mod delta;
pub mod zone;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::timestamp::*;
    pub use crate::delta::*;
    pub use crate::zone::*;
    pub use crate::errors::*;
}
