//! Identifier types for contexts, paths and sources
//!
//! All three are thin string newtypes. They exist so that a context can never
//! be passed where a path is expected, and so that the canonical source
//! identity is resolved once at the ingestion boundary and then carried
//! around as a plain string.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Alias accepted in deltas and lookups for the local vessel.
pub const SELF_ALIAS: &str = "vessels.self";

/// Source identity used when an update names no source at all.
pub const UNKNOWN_SOURCE: &str = "unknown";

const MMSI_PREFIX: &str = "urn:mrn:imo:mmsi:";
const UUID_PREFIX: &str = "urn:mrn:signalk:uuid:";

/// The entity a delta pertains to, e.g. `vessels.urn:mrn:imo:mmsi:230099999`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(String);

impl Context {
    pub fn new(context: impl Into<String>) -> Self {
        Self(context.into())
    }

    /// The unresolved `vessels.self` alias.
    pub fn self_alias() -> Self {
        Self(SELF_ALIAS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_self_alias(&self) -> bool {
        self.0 == SELF_ALIAS
    }

    /// Split into the entity group and the entity id.
    ///
    /// Only the first dot separates the two, since ids such as
    /// `urn:mrn:imo:mmsi:...` never contain dots but could in principle.
    pub fn split(&self) -> (&str, Option<&str>) {
        match self.0.split_once('.') {
            Some((group, id)) if !id.is_empty() => (group, Some(id)),
            Some((group, _)) => (group, None),
            None => (self.0.as_str(), None),
        }
    }

    /// Match against a context filter.
    ///
    /// Supported forms: `*` (everything), an exact context, or a prefix
    /// ending in `*` such as `vessels.*`.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        match pattern.strip_suffix('*') {
            Some(prefix) => self.0.starts_with(prefix),
            None => self.0 == pattern,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Context {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Dot-separated data path inside a context. The empty path is the
/// context root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Path(String);

impl Path {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.').filter(|s| !s.is_empty())
    }

    /// True when this path equals `prefix` or lies underneath it.
    pub fn is_within(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return true;
        }
        match self.0.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }

    /// Prefix this path with another segment, e.g. `notifications`.
    pub fn prefixed(&self, prefix: &str) -> Self {
        if self.is_root() {
            Self(prefix.to_string())
        } else {
            Self(format!("{}.{}", prefix, self.0))
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Canonical string identity of the sensor or provider behind a value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRef(String);

impl SourceRef {
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_SOURCE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identity of the local vessel, fixed when the state tree is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SelfIdentity {
    /// `urn:mrn:imo:mmsi:<mmsi>`
    Mmsi(String),
    /// `urn:mrn:signalk:uuid:<uuid>`
    Uuid(Uuid),
}

impl SelfIdentity {
    pub fn from_mmsi(mmsi: impl Into<String>) -> Self {
        Self::Mmsi(mmsi.into())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::Uuid(uuid)
    }

    /// A fresh random identity for vessels with neither MMSI nor UUID.
    pub fn generate() -> Self {
        Self::Uuid(Uuid::new_v4())
    }

    /// Pick the MMSI when known, else the UUID, else a generated UUID.
    pub fn resolve(mmsi: Option<&str>, uuid: Option<Uuid>) -> Self {
        match (mmsi, uuid) {
            (Some(mmsi), _) if !mmsi.is_empty() => Self::from_mmsi(mmsi),
            (_, Some(uuid)) => Self::from_uuid(uuid),
            _ => Self::generate(),
        }
    }

    pub fn urn(&self) -> String {
        match self {
            SelfIdentity::Mmsi(mmsi) => format!("{}{}", MMSI_PREFIX, mmsi),
            SelfIdentity::Uuid(uuid) => format!("{}{}", UUID_PREFIX, uuid),
        }
    }

    /// The resolved self context, `vessels.<urn>`.
    pub fn context(&self) -> Context {
        Context::new(format!("vessels.{}", self.urn()))
    }
}

/// Identity fields a context root carries, derived from its id.
///
/// Returns the field name and value: `mmsi` for IMO urns, `uuid` for
/// Signal K urns and `url` for anything else.
pub fn identity_field(id: &str) -> (&'static str, String) {
    if let Some(mmsi) = id.strip_prefix(MMSI_PREFIX) {
        ("mmsi", mmsi.to_string())
    } else if id.starts_with("urn:mrn:signalk") {
        ("uuid", id.to_string())
    } else {
        ("url", id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_split() {
        let ctx = Context::new("vessels.urn:mrn:imo:mmsi:230099999");
        assert_eq!(ctx.split(), ("vessels", Some("urn:mrn:imo:mmsi:230099999")));

        let bare = Context::new("vessels");
        assert_eq!(bare.split(), ("vessels", None));
    }

    #[test]
    fn test_context_matches() {
        let ctx = Context::new("vessels.urn:mrn:imo:mmsi:230099999");
        assert!(ctx.matches("*"));
        assert!(ctx.matches("vessels.*"));
        assert!(ctx.matches("vessels.urn:mrn:imo:mmsi:230099999"));
        assert!(!ctx.matches("aircraft.*"));
        assert!(!ctx.matches("vessels.urn:mrn:imo:mmsi:1"));
    }

    #[test]
    fn test_path_is_within() {
        let path = Path::new("navigation.position");
        assert!(path.is_within("navigation"));
        assert!(path.is_within("navigation.position"));
        assert!(path.is_within(""));
        assert!(!path.is_within("navigation.pos"));
        assert!(!path.is_within("environment"));
    }

    #[test]
    fn test_path_prefixed() {
        assert_eq!(
            Path::new("environment.depth").prefixed("notifications"),
            Path::new("notifications.environment.depth")
        );
        assert_eq!(Path::root().prefixed("notifications"), Path::new("notifications"));
    }

    #[test]
    fn test_self_identity_prefers_mmsi() {
        let id = SelfIdentity::resolve(Some("230099999"), Some(Uuid::nil()));
        assert_eq!(id.urn(), "urn:mrn:imo:mmsi:230099999");
        assert_eq!(id.context().as_str(), "vessels.urn:mrn:imo:mmsi:230099999");
    }

    #[test]
    fn test_self_identity_falls_back_to_uuid() {
        let id = SelfIdentity::resolve(None, Some(Uuid::nil()));
        assert_eq!(
            id.urn(),
            "urn:mrn:signalk:uuid:00000000-0000-0000-0000-000000000000"
        );

        let generated = SelfIdentity::resolve(Some(""), None);
        assert!(generated.urn().starts_with("urn:mrn:signalk:uuid:"));
    }

    #[test]
    fn test_identity_field() {
        assert_eq!(
            identity_field("urn:mrn:imo:mmsi:230099999"),
            ("mmsi", "230099999".to_string())
        );
        assert_eq!(
            identity_field("urn:mrn:signalk:uuid:abc").0,
            "uuid"
        );
        assert_eq!(identity_field("http://example.org").0, "url");
    }

    #[test]
    fn test_source_ref_serialization() {
        let src = SourceRef::new("n2k.115");
        let json = serde_json::to_string(&src).unwrap();
        assert_eq!(json, "\"n2k.115\"");
    }
}
