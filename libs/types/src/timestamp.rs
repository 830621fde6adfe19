//! Wall-clock timestamps carried by updates
//!
//! Deltas carry ISO-8601 strings. They are parsed once at the
//! deserialization boundary; everything downstream compares integer
//! milliseconds since the epoch and never the strings themselves.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::TimestampError;

/// A UTC instant with millisecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Parse an RFC 3339 / ISO-8601 string.
    pub fn parse(s: &str) -> Result<Self, TimestampError> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self(dt.with_timezone(&Utc)))
            .map_err(|e| TimestampError::Invalid {
                input: s.to_string(),
                reason: e.to_string(),
            })
    }

    /// Build from milliseconds since the Unix epoch.
    pub fn from_millis(millis: i64) -> Result<Self, TimestampError> {
        Utc.timestamp_millis_opt(millis)
            .single()
            .map(Self)
            .ok_or(TimestampError::OutOfRange(millis))
    }

    /// Milliseconds since the Unix epoch.
    pub fn millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Canonical string form: RFC 3339, milliseconds, `Z` suffix.
    pub fn to_iso_string(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_iso_string())
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_millis() {
        let ts = Timestamp::parse("2024-02-16T22:50:56.789Z").unwrap();
        assert_eq!(ts.millis(), 1708123856789);
    }

    #[test]
    fn test_offset_is_normalized_to_utc() {
        let a = Timestamp::parse("2024-02-16T22:50:56.789Z").unwrap();
        let b = Timestamp::parse("2024-02-17T00:50:56.789+02:00").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_timestamp_rejected() {
        let err = Timestamp::parse("yesterday").unwrap_err();
        assert!(matches!(err, TimestampError::Invalid { .. }));
    }

    #[test]
    fn test_iso_string_uses_millis_and_z() {
        let ts = Timestamp::from_millis(0).unwrap();
        assert_eq!(ts.to_iso_string(), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_ordering_follows_instant_not_text() {
        // Lexical order would put "+02:00" after "Z" even though it is earlier.
        let utc = Timestamp::parse("2024-01-01T00:30:00Z").unwrap();
        let offset = Timestamp::parse("2024-01-01T01:00:00+02:00").unwrap();
        assert!(offset < utc);
    }

    #[test]
    fn test_serde_uses_string_form() {
        let ts = Timestamp::from_millis(1_000).unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"1970-01-01T00:00:01.000Z\"");
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }
}
