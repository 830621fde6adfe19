//! Alarm zones and notifications
//!
//! Zones live in path metadata:
//!
//! ```json
//! { "zones": [{ "lower": 0, "upper": 2.5, "state": "alarm", "message": "Shallow" }],
//!   "alarmMethod": ["sound", "visual"] }
//! ```
//!
//! Each zone is a half-open interval `[lower, upper)`; a missing bound is
//! unbounded on that side.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Severity carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmState {
    Nominal,
    Normal,
    Alert,
    Warn,
    Alarm,
    Emergency,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Nominal => "nominal",
            AlarmState::Normal => "normal",
            AlarmState::Alert => "alert",
            AlarmState::Warn => "warn",
            AlarmState::Alarm => "alarm",
            AlarmState::Emergency => "emergency",
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a notification should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmMethod {
    Visual,
    Sound,
}

/// A value interval mapped to an alarm state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,
    pub state: AlarmState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Zone {
    /// Lower bound inclusive, upper bound exclusive.
    pub fn contains(&self, value: f64) -> bool {
        self.lower.map_or(true, |lower| value >= lower)
            && self.upper.map_or(true, |upper| value < upper)
    }

    /// The configured message, or a description of the interval.
    pub fn message_or_default(&self) -> String {
        match &self.message {
            Some(message) if !message.is_empty() => message.clone(),
            _ => format!(
                "{} <= value < {}",
                self.lower.map_or_else(|| "-inf".to_string(), |l| l.to_string()),
                self.upper.map_or_else(|| "inf".to_string(), |u| u.to_string()),
            ),
        }
    }
}

/// Per-state notification methods.
///
/// Each field distinguishes "absent" (`None`, defaults to visual) from an
/// explicit `null` (`Some(None)`, no methods at all).
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneMethods {
    #[serde(default, deserialize_with = "explicit_null")]
    pub nominal_method: Option<Option<Vec<AlarmMethod>>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub normal_method: Option<Option<Vec<AlarmMethod>>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub alert_method: Option<Option<Vec<AlarmMethod>>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub warn_method: Option<Option<Vec<AlarmMethod>>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub alarm_method: Option<Option<Vec<AlarmMethod>>>,
    #[serde(default, deserialize_with = "explicit_null")]
    pub emergency_method: Option<Option<Vec<AlarmMethod>>>,
}

impl ZoneMethods {
    /// Take every method the other set configures, absent or not.
    pub fn overlay(&mut self, other: ZoneMethods) {
        let pairs = [
            (&mut self.nominal_method, other.nominal_method),
            (&mut self.normal_method, other.normal_method),
            (&mut self.alert_method, other.alert_method),
            (&mut self.warn_method, other.warn_method),
            (&mut self.alarm_method, other.alarm_method),
            (&mut self.emergency_method, other.emergency_method),
        ];
        for (mine, theirs) in pairs {
            if theirs.is_some() {
                *mine = theirs;
            }
        }
    }

    /// Look up `<state>Method`.
    pub fn method_for(&self, state: AlarmState) -> Vec<AlarmMethod> {
        let configured = match state {
            AlarmState::Nominal => &self.nominal_method,
            AlarmState::Normal => &self.normal_method,
            AlarmState::Alert => &self.alert_method,
            AlarmState::Warn => &self.warn_method,
            AlarmState::Alarm => &self.alarm_method,
            AlarmState::Emergency => &self.emergency_method,
        };
        match configured {
            Some(Some(methods)) => methods.clone(),
            Some(None) => Vec::new(),
            None => vec![AlarmMethod::Visual],
        }
    }
}

fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// The value written under `notifications.<path>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub state: AlarmState,
    pub method: Vec<AlarmMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_zone_bounds() {
        let zone = Zone {
            lower: Some(10.0),
            upper: Some(20.0),
            state: AlarmState::Warn,
            message: None,
        };
        assert!(zone.contains(10.0));
        assert!(zone.contains(19.99));
        assert!(!zone.contains(20.0));
        assert!(!zone.contains(9.999));
    }

    #[test]
    fn test_open_bounds() {
        let below = Zone {
            lower: None,
            upper: Some(0.0),
            state: AlarmState::Alarm,
            message: None,
        };
        assert!(below.contains(f64::MIN));
        assert!(!below.contains(0.0));
        assert_eq!(below.message_or_default(), "-inf <= value < 0");
    }

    #[test]
    fn test_method_lookup() {
        let methods: ZoneMethods = serde_json::from_value(json!({
            "alarmMethod": ["sound", "visual"],
            "warnMethod": null
        }))
        .unwrap();

        assert_eq!(
            methods.method_for(AlarmState::Alarm),
            vec![AlarmMethod::Sound, AlarmMethod::Visual]
        );
        assert!(methods.method_for(AlarmState::Warn).is_empty());
        assert_eq!(methods.method_for(AlarmState::Emergency), vec![AlarmMethod::Visual]);
    }

    #[test]
    fn test_empty_message_uses_interval() {
        let zone = Zone {
            lower: Some(1.5),
            upper: None,
            state: AlarmState::Warn,
            message: Some(String::new()),
        };
        assert_eq!(zone.message_or_default(), "1.5 <= value < inf");
    }

    #[test]
    fn test_methods_overlay() {
        let mut methods: ZoneMethods =
            serde_json::from_value(json!({"alarmMethod": ["sound"]})).unwrap();
        let update: ZoneMethods = serde_json::from_value(json!({"warnMethod": null})).unwrap();
        methods.overlay(update);
        assert_eq!(methods.method_for(AlarmState::Alarm), vec![AlarmMethod::Sound]);
        assert!(methods.method_for(AlarmState::Warn).is_empty());
    }

    #[test]
    fn test_notification_shape() {
        let n = Notification {
            state: AlarmState::Normal,
            method: vec![],
            message: None,
        };
        assert_eq!(
            serde_json::to_value(&n).unwrap(),
            json!({"state": "normal", "method": []})
        );
    }
}
