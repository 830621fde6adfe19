//! Engine configuration
//!
//! Every section deserializes with defaults, so a host can hand over a
//! partial JSON document and get a usable configuration back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use signalk_types::errors::ConfigError;
use signalk_types::ids::SelfIdentity;
use uuid::Uuid;

use crate::arbitration::ArbitrationConfig;
use crate::delivery::DeliveryConfig;
use crate::history::HistoryConfig;

/// Who "self" is, plus the static data seeded into the self context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub mmsi: Option<String>,
    pub uuid: Option<Uuid>,
    /// Merged into the self context root at startup (name, design data).
    pub defaults: Map<String, Value>,
}

impl IdentityConfig {
    /// MMSI wins over UUID; with neither a fresh UUID is generated.
    pub fn resolve(&self) -> SelfIdentity {
        SelfIdentity::resolve(self.mmsi.as_deref(), self.uuid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub identity: IdentityConfig,
    pub history: HistoryConfig,
    pub arbitration: ArbitrationConfig,
    pub delivery: DeliveryConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_json::from_str(input).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.identity.mmsi.as_deref(), Some(mmsi) if mmsi.is_empty()) {
            return Err(invalid("identity.mmsi", "must not be empty"));
        }
        if self.arbitration.default_timeout < 0 {
            return Err(invalid("arbitration.defaultTimeout", "must not be negative"));
        }
        if self.delivery.queue_capacity == 0 {
            return Err(invalid("delivery.queue_capacity", "must be positive"));
        }
        if self.delivery.max_consumers == 0 {
            return Err(invalid("delivery.max_consumers", "must be positive"));
        }
        if self.delivery.flush_interval_ms == 0 {
            return Err(invalid("delivery.flush_interval_ms", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalk_types::ids::Path;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.arbitration.default_timeout, 120_000);
        assert_eq!(config.delivery.queue_capacity, 512);
    }

    #[test]
    fn test_full_document() {
        let config = EngineConfig::from_json(
            r#"{
                "identity": { "mmsi": "230099999", "defaults": { "name": "Freya" } },
                "history": { "capacity": 50 },
                "arbitration": {
                    "priorities": {
                        "navigation.position": [
                            { "sourceRef": "gps1", "timeout": 0 },
                            { "sourceRef": "gps2", "timeout": 5000 }
                        ]
                    },
                    "defaultTimeout": 60000
                },
                "delivery": { "queue_capacity": 8 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.history.capacity, 50);
        assert_eq!(config.arbitration.default_timeout, 60_000);
        let list = &config.arbitration.priorities[&Path::new("navigation.position")];
        assert_eq!(list[1].timeout, 5000);
        assert_eq!(config.delivery.queue_capacity, 8);
        assert_eq!(config.delivery.max_consumers, 1024);
        assert_eq!(
            config.identity.resolve().urn(),
            "urn:mrn:imo:mmsi:230099999"
        );
    }

    #[test]
    fn test_malformed_json() {
        let err = EngineConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = EngineConfig::from_json(r#"{ "delivery": { "queue_capacity": 0 } }"#).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                field: "delivery.queue_capacity".to_string(),
                reason: "must be positive".to_string(),
            }
        );

        let err =
            EngineConfig::from_json(r#"{ "arbitration": { "defaultTimeout": -1 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_uuid_identity() {
        let uuid = Uuid::new_v4();
        let identity = IdentityConfig {
            uuid: Some(uuid),
            ..IdentityConfig::default()
        };
        assert_eq!(identity.resolve().urn(), format!("urn:mrn:signalk:uuid:{uuid}"));
    }
}
