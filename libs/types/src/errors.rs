//! Error types for the delta engine
//!
//! The core itself favours silent no-ops over errors; these types only cover
//! the boundaries: parsing timestamps, loading configuration and talking to
//! the delivery hub.

use thiserror::Error;

/// Top-level error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Timestamp error: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Timestamp parsing errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimestampError {
    #[error("Invalid timestamp {input:?}: {reason}")]
    Invalid { input: String, reason: String },

    #[error("Timestamp out of range: {0} ms")]
    OutOfRange(i64),
}

/// Configuration loading errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Malformed config: {0}")]
    Malformed(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Consumer delivery errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Consumer not found: {consumer_id}")]
    ConsumerNotFound { consumer_id: u64 },

    #[error("Consumer limit reached: {limit}")]
    ConsumerLimit { limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_error_display() {
        let err = TimestampError::Invalid {
            input: "nope".to_string(),
            reason: "input contains invalid characters".to_string(),
        };
        assert!(err.to_string().contains("\"nope\""));
    }

    #[test]
    fn test_engine_error_from_config_error() {
        let err: EngineError = ConfigError::Malformed("eof".to_string()).into();
        assert!(matches!(err, EngineError::Config(_)));
        assert_eq!(err.to_string(), "Config error: Malformed config: eof");
    }
}
