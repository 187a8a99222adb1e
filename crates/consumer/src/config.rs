//! Runtime configuration.
//!
//! Every component has its own config struct with `Default` and `with_*`
//! builders; [`CourierSettings`] aggregates them so a deployment can load the
//! whole runtime configuration from one JSON document. Durations are given in
//! milliseconds.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dead_letter::{DeadLetterConfig, DeadLetterManagerConfig, RetryStrategyConfig};
use crate::listener::ContainerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Whole-runtime settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierSettings {
    pub container: ContainerConfig,
    pub retry: RetryStrategyConfig,
    pub dead_letter: DeadLetterConfig,
    pub dead_letter_manager: DeadLetterManagerConfig,
}

impl CourierSettings {
    /// Parse and validate a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container.subscription.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "container.subscription must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter must be within 0.0..=1.0, got {}",
                self.retry.jitter
            )));
        }
        if self.dead_letter.batch_parallelism == 0 {
            return Err(ConfigError::Invalid(
                "dead_letter.batch_parallelism must be at least 1".to_string(),
            ));
        }
        if self.container.receive_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "container.receive_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
