//! # Engine Configuration
//!
//! Layered configuration: built-in defaults, then an optional file, then
//! `ERROR_CLASSIFIER__*` environment variables (`.env` files are honored).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::batch_logger::BatchConfig;
use crate::cache::CacheConfig;
use crate::circuit_breaker::BreakerConfig;
use crate::logging::LoggingConfig;
use crate::remote::RemoteConfig;
use crate::state_store::StateConfig;
use crate::types::Result;

const ENV_PREFIX: &str = "ERROR_CLASSIFIER";

/// Configuration validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("batch size {batch_size} exceeds queue capacity {max_queue_len}")]
    BatchLargerThanQueue { batch_size: usize, max_queue_len: usize },
}

impl From<ConfigError> for crate::types::Error {
    fn from(err: ConfigError) -> Self {
        crate::types::Error::new(crate::types::ErrorKind::Configuration, err.to_string()).cause(err)
    }
}

/// Top-level configuration for the classification service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Name used for logging and the circuit breaker
    pub service_name: String,
    /// Directory receiving one file per training record
    pub training_data_dir: PathBuf,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub state: StateConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            service_name: "error-classifier".to_string(),
            training_data_dir: PathBuf::from("data/training"),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            state: StateConfig::default(),
            remote: RemoteConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClassifierConfig {
    /// Loads configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Loading classifier configuration file");
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let loaded: ClassifierConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Checks the invariants the engine relies on
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Zero("breaker.failure_threshold"));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Zero("cache.capacity"));
        }
        if self.batch.batch_size == 0 {
            return Err(ConfigError::Zero("batch.batch_size"));
        }
        if self.batch.flush_interval.is_zero() {
            return Err(ConfigError::Zero("batch.flush_interval"));
        }
        if self.batch.batch_size > self.batch.max_queue_len {
            return Err(ConfigError::BatchLargerThanQueue {
                batch_size: self.batch.batch_size,
                max_queue_len: self.batch.max_queue_len,
            });
        }
        Ok(())
    }
}

/// Serde helpers for durations expressed in (possibly fractional) seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let cfg = ClassifierConfig::default();
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.cooldown, Duration::from_secs(60));
        assert_eq!(cfg.cache.capacity, 1000);
        assert_eq!(cfg.cache.ttl, Duration::from_secs(300));
        assert_eq!(cfg.batch.batch_size, 100);
        assert_eq!(cfg.batch.flush_interval, Duration::from_secs(5));
        assert_eq!(cfg.batch.max_files_in_dir, 10_000);
        assert_eq!(cfg.batch.max_file_size, 10 * 1024 * 1024);
        assert_eq!(cfg.state.max_state_file_size, 5 * 1024 * 1024);
        assert_eq!(cfg.remote.health_timeout, Duration::from_secs(2));
        assert_eq!(cfg.remote.classify_timeout, Duration::from_secs(1));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut cfg = ClassifierConfig::default();
        cfg.batch.batch_size = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("batch.batch_size")));
    }

    #[test]
    fn test_validate_rejects_oversized_batch() {
        let mut cfg = ClassifierConfig::default();
        cfg.batch.max_queue_len = 10;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BatchLargerThanQueue { batch_size: 100, max_queue_len: 10 })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{ "service_name": "edge", "breaker": {{ "failure_threshold": 3, "cooldown": 1.5 }}, "cache": {{ "capacity": 10 }} }}"#
        )
        .unwrap();

        let cfg = ClassifierConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.service_name, "edge");
        assert_eq!(cfg.breaker.failure_threshold, 3);
        assert_eq!(cfg.breaker.cooldown, Duration::from_millis(1500));
        assert_eq!(cfg.cache.capacity, 10);
        assert_eq!(cfg.cache.ttl, Duration::from_secs(300));
    }
}
