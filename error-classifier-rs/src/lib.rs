//! # Error Classification Engine
//!
//! Advises callers how to react to a transport or application failure:
//! which class it belongs to, whether to retry, how often, and with what
//! delay. Stays available when the optional remote inference backend is
//! down.
//!
//! ## Features
//!
//! - Input sanitization that clamps and truncates untrusted context
//! - Deterministic decision-tree classification
//! - Circuit breaker around the remote classifier
//! - Bounded TTL result cache
//! - Non-blocking batched persistence of training records
//! - Crash-safe aggregate state checkpointing
//!

pub mod types;
pub mod model;
pub mod config;
pub mod logging;
pub mod sanitization;
pub mod decision_tree;
pub mod circuit_breaker;
pub mod cache;
pub mod remote;
pub mod batch_logger;
pub mod state_store;
pub mod service;

// Re-export commonly used types
pub use types::{Error, ErrorKind, Result};
pub use model::{Classification, ErrorContext, LogRecord, ModelSource, Outcome, RetryAction};
pub use config::ClassifierConfig;
pub use logging::{init_logging, LoggingConfig};
pub use sanitization::sanitize_context;
pub use circuit_breaker::{CircuitBreaker, BreakerConfig, CircuitState};
pub use cache::ResultCache;
pub use remote::{HttpRemoteClassifier, RemoteClassifier};
pub use batch_logger::{BatchLogger, FlushReport};
pub use state_store::{PersistedState, StateStore};
pub use service::{ClassificationService, HealthReport, ServiceMode};

/// Initializes logging and builds a started service from configuration
pub async fn init(config: ClassifierConfig) -> Result<ClassificationService> {
    init_logging(Some(config.logging.clone()))?;
    let service = ClassificationService::from_config(config)?;
    service.start().await;
    Ok(service)
}
