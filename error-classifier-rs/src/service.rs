//! # Classification Service
//!
//! Ties the engine together:
//!
//! ```text
//! classify(raw) -> sanitize -> cache hit? -> breaker allows? -> remote
//!                                                |               | failure
//!                                                v               v
//!                                          decision tree <-------+
//!                                  -> cache -> enqueue training record
//! ```
//!
//! The public operations never fail. Internal errors are logged and the
//! caller gets the decision-tree answer, or [`Classification::unknown`] as
//! the last resort.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::batch_logger::BatchLogger;
use crate::cache::{cache_key, ResultCache};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::ClassifierConfig;
use crate::decision_tree;
use crate::model::{Classification, ErrorContext, LogRecord, Outcome};
use crate::remote::{HttpRemoteClassifier, RemoteClassifier};
use crate::sanitization::sanitize_context;
use crate::state_store::StateStore;
use crate::types::{Error, ErrorKind, Result};

/// Whether the remote backend currently participates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceMode {
    NeuralEnhanced,
    DecisionTreeOnly,
}

/// Health summary of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub mode: ServiceMode,
    pub breaker_state: CircuitState,
    pub breaker_failures: u32,
    pub cache_size: usize,
    pub queue_size: usize,
    pub file_count: usize,
    pub file_count_healthy: bool,
}

/// The error classification engine. Construct once per process.
pub struct ClassificationService {
    config: ClassifierConfig,
    breaker: CircuitBreaker,
    cache: ResultCache,
    remote: Option<Arc<dyn RemoteClassifier>>,
    remote_healthy: AtomicBool,
    logger: Arc<BatchLogger>,
    state_store: Arc<StateStore>,
}

impl std::fmt::Debug for ClassificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassificationService")
            .field("service_name", &self.config.service_name)
            .field("remote", &self.remote.is_some())
            .field("breaker", &self.breaker.snapshot())
            .finish()
    }
}

impl ClassificationService {
    /// Builds the service, wiring the HTTP backend if one is configured
    pub fn from_config(config: ClassifierConfig) -> Result<Self> {
        config.validate()?;
        let remote = HttpRemoteClassifier::from_config(&config.remote)?
            .map(|client| Arc::new(client) as Arc<dyn RemoteClassifier>);
        Ok(Self::with_remote(config, remote))
    }

    /// Builds the service around an explicit (or absent) remote backend
    pub fn with_remote(config: ClassifierConfig, remote: Option<Arc<dyn RemoteClassifier>>) -> Self {
        let state_store = Arc::new(StateStore::new(config.state.clone()));
        let logger = Arc::new(BatchLogger::new(
            config.batch.clone(),
            config.training_data_dir.clone(),
            Arc::clone(&state_store),
        ));

        Self {
            breaker: CircuitBreaker::new(format!("{}-remote", config.service_name), config.breaker.clone()),
            cache: ResultCache::new(config.cache.clone()),
            remote_healthy: AtomicBool::new(remote.is_some()),
            remote,
            logger,
            state_store,
            config,
        }
    }

    /// Probes the remote backend and starts the flush timer
    pub async fn start(&self) {
        if let Some(remote) = &self.remote {
            let healthy = tokio::time::timeout(self.config.remote.health_timeout, remote.health_check())
                .await
                .unwrap_or(false);
            self.remote_healthy.store(healthy, Ordering::Relaxed);
            if healthy {
                info!("Remote classifier reachable, running neural-enhanced");
            } else {
                warn!("Remote classifier unreachable, running decision-tree only");
            }
        } else {
            info!("No remote classifier configured, running decision-tree only");
        }

        self.logger.start();
    }

    /// Stops the flush timer and persists everything still queued
    pub async fn shutdown(&self) {
        self.logger.shutdown().await;
        info!(service = %self.config.service_name, "Classification service stopped");
    }

    /// Classifies an untrusted failure context. Never fails.
    pub async fn classify(&self, raw: &Value) -> Classification {
        counter!("error_classifier.classify.total", 1);

        match AssertUnwindSafe(self.classify_inner(raw)).catch_unwind().await {
            Ok(classification) => classification,
            Err(_) => {
                error!("Classification pipeline panicked, returning default");
                Classification::unknown()
            }
        }
    }

    async fn classify_inner(&self, raw: &Value) -> Classification {
        let context = sanitize_context(raw);
        let key = cache_key(&context);

        if let Some(hit) = self.cache.get(&key) {
            debug!(key = %key, "Classification served from cache");
            return hit;
        }

        let result = match self.try_remote(&context).await {
            Some(remote) => remote,
            None => {
                counter!("error_classifier.fallback.used", 1);
                decision_tree::classify(context.http_status, context.error_message.as_deref())
            }
        };

        self.cache.put(key, result.clone());
        self.logger.enqueue(LogRecord::classified(context, result.clone()));
        result
    }

    /// Asks the remote backend if the breaker allows it
    async fn try_remote(&self, context: &ErrorContext) -> Option<Classification> {
        let remote = self.remote.as_ref()?;
        if !self.breaker.try_acquire() {
            return None;
        }

        let attempt = tokio::time::timeout(self.config.remote.classify_timeout, remote.classify(context))
            .await
            .map_err(Error::from)
            .and_then(|r| r);

        match attempt {
            Ok(classification) => {
                counter!("error_classifier.remote.success", 1);
                self.breaker.record_success();
                self.remote_healthy.store(true, Ordering::Relaxed);
                Some(classification)
            }
            Err(e) => {
                counter!("error_classifier.remote.failure", 1);
                self.breaker.record_failure();
                if self.breaker.state() == CircuitState::Open {
                    self.remote_healthy.store(false, Ordering::Relaxed);
                }
                debug!(
                    error = %e,
                    transient = e.is_transient(),
                    failures = self.breaker.consecutive_failures(),
                    "Remote classification failed, using decision tree"
                );
                None
            }
        }
    }

    /// Records what happened after acting on a classification. Fire-and-forget.
    pub fn log_outcome(&self, classification: &Classification, raw_context: &Value, outcome: Outcome) {
        let context = sanitize_context(raw_context);
        self.logger
            .enqueue(LogRecord::outcome(classification.clone(), context, outcome));
    }

    /// Reports the engine's current health
    pub async fn health(&self) -> HealthReport {
        let breaker = self.breaker.snapshot();
        let file_count = match self.logger.count_files().await {
            Ok(count) => count,
            Err(e) if e.kind == ErrorKind::Io => {
                debug!(error = %e, "Training directory not readable");
                0
            }
            Err(e) => {
                warn!(error = %e, "Failed to count training records");
                0
            }
        };

        let neural = self.remote.is_some()
            && self.remote_healthy.load(Ordering::Relaxed)
            && breaker.state != CircuitState::Open;

        HealthReport {
            mode: if neural {
                ServiceMode::NeuralEnhanced
            } else {
                ServiceMode::DecisionTreeOnly
            },
            breaker_state: breaker.state,
            breaker_failures: breaker.consecutive_failures,
            cache_size: self.cache.len(),
            queue_size: self.logger.queue_len(),
            file_count,
            file_count_healthy: file_count < self.config.batch.max_files_in_dir,
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    pub fn batch_logger(&self) -> &Arc<BatchLogger> {
        &self.logger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelSource, RetryAction, UNKNOWN_ERROR};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Remote backend that fails or answers on demand and counts calls
    struct ScriptedRemote {
        calls: AtomicUsize,
        succeed: AtomicBool,
    }

    impl ScriptedRemote {
        fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                succeed: AtomicBool::new(succeed),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteClassifier for ScriptedRemote {
        async fn health_check(&self) -> bool {
            self.succeed.load(Ordering::SeqCst)
        }

        async fn classify(&self, _context: &ErrorContext) -> Result<Classification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed.load(Ordering::SeqCst) {
                Ok(Classification {
                    classification: "NEURAL_LABEL".to_string(),
                    action: RetryAction::RetryImmediate,
                    confidence: 0.99,
                    max_retries: Some(1),
                    delay_seconds: None,
                    learning_enabled: true,
                    model_source: ModelSource::Neural,
                })
            } else {
                Err(Error::new(ErrorKind::RemoteUnavailable, "down"))
            }
        }
    }

    fn scripted(remote: &Arc<ScriptedRemote>) -> Option<Arc<dyn RemoteClassifier>> {
        Some(remote.clone())
    }

    fn config(root: &std::path::Path) -> ClassifierConfig {
        let mut cfg = ClassifierConfig::default();
        cfg.training_data_dir = root.join("training");
        cfg.state.state_file = root.join("state.json");
        cfg
    }

    #[tokio::test]
    async fn test_decision_tree_only() {
        let dir = tempfile::tempdir().unwrap();
        let service = ClassificationService::with_remote(config(dir.path()), None);

        let c = service.classify(&json!({ "httpStatus": 429 })).await;
        assert_eq!(c.classification, "RATE_LIMIT");
        assert_eq!(c.max_retries, Some(5));

        let health = service.health().await;
        assert_eq!(health.mode, ServiceMode::DecisionTreeOnly);
        assert_eq!(health.cache_size, 1);
        assert_eq!(health.queue_size, 1);
    }

    #[tokio::test]
    async fn test_garbage_input_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        let service = ClassificationService::with_remote(config(dir.path()), None);

        for raw in [Value::Null, json!("boom"), json!(42), json!([1, 2]), json!({ "httpStatus": {} })] {
            let c = service.classify(&raw).await;
            assert_eq!(c.classification, UNKNOWN_ERROR);
            assert_eq!(c.confidence, 0.5);
        }
    }

    #[tokio::test]
    async fn test_remote_success_is_used_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let remote = ScriptedRemote::new(true);
        let service = ClassificationService::with_remote(config(dir.path()), scripted(&remote));

        let raw = json!({ "httpStatus": 500, "errorMessage": "boom" });
        let first = service.classify(&raw).await;
        let second = service.classify(&raw).await;

        assert_eq!(first.model_source, ModelSource::Neural);
        assert_eq!(first, second);
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_five_failures() {
        let dir = tempfile::tempdir().unwrap();
        let remote = ScriptedRemote::new(false);
        let service = ClassificationService::with_remote(config(dir.path()), scripted(&remote));

        for i in 0..5 {
            let c = service.classify(&json!({ "httpStatus": 503, "errorMessage": format!("m{}", i) })).await;
            assert_eq!(c.classification, "SERVICE_UNAVAILABLE");
        }
        assert_eq!(remote.calls(), 5);
        assert_eq!(service.breaker.state(), CircuitState::Open);

        service.classify(&json!({ "httpStatus": 503, "errorMessage": "m6" })).await;
        assert_eq!(remote.calls(), 5);

        let health = service.health().await;
        assert_eq!(health.mode, ServiceMode::DecisionTreeOnly);
        assert_eq!(health.breaker_failures, 5);
    }

    #[tokio::test]
    async fn test_half_open_probe_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.breaker.cooldown = Duration::from_millis(50);
        let remote = ScriptedRemote::new(false);
        let service = ClassificationService::with_remote(cfg, scripted(&remote));

        for i in 0..5 {
            service.classify(&json!({ "httpStatus": 502, "errorMessage": format!("f{}", i) })).await;
        }
        assert_eq!(service.breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        remote.succeed.store(true, Ordering::SeqCst);

        let c = service.classify(&json!({ "httpStatus": 502, "errorMessage": "probe" })).await;
        assert_eq!(c.model_source, ModelSource::Neural);
        assert_eq!(remote.calls(), 6);
        assert_eq!(service.breaker.state(), CircuitState::Closed);
        assert_eq!(service.health().await.mode, ServiceMode::NeuralEnhanced);
    }

    #[tokio::test]
    async fn test_slow_remote_times_out_to_fallback() {
        struct SlowRemote;

        #[async_trait]
        impl RemoteClassifier for SlowRemote {
            async fn health_check(&self) -> bool {
                true
            }

            async fn classify(&self, _context: &ErrorContext) -> Result<Classification> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(Classification::unknown())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.remote.classify_timeout = Duration::from_millis(20);
        let service = ClassificationService::with_remote(cfg, Some(Arc::new(SlowRemote)));

        let c = service.classify(&json!({ "httpStatus": 408 })).await;
        assert_eq!(c.classification, "TIMEOUT");
        assert_eq!(service.breaker.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_log_outcome_respects_learning_flag() {
        let dir = tempfile::tempdir().unwrap();
        let service = ClassificationService::with_remote(config(dir.path()), None);
        let outcome = Outcome {
            success: true,
            retries_used: 1,
            total_time_ms: 250,
            final_status: Some(200),
        };

        let not_found = decision_tree::classify(Some(404), None);
        service.log_outcome(&not_found, &json!({ "httpStatus": 404 }), outcome.clone());
        assert_eq!(service.logger.queue_len(), 0);

        let rate_limited = decision_tree::classify(Some(429), None);
        service.log_outcome(&rate_limited, &json!({ "httpStatus": 429 }), outcome);
        assert_eq!(service.logger.queue_len(), 1);
    }
}
