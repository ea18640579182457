//! # Remote Classifier Adapter
//!
//! Contract for the optional inference backend plus an HTTP implementation.
//! Any timeout, non-success response, transport error or malformed body is
//! an `Err`, which the service records as a circuit-breaker failure.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Classification, ErrorContext, ModelSource, RetryAction};
use crate::types::{Error, ErrorKind, Result};

/// Configuration for the remote backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the backend; `None` runs decision-tree only
    pub base_url: Option<String>,
    #[serde(with = "crate::config::duration_secs")]
    pub health_timeout: Duration,
    #[serde(with = "crate::config::duration_secs")]
    pub classify_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            health_timeout: Duration::from_secs(2),
            classify_timeout: Duration::from_secs(1),
        }
    }
}

/// The optional remote classification backend
#[async_trait]
pub trait RemoteClassifier: Send + Sync {
    /// Returns true when the backend is reachable and healthy
    async fn health_check(&self) -> bool;

    /// Classifies a sanitized context; `Err` when unavailable
    async fn classify(&self, context: &ErrorContext) -> Result<Classification>;
}

/// Wire shape of a backend prediction
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemotePrediction {
    classification: String,
    action: RetryAction,
    confidence: f64,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    delay_seconds: Option<u64>,
    #[serde(default = "default_learning")]
    learning_enabled: bool,
}

fn default_learning() -> bool {
    true
}

/// Decodes a backend reply, rejecting the "unavailable" marker
fn decode_reply(body: serde_json::Value) -> Result<Classification> {
    let unavailable = body.get("unavailable").and_then(|v| v.as_bool()).unwrap_or(false)
        || body.get("status").and_then(|v| v.as_str()) == Some("unavailable");
    if unavailable {
        return Err(Error::new(ErrorKind::RemoteUnavailable, "backend reported unavailable").transient());
    }

    let prediction: RemotePrediction = serde_json::from_value(body)?;
    if !prediction.confidence.is_finite() {
        return Err(Error::new(ErrorKind::RemoteUnavailable, "backend returned non-finite confidence"));
    }

    Ok(Classification {
        classification: prediction.classification,
        action: prediction.action,
        confidence: prediction.confidence.clamp(0.0, 1.0),
        max_retries: prediction.max_retries,
        delay_seconds: prediction.delay_seconds,
        learning_enabled: prediction.learning_enabled,
        model_source: ModelSource::Neural,
    })
}

/// HTTP client for a backend exposing `GET /health` and `POST /classify`
#[derive(Debug, Clone)]
pub struct HttpRemoteClassifier {
    client: reqwest::Client,
    base_url: String,
    health_timeout: Duration,
    classify_timeout: Duration,
}

impl HttpRemoteClassifier {
    pub fn new<S: Into<String>>(base_url: S, config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.classify_timeout.max(config.health_timeout))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_timeout: config.health_timeout,
            classify_timeout: config.classify_timeout,
        })
    }

    /// Builds a client from configuration, `None` when no URL is configured
    pub fn from_config(config: &RemoteConfig) -> Result<Option<Self>> {
        config
            .base_url
            .as_deref()
            .map(|url| Self::new(url, config))
            .transpose()
    }
}

#[async_trait]
impl RemoteClassifier for HttpRemoteClassifier {
    async fn health_check(&self) -> bool {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await;

        match response {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Remote classifier health check failed");
                false
            }
        }
    }

    async fn classify(&self, context: &ErrorContext) -> Result<Classification> {
        let response = self
            .client
            .post(format!("{}/classify", self.base_url))
            .timeout(self.classify_timeout)
            .json(context)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut err = Error::new(
                ErrorKind::RemoteUnavailable,
                format!("remote classifier returned HTTP {}", status.as_u16()),
            );
            if status.is_server_error() {
                err = err.transient();
            }
            return Err(err);
        }

        let body: serde_json::Value = response.json().await?;
        decode_reply(body)
    }
}
