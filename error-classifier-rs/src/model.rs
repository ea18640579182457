//! # Classification Data Model
//!
//! Sanitized error contexts, classification results, and the records the
//! batch logger persists as training data.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Label used when nothing more specific is known
pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";

/// Upper bound for computed retry delays
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Jitter factor applied to computed retry delays
const BACKOFF_JITTER: f64 = 0.1;

/// A failure description after sanitization. Every field is within bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_system: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
}

impl ErrorContext {
    /// Status as a key fragment, `unknown` when absent
    pub fn status_key(&self) -> String {
        self.http_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// What the caller should do about the failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    NoRetry,
    RetryOnceAfterRefresh,
    RetryWithBackoff,
    RetryImmediate,
}

impl fmt::Display for RetryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryAction::NoRetry => write!(f, "no_retry"),
            RetryAction::RetryOnceAfterRefresh => write!(f, "retry_once_after_refresh"),
            RetryAction::RetryWithBackoff => write!(f, "retry_with_backoff"),
            RetryAction::RetryImmediate => write!(f, "retry_immediate"),
        }
    }
}

/// Which path produced a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Neural,
    DecisionTree,
    PatternMatch,
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Neural => write!(f, "neural"),
            ModelSource::DecisionTree => write!(f, "decision_tree"),
            ModelSource::PatternMatch => write!(f, "pattern_match"),
        }
    }
}

/// Classification and retry advice for one failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub classification: String,
    pub action: RetryAction,
    /// Always within `[0, 1]`
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u64>,
    pub learning_enabled: bool,
    pub model_source: ModelSource,
}

impl Classification {
    /// The answer given when every other path has failed
    pub fn unknown() -> Self {
        Self {
            classification: UNKNOWN_ERROR.to_string(),
            action: RetryAction::RetryWithBackoff,
            confidence: 0.5,
            max_retries: Some(2),
            delay_seconds: None,
            learning_enabled: true,
            model_source: ModelSource::DecisionTree,
        }
    }

    /// Suggested wait before retry number `attempt` (zero-based).
    ///
    /// Returns `None` when the action forbids another attempt or the retry
    /// budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if attempt >= max {
                return None;
            }
        }

        match self.action {
            RetryAction::NoRetry => None,
            RetryAction::RetryImmediate => Some(Duration::ZERO),
            RetryAction::RetryOnceAfterRefresh => {
                if attempt == 0 {
                    Some(Duration::from_secs(self.delay_seconds.unwrap_or(0)))
                } else {
                    None
                }
            }
            RetryAction::RetryWithBackoff => {
                let base_ms = self.delay_seconds.unwrap_or(1).max(1) as f64 * 1000.0;
                let max_ms = MAX_BACKOFF.as_millis() as f64;

                let exp_backoff = base_ms * 2.0_f64.powi(attempt.min(16) as i32);
                let capped_backoff = exp_backoff.min(max_ms);

                let jitter_range = capped_backoff * BACKOFF_JITTER;
                let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);

                let final_backoff_ms = (capped_backoff + jitter).clamp(0.0, max_ms);
                Some(Duration::from_millis(final_backoff_ms as u64))
            }
        }
    }
}

/// What actually happened after the caller acted on a classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub success: bool,
    pub retries_used: u32,
    pub total_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_status: Option<u16>,
}

/// A training-data event queued for batch persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    Classification {
        context: ErrorContext,
        classification: Classification,
        #[serde(rename = "modelSource")]
        model_source: ModelSource,
        timestamp: DateTime<Utc>,
    },
    Outcome {
        classification: Classification,
        context: ErrorContext,
        outcome: Outcome,
        timestamp: DateTime<Utc>,
    },
}

impl LogRecord {
    /// Record of a classification decision
    pub fn classified(context: ErrorContext, classification: Classification) -> Self {
        let model_source = classification.model_source;
        LogRecord::Classification {
            context,
            classification,
            model_source,
            timestamp: Utc::now(),
        }
    }

    /// Record of the observed outcome of acting on a classification
    pub fn outcome(classification: Classification, context: ErrorContext, outcome: Outcome) -> Self {
        LogRecord::Outcome {
            classification,
            context,
            outcome,
            timestamp: Utc::now(),
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            LogRecord::Classification { context, .. } | LogRecord::Outcome { context, .. } => context,
        }
    }

    pub fn classification(&self) -> &Classification {
        match self {
            LogRecord::Classification { classification, .. }
            | LogRecord::Outcome { classification, .. } => classification,
        }
    }

    pub(crate) fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            LogRecord::Classification { context, .. } | LogRecord::Outcome { context, .. } => context,
        }
    }

    /// Key under which the state store aggregates this record
    pub fn pattern_key(&self) -> String {
        format!(
            "{}_{}",
            self.context().status_key(),
            self.classification().classification
        )
    }
}
