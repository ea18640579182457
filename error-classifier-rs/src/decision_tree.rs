//! # Decision Tree Classifier
//!
//! Deterministic fallback classification. A fixed table keyed by HTTP status
//! either yields a leaf policy directly or branches on a closed set of
//! message patterns. Always available, never fails.

use crate::model::{Classification, ModelSource, RetryAction, UNKNOWN_ERROR};

/// Message pattern tags, in match priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessagePattern {
    Timeout,
    Connection,
    Validation,
    Server,
    Default,
}

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "etimedout", "deadline exceeded"];
const CONNECTION_MARKERS: &[&str] = &[
    "connection",
    "econnrefused",
    "econnreset",
    "socket hang up",
    "network",
    "dns",
];
const VALIDATION_MARKERS: &[&str] = &["invalid", "validation", "malformed", "missing required", "schema"];
const SERVER_MARKERS: &[&str] = &["internal", "server error", "exception", "panic", "stack trace"];

impl MessagePattern {
    /// Buckets a message by ordered substring tests; first match wins
    pub fn of(message: Option<&str>) -> Self {
        let message = match message {
            Some(m) => m.to_lowercase(),
            None => return MessagePattern::Default,
        };
        let contains_any = |markers: &[&str]| markers.iter().any(|m| message.contains(m));

        if contains_any(TIMEOUT_MARKERS) {
            MessagePattern::Timeout
        } else if contains_any(CONNECTION_MARKERS) {
            MessagePattern::Connection
        } else if contains_any(VALIDATION_MARKERS) {
            MessagePattern::Validation
        } else if contains_any(SERVER_MARKERS) {
            MessagePattern::Server
        } else {
            MessagePattern::Default
        }
    }
}

/// Static retry policy at a tree leaf
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leaf {
    pub label: &'static str,
    pub action: RetryAction,
    pub confidence: f64,
    pub max_retries: u32,
    pub delay_seconds: Option<u64>,
    pub learning_enabled: bool,
}

impl Leaf {
    const fn new(
        label: &'static str,
        action: RetryAction,
        confidence: f64,
        max_retries: u32,
        delay_seconds: Option<u64>,
        learning_enabled: bool,
    ) -> Self {
        Self {
            label,
            action,
            confidence,
            max_retries,
            delay_seconds,
            learning_enabled,
        }
    }

    fn to_classification(self, source: ModelSource) -> Classification {
        Classification {
            classification: self.label.to_string(),
            action: self.action,
            confidence: self.confidence,
            max_retries: Some(self.max_retries),
            delay_seconds: self.delay_seconds,
            learning_enabled: self.learning_enabled,
            model_source: source,
        }
    }
}

/// A table entry: a policy, or a match over message patterns
#[derive(Debug, Clone, Copy)]
pub enum Node {
    Leaf(Leaf),
    ByMessage(fn(MessagePattern) -> Leaf),
}

use RetryAction::*;

const UNMAPPED: Leaf = Leaf::new(UNKNOWN_ERROR, RetryWithBackoff, 0.50, 2, None, true);

const BAD_REQUEST: Leaf = Leaf::new("BAD_REQUEST", NoRetry, 0.85, 0, None, true);
const VALIDATION_ERROR: Leaf = Leaf::new("VALIDATION_ERROR", NoRetry, 0.95, 0, None, false);
const AUTH_EXPIRED: Leaf = Leaf::new("AUTH_EXPIRED", RetryOnceAfterRefresh, 0.90, 1, None, true);
const PERMISSION_DENIED: Leaf = Leaf::new("PERMISSION_DENIED", NoRetry, 0.95, 0, None, false);
const NOT_FOUND: Leaf = Leaf::new("NOT_FOUND", NoRetry, 0.95, 0, None, false);
const REQUEST_TIMEOUT: Leaf = Leaf::new("TIMEOUT", RetryWithBackoff, 0.90, 3, Some(2), true);
const CONFLICT: Leaf = Leaf::new("CONFLICT", RetryWithBackoff, 0.80, 2, Some(1), true);
const UNPROCESSABLE: Leaf = Leaf::new("VALIDATION_ERROR", NoRetry, 0.90, 0, None, false);
const RATE_LIMIT: Leaf = Leaf::new("RATE_LIMIT", RetryWithBackoff, 0.95, 5, Some(30), true);
const SERVER_TIMEOUT: Leaf = Leaf::new("TIMEOUT", RetryWithBackoff, 0.85, 3, Some(2), true);
const CONNECTION_ERROR: Leaf = Leaf::new("CONNECTION_ERROR", RetryImmediate, 0.90, 3, None, true);
const SERVER_VALIDATION: Leaf = Leaf::new("VALIDATION_ERROR", NoRetry, 0.75, 0, None, true);
const INTERNAL_SERVER_ERROR: Leaf =
    Leaf::new("INTERNAL_SERVER_ERROR", RetryWithBackoff, 0.80, 3, Some(5), true);
const SERVER_ERROR: Leaf = Leaf::new("SERVER_ERROR", RetryWithBackoff, 0.70, 3, Some(5), true);
const BAD_GATEWAY: Leaf = Leaf::new("BAD_GATEWAY", RetryWithBackoff, 0.85, 3, Some(5), true);
const SERVICE_UNAVAILABLE: Leaf =
    Leaf::new("SERVICE_UNAVAILABLE", RetryWithBackoff, 0.90, 4, Some(10), true);
const GATEWAY_TIMEOUT: Leaf = Leaf::new("GATEWAY_TIMEOUT", RetryWithBackoff, 0.90, 3, Some(5), true);

fn bad_request_branch(pattern: MessagePattern) -> Leaf {
    match pattern {
        MessagePattern::Validation => VALIDATION_ERROR,
        _ => BAD_REQUEST,
    }
}

fn server_error_branch(pattern: MessagePattern) -> Leaf {
    match pattern {
        MessagePattern::Timeout => SERVER_TIMEOUT,
        MessagePattern::Connection => CONNECTION_ERROR,
        MessagePattern::Validation => SERVER_VALIDATION,
        MessagePattern::Server => INTERNAL_SERVER_ERROR,
        MessagePattern::Default => SERVER_ERROR,
    }
}

fn bad_gateway_branch(pattern: MessagePattern) -> Leaf {
    match pattern {
        MessagePattern::Timeout => GATEWAY_TIMEOUT,
        MessagePattern::Connection => CONNECTION_ERROR,
        _ => BAD_GATEWAY,
    }
}

/// Looks up the table entry for a status code
pub fn node_for(status: u16) -> Option<Node> {
    let node = match status {
        400 => Node::ByMessage(bad_request_branch),
        401 => Node::Leaf(AUTH_EXPIRED),
        403 => Node::Leaf(PERMISSION_DENIED),
        404 => Node::Leaf(NOT_FOUND),
        408 => Node::Leaf(REQUEST_TIMEOUT),
        409 => Node::Leaf(CONFLICT),
        422 => Node::Leaf(UNPROCESSABLE),
        429 => Node::Leaf(RATE_LIMIT),
        500 => Node::ByMessage(server_error_branch),
        502 => Node::ByMessage(bad_gateway_branch),
        503 => Node::Leaf(SERVICE_UNAVAILABLE),
        504 => Node::Leaf(GATEWAY_TIMEOUT),
        _ => return None,
    };
    Some(node)
}

/// Classifies a failure from its status and message. Pure.
pub fn classify(status: Option<u16>, message: Option<&str>) -> Classification {
    match status.and_then(node_for) {
        Some(Node::Leaf(leaf)) => leaf.to_classification(ModelSource::DecisionTree),
        Some(Node::ByMessage(branch)) => {
            let pattern = MessagePattern::of(message);
            let source = if pattern == MessagePattern::Default {
                ModelSource::DecisionTree
            } else {
                ModelSource::PatternMatch
            };
            branch(pattern).to_classification(source)
        }
        None => UNMAPPED.to_classification(ModelSource::DecisionTree),
    }
}
