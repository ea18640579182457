//! # Circuit Breaker
//!
//! Guards calls to the optional remote classifier.
//!
//! ```text
//! Closed    -> Open:      consecutive failures reach the threshold
//! Open      -> HalfOpen:  cooldown elapsed since the last failure (next call probes)
//! HalfOpen  -> Closed:    probe succeeds
//! HalfOpen  -> Open:      probe fails (counter incremented, timer reset)
//! any       -> Closed:    any remote success
//! ```
//!
//! The state machine itself is [`transition`], a pure function of the current
//! status and an event. [`CircuitBreaker`] wraps it with a clock, logging and
//! metrics. Decisions are synchronous and never block.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, remote calls allowed
    Closed,
    /// Failing, remote calls short-circuited
    Open,
    /// Cooldown elapsed, one probe call allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a probe is allowed
    #[serde(with = "crate::config::duration_secs")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Complete breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    /// Start of the outstanding half-open probe
    pub probe_started: Option<Instant>,
}

impl Default for BreakerStatus {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            probe_started: None,
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// A caller wants to use the remote classifier
    CallRequested { now: Instant },
    /// A remote call completed successfully
    CallSucceeded,
    /// A remote call failed, timed out, or returned garbage
    CallFailed { at: Instant },
}

/// Computes the next breaker status. Pure.
pub fn transition(current: &BreakerStatus, event: BreakerEvent, config: &BreakerConfig) -> BreakerStatus {
    let mut next = *current;

    match event {
        BreakerEvent::CallRequested { now } => match current.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let cooled = current
                    .last_failure
                    .map_or(true, |t| now.saturating_duration_since(t) >= config.cooldown);
                if cooled {
                    next.state = CircuitState::HalfOpen;
                    next.probe_started = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                // A probe that never reported back is considered abandoned
                let abandoned = current
                    .probe_started
                    .map_or(true, |t| now.saturating_duration_since(t) >= config.cooldown);
                if abandoned {
                    next.probe_started = Some(now);
                }
            }
        },
        BreakerEvent::CallSucceeded => {
            next.state = CircuitState::Closed;
            next.consecutive_failures = 0;
            next.probe_started = None;
        }
        BreakerEvent::CallFailed { at } => {
            next.consecutive_failures = current.consecutive_failures.saturating_add(1);
            next.last_failure = Some(at);
            next.probe_started = None;
            next.state = match current.state {
                CircuitState::Closed if next.consecutive_failures < config.failure_threshold => {
                    CircuitState::Closed
                }
                _ => CircuitState::Open,
            };
        }
    }

    next
}

/// Whether moving from `before` to `after` on a call request admits the call
pub fn permits_call(before: &BreakerStatus, after: &BreakerStatus) -> bool {
    match after.state {
        CircuitState::Closed => true,
        CircuitState::HalfOpen => after.probe_started.is_some() && after.probe_started != before.probe_started,
        CircuitState::Open => false,
    }
}

/// Point-in-time view for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Circuit breaker around the remote classifier
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Name of this circuit breaker (for logging)
    name: String,
    config: BreakerConfig,
    status: Mutex<BreakerStatus>,
}

impl CircuitBreaker {
    /// Creates a new closed circuit breaker
    pub fn new<S: Into<String>>(name: S, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            status: Mutex::new(BreakerStatus::default()),
        }
    }

    /// Decides whether a remote call may be attempted now
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> bool {
        let (before, after) = self.apply(BreakerEvent::CallRequested { now });
        let permitted = permits_call(&before, &after);

        if !permitted {
            counter!("error_classifier.remote.short_circuited", 1);
            debug!(
                circuit = %self.name,
                state = %after.state,
                failures = after.consecutive_failures,
                "Remote call short-circuited"
            );
        } else if after.state == CircuitState::HalfOpen {
            info!(circuit = %self.name, "Circuit HALF_OPEN: probing remote classifier");
        }

        permitted
    }

    /// Records a successful remote call
    pub fn record_success(&self) {
        self.apply(BreakerEvent::CallSucceeded);
    }

    /// Records a failed remote call
    pub fn record_failure(&self) {
        self.apply(BreakerEvent::CallFailed { at: Instant::now() });
    }

    /// Gets the current state of the circuit
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Gets the number of consecutive failures
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let status = self.lock();
        BreakerSnapshot {
            state: status.state,
            consecutive_failures: status.consecutive_failures,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, event: BreakerEvent) -> (BreakerStatus, BreakerStatus) {
        let mut status = self.lock();
        let before = *status;
        let after = transition(&before, event, &self.config);
        *status = after;
        drop(status);

        if before.state != after.state {
            self.log_transition(&before, &after);
        }
        (before, after)
    }

    fn log_transition(&self, before: &BreakerStatus, after: &BreakerStatus) {
        let state_value = match after.state {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        };
        gauge!("error_classifier.breaker.state", state_value);

        match (before.state, after.state) {
            (_, CircuitState::Open) if before.state == CircuitState::HalfOpen => warn!(
                circuit = %self.name,
                failures = after.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit REOPENED: probe failed"
            ),
            (_, CircuitState::Open) => warn!(
                circuit = %self.name,
                failures = after.consecutive_failures,
                threshold = self.config.failure_threshold,
                "Circuit OPEN: failure threshold reached"
            ),
            (_, CircuitState::Closed) => info!(
                circuit = %self.name,
                previous_state = %before.state,
                "Circuit CLOSED: remote classifier recovered"
            ),
            (_, CircuitState::HalfOpen) => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("remote-classifier", BreakerConfig::default())
    }
}
