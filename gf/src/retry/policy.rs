//! RetryPolicy - retry decisions, backoff and the circuit breaker

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::classify::{FailureKind, classify};
use crate::config::{Config, RetryConfig};

/// Symmetric jitter applied to every backoff delay
pub const JITTER_FRACTION: f64 = 0.2;

/// Shortest delay ever returned, in seconds
pub const MIN_BACKOFF_SECS: f64 = 1.0;

/// Why a failure is or is not retried
#[derive(Debug, Clone, PartialEq)]
pub enum RetryReason {
    /// Matched a retryable pattern
    Transient { pattern: &'static str },
    /// Matched a permanent pattern
    Permanent { pattern: &'static str },
    /// Matched nothing, failing fast
    Unclassified,
    /// Too many failures in a row across the run
    CircuitOpen { consecutive_failures: u32 },
    /// The stage used up its attempt budget
    AttemptsExhausted { attempts: u32 },
}

impl RetryReason {
    /// Failure category recorded in run state
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient { .. } | Self::CircuitOpen { .. } | Self::AttemptsExhausted { .. } => {
                FailureKind::Transient
            }
            Self::Permanent { .. } => FailureKind::Permanent,
            Self::Unclassified => FailureKind::Unclassified,
        }
    }
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient { pattern } => write!(f, "transient failure (matched '{}')", pattern),
            Self::Permanent { pattern } => write!(f, "permanent failure (matched '{}')", pattern),
            Self::Unclassified => write!(f, "unclassified failure, not retried"),
            Self::CircuitOpen { consecutive_failures } => {
                write!(f, "too many consecutive failures ({})", consecutive_failures)
            }
            Self::AttemptsExhausted { attempts } => write!(f, "attempts exhausted after {}", attempts),
        }
    }
}

/// Outcome of one retry decision
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub reason: RetryReason,
    /// Delay before the next attempt, zero when not retrying
    pub backoff: Duration,
}

/// Retry policy shared by every stage of one run
///
/// The only mutable state is the consecutive-failure counter. It is atomic
/// so the policy can be shared by reference while a stage is in flight.
#[derive(Debug)]
pub struct RetryPolicy {
    defaults: RetryConfig,
    stages: HashMap<String, RetryConfig>,
    consecutive_failures: AtomicU32,
}

impl RetryPolicy {
    /// Create a policy using the same settings for every stage
    pub fn new(defaults: RetryConfig) -> Self {
        debug!(?defaults, "RetryPolicy::new: called");
        Self {
            defaults,
            stages: HashMap::new(),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Create a policy with per-stage overrides from configuration
    pub fn from_config(config: &Config) -> Self {
        let mut policy = Self::new(config.retry.clone());
        for stage in &config.stages {
            policy.stages.insert(stage.name.clone(), config.retry_for(stage));
        }
        policy
    }

    /// Builder method to set settings for one stage
    pub fn with_stage(mut self, stage: impl Into<String>, settings: RetryConfig) -> Self {
        self.stages.insert(stage.into(), settings);
        self
    }

    /// Effective settings for a stage
    pub fn settings_for(&self, stage: &str) -> &RetryConfig {
        self.stages.get(stage).unwrap_or(&self.defaults)
    }

    /// Current consecutive-failure count
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Whether the breaker is open for this stage's threshold
    pub fn is_circuit_open(&self, stage: &str) -> bool {
        self.consecutive_failures() >= self.settings_for(stage).circuit_breaker_threshold
    }

    /// Reset the breaker after any successful stage
    pub fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous > 0 {
            debug!(previous, "RetryPolicy::record_success: reset consecutive failures");
        }
    }

    /// Decide whether a failed attempt should be retried
    ///
    /// `attempt` is the 1-based number of the attempt that just failed,
    /// counted within the current attempt budget. Every call counts as one
    /// failure towards the circuit breaker.
    pub fn decide(&self, stage: &str, attempt: u32, error: &str) -> RetryDecision {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let settings = self.settings_for(stage);
        let classification = classify(error);
        debug!(%stage, attempt, failures, kind = %classification.kind, "RetryPolicy::decide: called");

        let reason = match (classification.kind, classification.pattern) {
            (FailureKind::Permanent, Some(pattern)) => RetryReason::Permanent { pattern },
            (FailureKind::Transient, Some(pattern)) => {
                if failures >= settings.circuit_breaker_threshold {
                    warn!(%stage, failures, "Circuit breaker open, not retrying");
                    RetryReason::CircuitOpen {
                        consecutive_failures: failures,
                    }
                } else if attempt >= settings.max_attempts {
                    RetryReason::AttemptsExhausted { attempts: attempt }
                } else {
                    return RetryDecision {
                        should_retry: true,
                        reason: RetryReason::Transient { pattern },
                        backoff: self.backoff(stage, attempt),
                    };
                }
            }
            _ => RetryReason::Unclassified,
        };

        RetryDecision {
            should_retry: false,
            reason,
            backoff: Duration::ZERO,
        }
    }

    /// Jittered delay after `attempt` failed
    pub fn backoff(&self, stage: &str, attempt: u32) -> Duration {
        let base = base_delay(self.settings_for(stage), attempt);
        let jitter = rand::rng().random_range(-JITTER_FRACTION..=JITTER_FRACTION);
        Duration::from_secs_f64(jittered_delay(base, jitter))
    }
}

/// Un-jittered delay: `min(base^(attempt-1), backoff_max)`, in seconds
pub fn base_delay(settings: &RetryConfig, attempt: u32) -> f64 {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    settings.backoff_base.powi(exponent).min(settings.backoff_max)
}

/// Apply a jitter factor in `[-JITTER_FRACTION, JITTER_FRACTION]` and the floor
pub fn jittered_delay(base_secs: f64, jitter: f64) -> f64 {
    let jitter = jitter.clamp(-JITTER_FRACTION, JITTER_FRACTION);
    (base_secs * (1.0 + jitter)).max(MIN_BACKOFF_SECS)
}
