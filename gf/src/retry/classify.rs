//! Failure classification
//!
//! Raw error text from a stage is matched against two fixed pattern lists.
//! Permanent patterns win over retryable ones, and text matching neither is
//! unclassified, which the policy treats as permanent.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Substrings marking a transient failure
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "rate limit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "temporarily unavailable",
    "temporary",
];

/// Substrings marking a failure that retrying cannot fix
const PERMANENT_PATTERNS: &[&str] = &[
    "syntax error",
    "syntaxerror",
    "validation",
    "invalid",
    "file not found",
    "no such file",
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "authentication",
    "has no attribute",
    "unknown attribute",
    "attributeerror",
];

/// Failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Worth retrying after a backoff
    Transient,
    /// Will fail again no matter how often it is retried
    Permanent,
    /// Matched no known pattern
    Unclassified,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Result of classifying one error text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    /// The pattern that decided the classification
    pub pattern: Option<&'static str>,
}

/// Classify raw error text
pub fn classify(error: &str) -> Classification {
    let lowered = error.to_lowercase();

    if let Some(pattern) = PERMANENT_PATTERNS.iter().copied().find(|p| lowered.contains(p)) {
        debug!(pattern, "classify: permanent");
        return Classification {
            kind: FailureKind::Permanent,
            pattern: Some(pattern),
        };
    }
    if let Some(pattern) = RETRYABLE_PATTERNS.iter().copied().find(|p| lowered.contains(p)) {
        debug!(pattern, "classify: transient");
        return Classification {
            kind: FailureKind::Transient,
            pattern: Some(pattern),
        };
    }

    debug!("classify: unclassified");
    Classification {
        kind: FailureKind::Unclassified,
        pattern: None,
    }
}
