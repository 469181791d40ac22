//! Retry decisions for failed stage attempts
//!
//! [`classify`] sorts raw error text into transient, permanent or unclassified
//! failures. [`RetryPolicy`] turns that classification into a decision with a
//! jittered exponential backoff and trips a circuit breaker after too many
//! failures in a row.

mod classify;
mod policy;

pub use classify::{Classification, FailureKind, classify};
pub use policy::{
    JITTER_FRACTION, MIN_BACKOFF_SECS, RetryDecision, RetryPolicy, RetryReason, base_delay, jittered_delay,
};

/// Longest error text kept in run state
pub const MAX_ERROR_LEN: usize = 500;

/// Truncate error text to at most `max` characters
pub fn truncate_error(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_error_short() {
        assert_eq!(truncate_error("boom", MAX_ERROR_LEN), "boom");
    }

    #[test]
    fn test_truncate_error_long() {
        let text = "x".repeat(800);
        assert_eq!(truncate_error(&text, MAX_ERROR_LEN).len(), 500);
    }

    #[test]
    fn test_truncate_error_multibyte() {
        let text = "é".repeat(10);
        assert_eq!(truncate_error(&text, 3), "ééé");
    }
}
