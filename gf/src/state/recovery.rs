//! Crash recovery
//!
//! Normalizes a run loaded after a restart so the control loop can continue
//! it without double-counting attempts.

use tracing::{debug, info, warn};

use crate::domain::{RunState, RunStatus, StageStatus};
use crate::retry::FailureKind;

/// What [`prepare_resume`] changed
#[derive(Debug, Default, PartialEq)]
pub struct RecoveryStats {
    /// Stages caught mid-attempt, now retrying
    pub interrupted_stages: usize,
    /// Failed stages given a fresh attempt budget
    pub rearmed_stages: usize,
    /// Whether a failed run was reopened
    pub reopened: bool,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "interrupted: {}, rearmed: {}, reopened: {}",
            self.interrupted_stages, self.rearmed_stages, self.reopened
        )
    }
}

/// Prepare a loaded run for continuation
///
/// - `running` stages were interrupted mid-attempt and become `retrying`,
///   keeping their attempt count so the next attempt is `attempts + 1`
/// - a resumable failed run goes back to `running`, and its transiently
///   failed stages get a fresh budget window starting at their current count
///
/// Permanently failed runs are left untouched; callers should not resume them.
pub fn prepare_resume(state: &mut RunState) -> RecoveryStats {
    debug!(run_id = %state.run_id, status = %state.status, "prepare_resume: called");
    let mut stats = RecoveryStats::default();

    if state.status == RunStatus::Complete {
        return stats;
    }
    if state.status == RunStatus::Failed {
        if !state.is_resumable() {
            warn!(run_id = %state.run_id, "Run failed permanently, not resuming");
            return stats;
        }
        state.reopen();
        stats.reopened = true;
    }

    for (name, record) in state.stages.iter_mut() {
        match record.status {
            StageStatus::Running => {
                debug!(stage = %name, attempts = record.attempts, "Interrupted stage");
                record.status = StageStatus::Retrying;
                stats.interrupted_stages += 1;
            }
            StageStatus::Failed if stats.reopened && record.failure_kind == Some(FailureKind::Transient) => {
                debug!(stage = %name, attempts = record.attempts, "Re-arming failed stage");
                record.status = StageStatus::Retrying;
                record.budget_start = record.attempts;
                record.completed_at = None;
                stats.rearmed_stages += 1;
            }
            _ => {}
        }
    }

    if stats != RecoveryStats::default() {
        info!(run_id = %state.run_id, %stats, "Prepared run for resume");
        state.touch();
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DatasetFingerprint, RunOutcome};

    fn state() -> RunState {
        RunState::new("r1", DatasetFingerprint::default())
    }

    #[test]
    fn test_running_stage_becomes_retrying() {
        let mut state = state();
        state.stage_mut("a").begin_attempt();
        state.stage_mut("a").mark_complete(1, false);
        state.stage_mut("b").begin_attempt();
        state.stage_mut("b").begin_attempt();

        let stats = prepare_resume(&mut state);

        assert_eq!(stats.interrupted_stages, 1);
        assert_eq!(state.stage_status("a"), StageStatus::Complete);
        let b = state.stage("b").unwrap();
        assert_eq!(b.status, StageStatus::Retrying);
        assert_eq!(b.attempts, 2);
    }

    #[test]
    fn test_failed_run_is_reopened_with_fresh_budget() {
        let mut state = state();
        let judge = state.stage_mut("judge");
        for _ in 0..3 {
            judge.begin_attempt();
        }
        judge.mark_failed("HTTP 503", FailureKind::Transient);
        state.mark_failed(RunOutcome::Failed {
            stage: "judge".into(),
            attempts: 3,
            last_error: "HTTP 503".into(),
            failure_kind: FailureKind::Transient,
        });

        let stats = prepare_resume(&mut state);

        assert!(stats.reopened);
        assert_eq!(stats.rearmed_stages, 1);
        assert_eq!(state.status, RunStatus::Running);
        let judge = state.stage("judge").unwrap();
        assert_eq!(judge.status, StageStatus::Retrying);
        assert_eq!(judge.budget_start, 3);
        assert_eq!(judge.attempts_in_budget(), 0);
    }

    #[test]
    fn test_permanent_failure_untouched() {
        let mut state = state();
        state.stage_mut("a").begin_attempt();
        state.stage_mut("a").mark_failed("401", FailureKind::Permanent);
        state.mark_failed(RunOutcome::Failed {
            stage: "a".into(),
            attempts: 1,
            last_error: "401".into(),
            failure_kind: FailureKind::Permanent,
        });

        let stats = prepare_resume(&mut state);

        assert_eq!(stats, RecoveryStats::default());
        assert_eq!(state.status, RunStatus::Failed);
    }

    #[test]
    fn test_optional_failure_in_running_run_stays_failed() {
        let mut state = state();
        state.stage_mut("enrich").begin_attempt();
        state.stage_mut("enrich").mark_failed("HTTP 503", FailureKind::Transient);

        prepare_resume(&mut state);

        assert_eq!(state.stage_status("enrich"), StageStatus::Failed);
    }

    #[test]
    fn test_reopened_run_keeps_non_transient_optional_failures() {
        let mut state = state();
        state.stage_mut("enrich").begin_attempt();
        state.stage_mut("enrich").mark_failed("schema validation", FailureKind::Permanent);
        state.stage_mut("judge").begin_attempt();
        state.stage_mut("judge").mark_failed("HTTP 503", FailureKind::Transient);
        state.mark_failed(RunOutcome::Failed {
            stage: "judge".into(),
            attempts: 1,
            last_error: "HTTP 503".into(),
            failure_kind: FailureKind::Transient,
        });

        let stats = prepare_resume(&mut state);

        assert_eq!(stats.rearmed_stages, 1);
        assert_eq!(state.stage_status("enrich"), StageStatus::Failed);
        assert_eq!(state.stage_status("judge"), StageStatus::Retrying);
    }
}
