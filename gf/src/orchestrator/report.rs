//! Run summary returned to callers

use serde::{Deserialize, Serialize};

use crate::domain::{ExecutionMetrics, RunOutcome, RunState, RunStatus};

/// What a call to [`Orchestrator::run`](super::Orchestrator::run) did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub parent_run_id: Option<String>,
    pub status: RunStatus,
    pub outcome: Option<RunOutcome>,
    pub iterations: u32,
    pub gap_count: Option<usize>,
    pub gap_percent: Option<f64>,
    pub metrics: ExecutionMetrics,
}

impl RunReport {
    pub fn from_state(state: &RunState) -> Self {
        Self {
            run_id: state.run_id.clone(),
            parent_run_id: state.parent_run_id.clone(),
            status: state.status,
            outcome: state.outcome.clone(),
            iterations: state.iteration,
            gap_count: state.completeness.as_ref().map(|c| c.gap_count),
            gap_percent: state.completeness.as_ref().map(|c| c.gap_percent),
            metrics: state.metrics.clone(),
        }
    }

    /// Report for a run that was skipped because the dataset did not change
    pub fn fast_exit(previous: &RunState) -> Self {
        Self {
            outcome: Some(RunOutcome::FastExit {
                previous_run_id: previous.run_id.clone(),
            }),
            status: RunStatus::Complete,
            iterations: 0,
            metrics: ExecutionMetrics::default(),
            ..Self::from_state(previous)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status != RunStatus::Failed
    }
}
