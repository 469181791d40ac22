//! RunState domain type
//!
//! One document per analysis run. It is rewritten after every stage
//! transition, so a crash loses at most the in-flight attempt.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statestore::{Document, StoreResult};

use super::migrate::migrate_run;
use crate::gaps::GapRecord;
use crate::retry::FailureKind;

/// Current RunState schema version
pub const RUN_SCHEMA_VERSION: u32 = 2;

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Mutable, stages still to run
    #[default]
    Running,
    /// Finished successfully, immutable from here on
    Complete,
    /// Halted by a required stage failure
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Stage name recorded when the completeness report cannot be read
pub const REPORT_STAGE: &str = "report";

/// Per-stage status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    NotStarted,
    Running,
    Retrying,
    Complete,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Dataset unchanged since a completed run, nothing executed
    FastExit { previous_run_id: String },
    /// No gaps left to target
    FullySufficient,
    /// Gap percentage fell to the convergence threshold
    Converged { gap_percent: f64 },
    /// Stopped at the iteration cap with gaps remaining
    IterationCapReached { iterations: u32, gap_percent: f64 },
    /// Every item was skipped by the relevance filter
    NothingToAnalyze { skipped: usize },
    /// Stages finished but no completeness report was produced
    NoReport,
    /// A required stage failed
    Failed {
        stage: String,
        attempts: u32,
        last_error: String,
        failure_kind: FailureKind,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FastExit { previous_run_id } => {
                write!(f, "dataset unchanged since run {}", previous_run_id)
            }
            Self::FullySufficient => write!(f, "fully sufficient, no gaps remain"),
            Self::Converged { gap_percent } => write!(f, "converged at {:.1}% gaps", gap_percent),
            Self::IterationCapReached { iterations, gap_percent } => write!(
                f,
                "iteration cap reached after {} iterations ({:.1}% gaps)",
                iterations, gap_percent
            ),
            Self::NothingToAnalyze { skipped } => {
                write!(f, "no items relevant to open gaps ({} skipped)", skipped)
            }
            Self::NoReport => write!(f, "no completeness report produced"),
            Self::Failed {
                stage,
                attempts,
                last_error,
                ..
            } => write!(f, "stage {} failed after {} attempts: {}", stage, attempts, last_error),
        }
    }
}

/// Creation, update and completion times
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Timestamps {
    fn now() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// One failed attempt that was retried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt: u32,
    pub reason: String,
    pub error: String,
    pub backoff_secs: f64,
    pub at: DateTime<Utc>,
}

/// Status and attempt bookkeeping for one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,

    /// Attempts made so far, across restarts
    pub attempts: u32,

    /// Attempt count at which the current retry budget started
    ///
    /// Non-zero only after a failed stage was re-armed on resume.
    #[serde(default)]
    pub budget_start: u32,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub failure_kind: Option<FailureKind>,

    #[serde(default)]
    pub retry_history: Vec<RetryRecord>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub duration_ms: Option<u64>,

    /// Output served from the judgment cache
    #[serde(default)]
    pub cached: bool,
}

impl StageRecord {
    /// Attempts made within the current budget window
    pub fn attempts_in_budget(&self) -> u32 {
        self.attempts.saturating_sub(self.budget_start)
    }

    /// Begin the next attempt, returning its absolute number
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.status = StageStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.attempts
    }

    /// Record a failed attempt that will be retried
    pub fn mark_retrying(&mut self, error: &str, kind: FailureKind, reason: String, backoff_secs: f64) {
        self.status = StageStatus::Retrying;
        self.last_error = Some(error.to_string());
        self.failure_kind = Some(kind);
        self.retry_history.push(RetryRecord {
            attempt: self.attempts,
            reason,
            error: error.to_string(),
            backoff_secs,
            at: Utc::now(),
        });
    }

    /// Record a successful attempt
    pub fn mark_complete(&mut self, duration_ms: u64, cached: bool) {
        self.status = StageStatus::Complete;
        self.completed_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
        self.cached = cached;
    }

    /// Record a terminal failure for the current budget
    pub fn mark_failed(&mut self, error: &str, kind: FailureKind) {
        self.status = StageStatus::Failed;
        self.last_error = Some(error.to_string());
        self.failure_kind = Some(kind);
        self.completed_at = Some(Utc::now());
    }

    /// Reset for another loop iteration
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Dataset identity used for change detection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetFingerprint {
    /// SHA-256 over sorted `(item id, item hash)` pairs
    pub hash: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub item_count: usize,
    /// Per-item content hash, keyed by item id
    #[serde(default)]
    pub items: BTreeMap<String, String>,
}

/// Aggregate completeness numbers from the latest report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletenessMetrics {
    #[serde(default)]
    pub total_sub_requirements: usize,
    pub gap_count: usize,
    #[serde(default)]
    pub gap_percent: f64,
    pub average_completeness: f64,
}

/// Items skipped by the relevance filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub id: String,
    pub score: f64,
}

/// Record of the last relevance filter decision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelevanceSnapshot {
    pub threshold: f64,
    pub kept: Vec<String>,
    pub skipped: Vec<SkippedItem>,
    pub mean_score: f64,
}

/// Cost and time accounting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub duration_ms: u64,
    pub external_calls: u64,
    pub estimated_cost: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl ExecutionMetrics {
    /// Fraction of cache lookups that hit, 0 when nothing was looked up
    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

/// Summary of one finished loop iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub items_analyzed: usize,
    pub gap_count: usize,
    pub gap_percent: f64,
    pub at: DateTime<Utc>,

    /// Stage records as they stood when the iteration ended
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
}

/// Persistent state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,

    /// Unique identifier
    pub run_id: String,

    /// Run this one was derived from (incremental runs)
    #[serde(default)]
    pub parent_run_id: Option<String>,

    pub timestamps: Timestamps,

    pub status: RunStatus,

    #[serde(default)]
    pub outcome: Option<RunOutcome>,

    /// Dataset directory this run analyzes
    #[serde(default)]
    pub dataset_dir: Option<String>,

    /// Current loop iteration (1-indexed, 0 before the first)
    #[serde(default)]
    pub iteration: u32,

    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,

    #[serde(default)]
    pub dataset: DatasetFingerprint,

    #[serde(default)]
    pub completeness: Option<CompletenessMetrics>,

    /// Gap snapshot from the latest report
    #[serde(default)]
    pub gaps: Vec<GapRecord>,

    #[serde(default)]
    pub relevance: Option<RelevanceSnapshot>,

    #[serde(default)]
    pub metrics: ExecutionMetrics,

    #[serde(default)]
    pub iterations: Vec<IterationRecord>,

    /// Fields carried over from an older schema with no current home
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub legacy: BTreeMap<String, Value>,
}

impl RunState {
    /// Create a fresh running state
    pub fn new(run_id: impl Into<String>, dataset: DatasetFingerprint) -> Self {
        Self {
            schema_version: RUN_SCHEMA_VERSION,
            run_id: run_id.into(),
            parent_run_id: None,
            timestamps: Timestamps::now(),
            status: RunStatus::Running,
            outcome: None,
            dataset_dir: None,
            iteration: 0,
            stages: BTreeMap::new(),
            dataset,
            completeness: None,
            gaps: Vec::new(),
            relevance: None,
            metrics: ExecutionMetrics::default(),
            iterations: Vec::new(),
            legacy: BTreeMap::new(),
        }
    }

    /// Builder method to set the parent run
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_run_id = Some(parent.into());
        self
    }

    /// Builder method to set the dataset directory
    pub fn with_dataset_dir(mut self, dir: impl Into<String>) -> Self {
        self.dataset_dir = Some(dir.into());
        self
    }

    /// Bump the update timestamp
    pub fn touch(&mut self) {
        self.timestamps.updated_at = Utc::now();
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.get(name)
    }

    /// Record for a stage, created as not started on first access
    pub fn stage_mut(&mut self, name: &str) -> &mut StageRecord {
        self.stages.entry(name.to_string()).or_default()
    }

    pub fn stage_status(&self, name: &str) -> StageStatus {
        self.stages.get(name).map(|s| s.status).unwrap_or_default()
    }

    /// Check if the run is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Complete | RunStatus::Failed)
    }

    /// Whether a restart may continue this run
    ///
    /// Running runs always can. Failed runs can unless a stage failed
    /// permanently or with an unclassified error. A report that failed to
    /// parse never blocks resume.
    pub fn is_resumable(&self) -> bool {
        match self.status {
            RunStatus::Running => true,
            RunStatus::Complete => false,
            RunStatus::Failed => match &self.outcome {
                Some(RunOutcome::Failed {
                    stage, failure_kind, ..
                }) => stage == REPORT_STAGE || *failure_kind == FailureKind::Transient,
                _ => true,
            },
        }
    }

    /// Mark the run complete with the given outcome
    pub fn mark_complete(&mut self, outcome: RunOutcome) {
        let now = Utc::now();
        self.status = RunStatus::Complete;
        self.outcome = Some(outcome);
        self.timestamps.completed_at = Some(now);
        self.timestamps.updated_at = now;
    }

    /// Mark the run failed with the given outcome
    pub fn mark_failed(&mut self, outcome: RunOutcome) {
        let now = Utc::now();
        self.status = RunStatus::Failed;
        self.outcome = Some(outcome);
        self.timestamps.completed_at = Some(now);
        self.timestamps.updated_at = now;
    }

    /// Put a resumable failed run back into the running state
    pub fn reopen(&mut self) {
        self.status = RunStatus::Running;
        self.outcome = None;
        self.timestamps.completed_at = None;
        self.touch();
    }

    /// Replace the gap snapshot and completeness numbers
    pub fn set_gaps(&mut self, gaps: Vec<GapRecord>, metrics: CompletenessMetrics) {
        self.gaps = gaps;
        self.completeness = Some(metrics);
        self.touch();
    }

    /// Start the next iteration with every stage back at not started
    pub fn begin_iteration(&mut self) {
        self.iteration += 1;
        for record in self.stages.values_mut() {
            record.reset();
        }
        self.touch();
    }
}

impl Document for RunState {
    const SCHEMA_VERSION: u32 = RUN_SCHEMA_VERSION;
    const COLLECTION: &'static str = "runs";

    fn id(&self) -> &str {
        &self.run_id
    }

    fn migrate(doc: Value, from: u32) -> StoreResult<Value> {
        migrate_run(doc, from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> DatasetFingerprint {
        DatasetFingerprint {
            hash: "abc".to_string(),
            size_bytes: 10,
            item_count: 1,
            items: BTreeMap::new(),
        }
    }

    #[test]
    fn test_new_run_state() {
        let state = RunState::new("r1", fingerprint()).with_parent("r0");

        assert_eq!(state.schema_version, RUN_SCHEMA_VERSION);
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.parent_run_id.as_deref(), Some("r0"));
        assert_eq!(state.stage_status("extract"), StageStatus::NotStarted);
        assert!(!state.is_terminal());
        assert!(state.is_resumable());
    }

    #[test]
    fn test_stage_transitions() {
        let mut state = RunState::new("r1", fingerprint());
        let stage = state.stage_mut("judge");

        assert_eq!(stage.begin_attempt(), 1);
        stage.mark_retrying("Connection timeout", FailureKind::Transient, "transient".into(), 1.0);
        assert_eq!(stage.status, StageStatus::Retrying);
        assert_eq!(stage.begin_attempt(), 2);
        stage.mark_complete(42, false);

        let stage = state.stage("judge").unwrap();
        assert_eq!(stage.status, StageStatus::Complete);
        assert_eq!(stage.attempts, 2);
        assert_eq!(stage.retry_history.len(), 1);
        assert_eq!(stage.retry_history[0].attempt, 1);
        assert_eq!(stage.duration_ms, Some(42));
    }

    #[test]
    fn test_permanent_failure_not_resumable() {
        let mut state = RunState::new("r1", fingerprint());
        state.mark_failed(RunOutcome::Failed {
            stage: "a".into(),
            attempts: 1,
            last_error: "401".into(),
            failure_kind: FailureKind::Permanent,
        });
        assert!(state.is_terminal());
        assert!(!state.is_resumable());

        state.mark_failed(RunOutcome::Failed {
            stage: "a".into(),
            attempts: 3,
            last_error: "timeout".into(),
            failure_kind: FailureKind::Transient,
        });
        assert!(state.is_resumable());

        state.mark_failed(RunOutcome::Failed {
            stage: "a".into(),
            attempts: 1,
            last_error: "segfault".into(),
            failure_kind: FailureKind::Unclassified,
        });
        assert!(!state.is_resumable());

        state.mark_failed(RunOutcome::Failed {
            stage: REPORT_STAGE.into(),
            attempts: 0,
            last_error: "Malformed report".into(),
            failure_kind: FailureKind::Unclassified,
        });
        assert!(state.is_resumable());
        state.reopen();
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.timestamps.completed_at.is_none());
    }

    #[test]
    fn test_begin_iteration_resets_stages() {
        let mut state = RunState::new("r1", fingerprint());
        state.stage_mut("a").begin_attempt();
        state.stage_mut("a").mark_complete(1, false);

        state.begin_iteration();

        assert_eq!(state.iteration, 1);
        assert_eq!(state.stage_status("a"), StageStatus::NotStarted);
        assert_eq!(state.stage("a").unwrap().attempts, 0);
    }

    #[test]
    fn test_cache_hit_ratio() {
        let mut metrics = ExecutionMetrics::default();
        assert_eq!(metrics.cache_hit_ratio(), 0.0);
        metrics.cache_hits = 3;
        metrics.cache_misses = 1;
        assert_eq!(metrics.cache_hit_ratio(), 0.75);
    }

    #[test]
    fn test_outcome_serializes_tagged() {
        let json = serde_json::to_value(RunOutcome::Converged { gap_percent: 4.0 }).unwrap();
        assert_eq!(json["kind"], "converged");
        assert_eq!(json["gap_percent"], 4.0);
    }

    #[test]
    fn test_round_trip_through_json() {
        let mut state = RunState::new("r1", fingerprint());
        state.stage_mut("a").begin_attempt();
        let json = serde_json::to_string(&state).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
