//! Domain types for gapflow
//!
//! [`RunState`] is the one persisted record. It implements the statestore
//! [`Document`](statestore::Document) trait and owns its schema migration.

mod id;
mod migrate;
mod run;

pub use id::{RunIdResolver, generate_run_id};
pub use migrate::{migrate_run, migrate_value};
pub use run::{
    CompletenessMetrics, DatasetFingerprint, ExecutionMetrics, IterationRecord, REPORT_STAGE, RUN_SCHEMA_VERSION,
    RelevanceSnapshot, RetryRecord, RunOutcome, RunState, RunStatus, SkippedItem, StageRecord, StageStatus, Timestamps,
};
