//! gapflow - gap-driven stage pipeline orchestrator
//!
//! gapflow drives an ordered list of external analysis stages over a dataset
//! of input items. After every pass it reads a completeness report, extracts
//! the unmet sub-requirements (gaps) and narrows the next pass to the items
//! that could close them, until the gap percentage converges or the iteration
//! cap is reached.
//!
//! # Core Concepts
//!
//! - **Checkpoint Everything**: Run state is saved atomically after every stage transition
//! - **Resume, Don't Restart**: Completed stages are never re-executed
//! - **Classified Retries**: Transient failures back off, permanent ones fail fast
//! - **Gaps Recomputed**: Gaps are derived from each fresh report, never patched
//!
//! # Modules
//!
//! - [`orchestrator`] - Top-level run loop
//! - [`stage`] - Stage executors, retry-wrapped runner and judgment cache
//! - [`retry`] - Failure classification, backoff and circuit breaker
//! - [`gaps`] - Completeness report parsing and gap extraction
//! - [`relevance`] - Item relevance scoring and prefiltering
//! - [`state`] - Run state persistence and crash recovery
//! - [`domain`] - Persisted run types and schema migration
//! - [`dataset`] - Dataset scanning and fingerprints
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod gaps;
pub mod orchestrator;
pub mod relevance;
pub mod retry;
pub mod stage;
pub mod state;

pub use config::{Config, FilterPreset, RetryConfig, StageConfig};
pub use dataset::{Dataset, InputItem};
pub use domain::{RunOutcome, RunState, RunStatus, StageStatus};
pub use gaps::{CompletenessReport, GapRecord, Severity, extract_gaps};
pub use orchestrator::{Orchestrator, RunOptions, RunReport};
pub use retry::{FailureKind, RetryDecision, RetryPolicy, classify};
pub use stage::{StageExecutor, StageInput, StageOutput, StagePlan};
pub use state::StateStore;
