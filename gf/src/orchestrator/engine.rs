//! Orchestrator - the top-level control loop
//!
//! ```text
//! Initialize -> (FastExit if fingerprint unchanged)
//!            -> [relevance filter if incremental]
//!            -> run ordered stages -> recompute gaps
//!            -> converged or capped ? Done : filter and loop
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use eyre::{Context, Result, bail};
use tracing::{debug, error, info, warn};

use super::report::RunReport;
use crate::config::Config;
use crate::dataset::Dataset;
use crate::domain::{
    CompletenessMetrics, IterationRecord, REPORT_STAGE, RelevanceSnapshot, RunOutcome, RunState, RunStatus,
    StageStatus, generate_run_id,
};
use crate::gaps::{FileReportSource, ReportSource, average_completeness, extract_gaps, gap_percent};
use crate::relevance::{KeywordOverlapScorer, RelevanceFilter, RelevanceScorer};
use crate::retry::{FailureKind, MAX_ERROR_LEN, RetryPolicy, truncate_error};
use crate::stage::{CommandStage, JudgmentCache, StageContext, StageOutcome, StagePlan, StageRunner};
use crate::state::{StateStore, prepare_resume};

/// Per-invocation options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Resume or create this specific run instead of picking one
    pub run_id: Option<String>,
    /// Analyze every item even when a completed parent run exists
    pub full: bool,
}

/// Which run the loop will drive
enum Selection {
    FastExit(RunState),
    Finished(RunState),
    Drive(RunState),
}

/// Drives runs over one output directory
pub struct Orchestrator {
    config: Config,
    store: StateStore,
    plans: Vec<StagePlan>,
    scorer: Box<dyn RelevanceScorer>,
    reports: Box<dyn ReportSource>,
    cache: JudgmentCache,
}

impl Orchestrator {
    /// Create an orchestrator for the given stage plans
    ///
    /// The plans replace `config.stages`, and the result is validated.
    pub fn new(mut config: Config, plans: Vec<StagePlan>) -> Result<Self> {
        debug!(stages = plans.len(), "Orchestrator::new: called");
        config.stages = plans.iter().map(|p| p.config.clone()).collect();
        config.validate()?;

        let store = StateStore::open(&config.output_directory)?;
        let scorer = KeywordOverlapScorer::new().context("Failed to build keyword scorer")?;
        let reports = FileReportSource::new(config.report_path());
        let cache = JudgmentCache::new(&config.output_directory);

        Ok(Self {
            config,
            store,
            plans,
            scorer: Box::new(scorer),
            reports: Box::new(reports),
            cache,
        })
    }

    /// Create an orchestrator running each configured stage as a shell command
    pub fn from_config(config: Config) -> Result<Self> {
        if config.stages.is_empty() {
            bail!("No stages configured; add a `stages` list to the config file");
        }
        let plans = config
            .stages
            .iter()
            .map(|s| StagePlan::new(s.clone(), Arc::new(CommandStage::from_config(s))))
            .collect();
        Self::new(config, plans)
    }

    /// Builder method to replace the relevance scorer
    pub fn with_scorer(mut self, scorer: Box<dyn RelevanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Builder method to replace where completeness reports come from
    pub fn with_report_source(mut self, reports: Box<dyn ReportSource>) -> Self {
        self.reports = reports;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A fresh policy per run; the breaker counter is scoped to one run
    fn retry_policy(&self) -> RetryPolicy {
        self.plans.iter().fold(RetryPolicy::new(self.config.retry.clone()), |policy, plan| {
            policy.with_stage(plan.name(), self.config.retry_for(&plan.config))
        })
    }

    /// Run, resume or fast-exit against a scanned dataset
    pub async fn run(&self, dataset: &Dataset, options: &RunOptions) -> Result<RunReport> {
        debug!(root = %dataset.root().display(), ?options, "Orchestrator::run: called");
        let started = Instant::now();

        match self.select(dataset, options)? {
            Selection::FastExit(previous) => {
                info!(previous = %previous.run_id, "Dataset unchanged, nothing to do");
                Ok(RunReport::fast_exit(&previous))
            }
            Selection::Finished(state) => {
                info!(run_id = %state.run_id, "Run already complete");
                Ok(RunReport::from_state(&state))
            }
            Selection::Drive(mut state) => self.drive(&mut state, dataset, started).await,
        }
    }

    fn select(&self, dataset: &Dataset, options: &RunOptions) -> Result<Selection> {
        if let Some(run_id) = &options.run_id {
            return match self.store.load(run_id)? {
                Some(state) if state.status == RunStatus::Complete => Ok(Selection::Finished(state)),
                Some(state) => self.resume(state).map(Selection::Drive),
                None => {
                    let previous = self.store.latest_complete()?;
                    self.start(run_id, dataset, options, previous).map(Selection::Drive)
                }
            };
        }

        let runs = self.store.list()?;
        if let Some(latest) = runs.last() {
            if latest.status != RunStatus::Complete && latest.is_resumable() {
                return self.resume(latest.clone()).map(Selection::Drive);
            }
        }

        let previous = runs.into_iter().rev().find(|r| r.status == RunStatus::Complete);
        if let Some(prev) = &previous {
            if !options.full && dataset.unchanged_since(&prev.dataset) {
                return Ok(Selection::FastExit(prev.clone()));
            }
        }

        let label = dataset
            .root()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.start(&generate_run_id(&label), dataset, options, previous)
            .map(Selection::Drive)
    }

    fn resume(&self, mut state: RunState) -> Result<RunState> {
        if !state.is_resumable() {
            bail!(
                "Run {} failed permanently and cannot be resumed; start a new run",
                state.run_id
            );
        }
        let stats = prepare_resume(&mut state);
        info!(run_id = %state.run_id, iteration = state.iteration, %stats, "Resuming run");
        self.store.save(&mut state)?;
        Ok(state)
    }

    /// Create a new run, incremental when a completed parent is available
    fn start(&self, run_id: &str, dataset: &Dataset, options: &RunOptions, previous: Option<RunState>) -> Result<RunState> {
        let parent = if options.full || !self.config.filter.prefilter_enabled {
            None
        } else {
            previous
        };

        let mut state =
            RunState::new(run_id, dataset.fingerprint().clone()).with_dataset_dir(dataset.root().display().to_string());
        state.iteration = 1;

        match parent {
            Some(parent) => {
                let candidates = dataset.new_items_since(&parent.dataset);
                let filter = RelevanceFilter::new(self.config.filter.relevance_threshold);
                let result = filter.filter(&candidates, &parent.gaps, self.scorer.as_ref());
                info!(
                    %run_id,
                    parent = %parent.run_id,
                    new_items = candidates.len(),
                    kept = result.stats.kept,
                    "Starting incremental run"
                );
                state = state.with_parent(parent.run_id.clone());
                state.gaps = parent.gaps;
                state.completeness = parent.completeness;
                state.relevance = Some(result.snapshot());
            }
            None => {
                info!(%run_id, items = dataset.items().len(), "Starting full run");
            }
        }

        self.store.insert(&state)?;
        Ok(state)
    }

    async fn drive(&self, state: &mut RunState, dataset: &Dataset, started: Instant) -> Result<RunReport> {
        let policy = self.retry_policy();
        let runner = StageRunner::new(&self.store, &policy).with_cache(&self.cache);
        if state.iteration == 0 {
            state.iteration = 1;
        }

        loop {
            if let Some(snapshot) = &state.relevance {
                if snapshot.kept.is_empty() {
                    let outcome = if state.gaps.is_empty() {
                        RunOutcome::FullySufficient
                    } else {
                        RunOutcome::NothingToAnalyze {
                            skipped: snapshot.skipped.len(),
                        }
                    };
                    return self.finish(state, outcome, started);
                }
            }

            let ctx = self.context(state, dataset);
            info!(run_id = %state.run_id, iteration = state.iteration, items = ctx.items.len(), "Starting iteration");

            for plan in &self.plans {
                if state.stage_status(plan.name()) == StageStatus::Failed && !plan.config.required {
                    debug!(stage = %plan.name(), "Optional stage already failed, skipping");
                    continue;
                }
                match runner.run(state, plan, &ctx).await? {
                    StageOutcome::Skipped | StageOutcome::Completed { .. } => {}
                    StageOutcome::Failed { attempts, error, kind } if plan.config.required => {
                        let outcome = RunOutcome::Failed {
                            stage: plan.name().to_string(),
                            attempts,
                            last_error: error,
                            failure_kind: kind,
                        };
                        return self.fail(state, outcome, started);
                    }
                    StageOutcome::Failed { error, .. } => {
                        warn!(stage = %plan.name(), %error, "Optional stage failed, continuing");
                    }
                }
            }

            let report = match self.reports.load() {
                Ok(Some(report)) => report,
                Ok(None) => {
                    warn!(run_id = %state.run_id, "No completeness report after stages");
                    return self.finish(state, RunOutcome::NoReport, started);
                }
                Err(e) => {
                    let outcome = RunOutcome::Failed {
                        stage: REPORT_STAGE.to_string(),
                        attempts: 0,
                        last_error: truncate_error(&e.to_string(), MAX_ERROR_LEN),
                        failure_kind: FailureKind::Unclassified,
                    };
                    return self.fail(state, outcome, started);
                }
            };

            let gaps = extract_gaps(&report, self.config.gaps.threshold);
            let percent = gap_percent(&report, &gaps);
            let metrics = CompletenessMetrics {
                total_sub_requirements: report.sub_requirement_count(),
                gap_count: gaps.len(),
                gap_percent: percent,
                average_completeness: average_completeness(&report),
            };
            state.iterations.push(IterationRecord {
                iteration: state.iteration,
                items_analyzed: ctx.items.len(),
                gap_count: gaps.len(),
                gap_percent: percent,
                at: Utc::now(),
                stages: state.stages.clone(),
            });
            state.set_gaps(gaps, metrics);
            info!(
                run_id = %state.run_id,
                iteration = state.iteration,
                gaps = state.gaps.len(),
                gap_percent = percent,
                "Gaps recomputed"
            );

            if state.gaps.is_empty() {
                return self.finish(state, RunOutcome::FullySufficient, started);
            }
            if percent <= self.config.convergence.convergence_threshold_percent {
                return self.finish(state, RunOutcome::Converged { gap_percent: percent }, started);
            }
            if state.iteration >= self.config.convergence.max_iterations {
                let outcome = RunOutcome::IterationCapReached {
                    iterations: state.iteration,
                    gap_percent: percent,
                };
                return self.finish(state, outcome, started);
            }

            let snapshot = self.next_selection(state, dataset);
            state.begin_iteration();
            state.relevance = Some(snapshot);
            self.store.save(state)?;
        }
    }

    /// Items for the next iteration, narrowed to the current gaps
    fn next_selection(&self, state: &RunState, dataset: &Dataset) -> RelevanceSnapshot {
        if !self.config.filter.prefilter_enabled {
            return RelevanceSnapshot {
                threshold: 0.0,
                kept: dataset.items().iter().map(|i| i.id.clone()).collect(),
                skipped: Vec::new(),
                mean_score: 0.0,
            };
        }
        RelevanceFilter::new(self.config.filter.relevance_threshold)
            .filter(dataset.items(), &state.gaps, self.scorer.as_ref())
            .snapshot()
    }

    fn context(&self, state: &RunState, dataset: &Dataset) -> StageContext {
        let items = match &state.relevance {
            Some(snapshot) => snapshot.kept.clone(),
            None => dataset.items().iter().map(|i| i.id.clone()).collect(),
        };
        StageContext {
            dataset_dir: dataset.root().to_path_buf(),
            output_dir: self.config.output_directory.clone(),
            report_path: self.config.report_path(),
            items,
            gaps: state.gaps.clone(),
        }
    }

    fn finish(&self, state: &mut RunState, outcome: RunOutcome, started: Instant) -> Result<RunReport> {
        state.metrics.duration_ms += started.elapsed().as_millis() as u64;
        info!(run_id = %state.run_id, %outcome, "Run complete");
        state.mark_complete(outcome);
        self.store.save(state)?;
        Ok(RunReport::from_state(state))
    }

    fn fail(&self, state: &mut RunState, outcome: RunOutcome, started: Instant) -> Result<RunReport> {
        state.metrics.duration_ms += started.elapsed().as_millis() as u64;
        error!(run_id = %state.run_id, %outcome, "Run failed");
        state.mark_failed(outcome);
        self.store.save(state)?;
        Ok(RunReport::from_state(state))
    }
}
