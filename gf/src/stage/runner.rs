//! StageRunner - drives one stage through its state machine
//!
//! ```text
//! NotStarted -> Running -> Complete
//!                  |
//!                  +-> Retrying -> (backoff) -> Running
//!                  +-> Failed
//! ```
//!
//! State is saved on every transition, before anything is returned to the
//! caller, so the stored status and the reported outcome never diverge.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::Result;
use tracing::{debug, error, info, warn};

use super::cache::JudgmentCache;
use super::executor::{StageError, StageExecutor, StageInput, StageOutput};
use crate::config::StageConfig;
use crate::domain::{RunState, StageStatus};
use crate::gaps::GapRecord;
use crate::retry::{FailureKind, MAX_ERROR_LEN, RetryPolicy, truncate_error};
use crate::state::StateStore;

/// A configured stage paired with the executor that runs it
#[derive(Clone)]
pub struct StagePlan {
    pub config: StageConfig,
    pub executor: Arc<dyn StageExecutor>,
}

impl StagePlan {
    pub fn new(config: StageConfig, executor: Arc<dyn StageExecutor>) -> Self {
        Self { config, executor }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

impl std::fmt::Debug for StagePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagePlan").field("config", &self.config).finish()
    }
}

/// Iteration-wide inputs shared by every stage
#[derive(Debug, Clone)]
pub struct StageContext {
    pub dataset_dir: PathBuf,
    pub output_dir: PathBuf,
    pub report_path: PathBuf,
    pub items: Vec<String>,
    pub gaps: Vec<GapRecord>,
}

impl StageContext {
    fn input(&self, state: &RunState, stage: &str, attempt: u32) -> StageInput {
        StageInput {
            run_id: state.run_id.clone(),
            parent_run_id: state.parent_run_id.clone(),
            stage: stage.to_string(),
            iteration: state.iteration,
            attempt,
            dataset_dir: self.dataset_dir.clone(),
            output_dir: self.output_dir.clone(),
            report_path: self.report_path.clone(),
            items: self.items.clone(),
            gaps: self.gaps.clone(),
        }
    }
}

/// How a stage ended
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Already complete before this call, nothing ran
    Skipped,
    Completed {
        attempts: u32,
        cached: bool,
    },
    Failed {
        attempts: u32,
        error: String,
        kind: FailureKind,
    },
}

/// Runs stages under a retry policy, checkpointing through the state store
pub struct StageRunner<'a> {
    store: &'a StateStore,
    policy: &'a RetryPolicy,
    cache: Option<&'a JudgmentCache>,
}

impl<'a> StageRunner<'a> {
    pub fn new(store: &'a StateStore, policy: &'a RetryPolicy) -> Self {
        Self {
            store,
            policy,
            cache: None,
        }
    }

    /// Builder method to enable the judgment cache for cacheable stages
    pub fn with_cache(mut self, cache: &'a JudgmentCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run one stage to completion or terminal failure
    ///
    /// A stage found `Retrying` continues its attempt counter. Errors are
    /// returned only for persistence failures; stage failures come back as
    /// [`StageOutcome::Failed`] after the state has been saved.
    pub async fn run(&self, state: &mut RunState, plan: &StagePlan, ctx: &StageContext) -> Result<StageOutcome> {
        let name = plan.name().to_string();
        let current = state.stage_status(&name);
        debug!(run_id = %state.run_id, stage = %name, status = %current, "StageRunner::run: called");

        if current == StageStatus::Complete {
            debug!(stage = %name, "Stage already complete, skipping");
            return Ok(StageOutcome::Skipped);
        }

        let cache_key = match (plan.config.cacheable, self.cache) {
            (true, Some(_)) => Some(JudgmentCache::key(
                &name,
                &plan.config.command,
                &state.dataset.hash,
                &ctx.items,
                &ctx.gaps,
            )),
            _ => None,
        };
        if let (Some(cache), Some(key)) = (self.cache, cache_key.as_deref()) {
            if let Some(entry) = cache.get(key) {
                info!(stage = %name, "Stage output served from cache");
                state.metrics.cache_hits += 1;
                self.write_output(state, &name, &entry.output, ctx);
                let record = state.stage_mut(&name);
                record.mark_complete(0, true);
                let attempts = record.attempts;
                self.policy.record_success();
                self.store.save(state)?;
                return Ok(StageOutcome::Completed { attempts, cached: true });
            }
            state.metrics.cache_misses += 1;
        }

        let timeout = Duration::from_secs(plan.config.timeout_secs);
        loop {
            let attempt = state.stage_mut(&name).begin_attempt();
            self.store.save(state)?;
            info!(run_id = %state.run_id, stage = %name, attempt, "Stage attempt started");

            let input = ctx.input(state, &name, attempt);
            let start = Instant::now();
            let result = match tokio::time::timeout(timeout, plan.executor.execute(&input)).await {
                Ok(result) => result,
                Err(_) => Err(StageError::Timeout(timeout)),
            };
            let elapsed_ms = start.elapsed().as_millis() as u64;

            state.metrics.external_calls += 1;
            state.metrics.estimated_cost += plan.config.cost_per_call;

            match result {
                Ok(output) => {
                    self.write_output(state, &name, &output, ctx);
                    if let (Some(cache), Some(key)) = (self.cache, cache_key.as_deref()) {
                        if let Err(e) = cache.put(key, &name, &output) {
                            warn!(stage = %name, error = %e, "Failed to cache stage output");
                        }
                    }
                    state.stage_mut(&name).mark_complete(elapsed_ms, false);
                    self.policy.record_success();
                    self.store.save(state)?;
                    info!(stage = %name, attempt, elapsed_ms, "Stage complete");
                    return Ok(StageOutcome::Completed {
                        attempts: attempt,
                        cached: false,
                    });
                }
                Err(e) => {
                    let text = truncate_error(&e.to_string(), MAX_ERROR_LEN);
                    let budget_attempt = state.stage_mut(&name).attempts_in_budget();
                    let decision = self.policy.decide(&name, budget_attempt, &text);
                    let kind = decision.reason.kind();

                    if decision.should_retry {
                        warn!(
                            stage = %name,
                            attempt,
                            error = %text,
                            backoff_secs = decision.backoff.as_secs_f64(),
                            "Stage attempt failed, retrying"
                        );
                        state.stage_mut(&name).mark_retrying(
                            &text,
                            kind,
                            decision.reason.to_string(),
                            decision.backoff.as_secs_f64(),
                        );
                        self.store.save(state)?;
                        self.backoff(decision.backoff).await;
                        continue;
                    }

                    error!(stage = %name, attempt, error = %text, reason = %decision.reason, "Stage failed");
                    state.stage_mut(&name).mark_failed(&text, kind);
                    self.store.save(state)?;
                    return Ok(StageOutcome::Failed {
                        attempts: attempt,
                        error: text,
                        kind,
                    });
                }
            }
        }
    }

    async fn backoff(&self, delay: Duration) {
        debug!(delay_secs = delay.as_secs_f64(), "StageRunner::backoff: sleeping");
        tokio::time::sleep(delay).await;
    }

    /// Keep the latest output of each stage next to the run state
    fn write_output(&self, state: &RunState, stage: &str, output: &StageOutput, ctx: &StageContext) {
        let path = ctx
            .output_dir
            .join("stages")
            .join(&state.run_id)
            .join(format!("{}.out", stage));
        if let Err(e) = statestore::write_atomic(&path, output.stdout.as_bytes()) {
            warn!(path = %path.display(), error = %e, "Failed to write stage output");
        }
    }
}
