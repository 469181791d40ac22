//! StateStore - run state persistence under the output directory

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use statestore::{Document, Store};
use tracing::{debug, info};

use crate::domain::{DatasetFingerprint, RunState, RunStatus};

/// Persists [`RunState`] documents at `<output_dir>/runs/<run_id>.json`
///
/// Single writer per run id: the store does not arbitrate concurrent
/// writers, callers must not drive the same run from two processes.
#[derive(Debug, Clone)]
pub struct StateStore {
    store: Store,
}

impl StateStore {
    /// Open (creating if needed) the store rooted at `output_dir`
    pub fn open(output_dir: impl AsRef<Path>) -> Result<Self> {
        let output_dir = output_dir.as_ref();
        debug!(output_dir = %output_dir.display(), "StateStore::open: called");
        let store = Store::open(output_dir).context(format!("Failed to open state store at {}", output_dir.display()))?;
        Ok(Self { store })
    }

    pub fn output_dir(&self) -> &Path {
        self.store.root()
    }

    /// Path of the state file for a run
    pub fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        Ok(self.store.path_for::<RunState>(run_id)?)
    }

    /// Create and persist a new running state
    pub fn create(
        &self,
        run_id: &str,
        dataset: DatasetFingerprint,
        parent_run_id: Option<&str>,
        dataset_dir: &Path,
    ) -> Result<RunState> {
        debug!(%run_id, ?parent_run_id, "StateStore::create: called");
        let mut state = RunState::new(run_id, dataset).with_dataset_dir(dataset_dir.display().to_string());
        if let Some(parent) = parent_run_id {
            state = state.with_parent(parent);
        }
        self.insert(&state)?;
        Ok(state)
    }

    /// Persist a fully built new run, refusing to overwrite an existing one
    pub fn insert(&self, state: &RunState) -> Result<()> {
        let run_id = state.run_id.as_str();
        if self.store.exists::<RunState>(run_id)? {
            return Err(eyre::eyre!("Run {} already exists", run_id));
        }
        self.store
            .save(state)
            .context(format!("Failed to create run {}", run_id))?;
        info!(%run_id, parent = ?state.parent_run_id, "Created run");
        Ok(())
    }

    /// Load a run, migrating older schemas transparently
    pub fn load(&self, run_id: &str) -> Result<Option<RunState>> {
        self.store
            .load::<RunState>(run_id)
            .context(format!("Failed to load run {}", run_id))
    }

    /// Persist a run, bumping its update timestamp
    pub fn save(&self, state: &mut RunState) -> Result<()> {
        debug!(run_id = %state.run_id, status = %state.status, "StateStore::save: called");
        state.touch();
        self.store
            .save(state)
            .context(format!("Failed to save run {}", state.run_id))
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        Ok(self.store.list_ids::<RunState>()?)
    }

    /// Every readable run, oldest first
    pub fn list(&self) -> Result<Vec<RunState>> {
        let mut runs = self
            .store
            .load_all::<RunState>()
            .context(format!("Failed to list {}", RunState::COLLECTION))?;
        runs.sort_by(|a, b| {
            a.timestamps
                .created_at
                .cmp(&b.timestamps.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }

    /// Most recently created run
    pub fn latest(&self) -> Result<Option<RunState>> {
        Ok(self.list()?.pop())
    }

    /// Most recently created complete run
    pub fn latest_complete(&self) -> Result<Option<RunState>> {
        Ok(self.list()?.into_iter().rev().find(|r| r.status == RunStatus::Complete))
    }

    /// Load and re-save every run, returning how many were written
    pub fn migrate_all(&self) -> Result<usize> {
        let mut count = 0;
        for id in self.ids()? {
            if let Some(state) = self.load(&id)? {
                self.store.save(&state).context(format!("Failed to save run {}", id))?;
                count += 1;
            }
        }
        info!(count, "Migrated runs");
        Ok(count)
    }
}
