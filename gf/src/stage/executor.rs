//! StageExecutor trait and the shell-command implementation

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::StageConfig;
use crate::gaps::GapRecord;

/// Errors a stage invocation can end with
///
/// The display text is what the retry policy classifies, so it keeps the
/// wording of the underlying failure.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage execution timeout after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("exit code {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("Failed to launch stage: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to write stage input: {0}")]
    Input(String),

    #[error("{0}")]
    Failed(String),
}

/// Everything a stage needs to know about the current attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    pub run_id: String,
    pub parent_run_id: Option<String>,
    pub stage: String,
    pub iteration: u32,
    pub attempt: u32,
    pub dataset_dir: PathBuf,
    pub output_dir: PathBuf,
    pub report_path: PathBuf,
    /// Ids of the items selected for analysis
    pub items: Vec<String>,
    /// Open gaps the stage should target
    pub gaps: Vec<GapRecord>,
}

/// Successful stage result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Captured standard output
    pub stdout: String,
}

impl StageOutput {
    pub fn new(stdout: impl Into<String>) -> Self {
        Self { stdout: stdout.into() }
    }
}

/// One external collaborator invocation
///
/// The core does not interpret output beyond success or failure.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, input: &StageInput) -> Result<StageOutput, StageError>;
}

/// Stage implemented as a shell command
///
/// The command runs under `sh -c` in the dataset directory. The attempt's
/// [`StageInput`] is piped to stdin as JSON and also kept in a file whose
/// path is passed in `GAPFLOW_INPUT`, alongside a handful of scalar
/// `GAPFLOW_*` variables.
#[derive(Debug, Clone)]
pub struct CommandStage {
    command: String,
    timeout: Duration,
}

impl CommandStage {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn from_config(config: &StageConfig) -> Self {
        Self::new(config.command.clone(), Duration::from_secs(config.timeout_secs))
    }

    fn input_path(input: &StageInput) -> PathBuf {
        input
            .output_dir
            .join("stages")
            .join(&input.run_id)
            .join(format!("{}.input.json", input.stage))
    }
}

#[async_trait]
impl StageExecutor for CommandStage {
    async fn execute(&self, input: &StageInput) -> Result<StageOutput, StageError> {
        debug!(stage = %input.stage, attempt = input.attempt, command = %self.command, "CommandStage::execute: called");

        let input_path = Self::input_path(input);
        let payload = serde_json::to_vec_pretty(input).map_err(|e| StageError::Input(e.to_string()))?;
        statestore::write_atomic(&input_path, &payload).map_err(|e| StageError::Input(e.to_string()))?;

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(&input.dataset_dir)
            .env("GAPFLOW_INPUT", &input_path)
            .env("GAPFLOW_RUN_ID", &input.run_id)
            .env("GAPFLOW_STAGE", &input.stage)
            .env("GAPFLOW_ITERATION", input.iteration.to_string())
            .env("GAPFLOW_ATTEMPT", input.attempt.to_string())
            .env("GAPFLOW_DATASET_DIR", &input.dataset_dir)
            .env("GAPFLOW_OUTPUT_DIR", &input.output_dir)
            .env("GAPFLOW_REPORT", &input.report_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(parent) = &input.parent_run_id {
            command.env("GAPFLOW_PARENT_RUN_ID", parent);
        }

        let mut child = command.spawn().map_err(StageError::Spawn)?;
        if let Some(mut stdin) = child.stdin.take() {
            // Commands that ignore stdin close the pipe early
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "CommandStage::execute: stdin not consumed");
                }
            });
        }
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(StageError::Spawn)?,
            Err(_) => return Err(StageError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            return Err(StageError::Exit {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(StageOutput::new(String::from_utf8_lossy(&output.stdout).to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn input(dir: &std::path::Path) -> StageInput {
        StageInput {
            run_id: "r1".into(),
            parent_run_id: None,
            stage: "extract".into(),
            iteration: 1,
            attempt: 1,
            dataset_dir: dir.to_path_buf(),
            output_dir: dir.join("out"),
            report_path: dir.join("out").join("report.json"),
            items: vec!["a.txt".into()],
            gaps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_command_success() {
        let temp = tempdir().unwrap();
        let stage = CommandStage::new("echo $GAPFLOW_STAGE-$GAPFLOW_ATTEMPT", Duration::from_secs(30));

        let output = stage.execute(&input(temp.path())).await.unwrap();

        assert_eq!(output.stdout.trim(), "extract-1");
    }

    #[tokio::test]
    async fn test_command_reads_input_file() {
        let temp = tempdir().unwrap();
        let stage = CommandStage::new("cat \"$GAPFLOW_INPUT\"", Duration::from_secs(30));

        let output = stage.execute(&input(temp.path())).await.unwrap();
        let echoed: StageInput = serde_json::from_str(&output.stdout).unwrap();

        assert_eq!(echoed, input(temp.path()));
    }

    #[tokio::test]
    async fn test_command_reads_input_from_stdin() {
        let temp = tempdir().unwrap();
        let stage = CommandStage::new("cat", Duration::from_secs(30));

        let output = stage.execute(&input(temp.path())).await.unwrap();
        let echoed: StageInput = serde_json::from_str(&output.stdout).unwrap();

        assert_eq!(echoed.stage, "extract");
        assert_eq!(echoed.attempt, 1);
    }

    #[tokio::test]
    async fn test_command_failure_carries_stderr() {
        let temp = tempdir().unwrap();
        let stage = CommandStage::new("echo 'HTTP 503' >&2; exit 3", Duration::from_secs(30));

        let err = stage.execute(&input(temp.path())).await.unwrap_err();

        assert_eq!(err.to_string(), "exit code 3: HTTP 503");
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let temp = tempdir().unwrap();
        let stage = CommandStage::new("sleep 10", Duration::from_millis(100));

        let err = stage.execute(&input(temp.path())).await.unwrap_err();

        assert!(matches!(err, StageError::Timeout(_)));
        assert!(err.to_string().contains("timeout"));
    }
}
