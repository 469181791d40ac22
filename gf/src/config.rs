//! gapflow configuration types and loading
//!
//! One [`Config`] is built at startup (file, then CLI overrides) and handed to
//! the orchestrator, retry policy and relevance filter. Nothing reads
//! configuration from ambient state after that.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Main gapflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding run states, cache entries and stage outputs
    pub output_directory: PathBuf,

    /// Completeness report file name, relative to the output directory
    pub report_file: String,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub log_level: Option<String>,

    /// Default retry settings for every stage
    pub retry: RetryConfig,

    /// Relevance prefilter settings
    pub filter: FilterConfig,

    /// Loop stopping conditions
    pub convergence: ConvergenceConfig,

    /// Gap extraction settings
    pub gaps: GapConfig,

    /// Ordered stage list
    pub stages: Vec<StageConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from(".gapflow"),
            report_file: "completeness_report.json".to_string(),
            log_level: None,
            retry: RetryConfig::default(),
            filter: FilterConfig::default(),
            convergence: ConvergenceConfig::default(),
            gaps: GapConfig::default(),
            stages: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./.gapflow.yml`, then the user config directory,
    /// then built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".gapflow.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("gapflow").join("gapflow.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Peek at the configured log level before logging is set up
    ///
    /// Errors are swallowed here; the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|config| config.log_level)
    }

    /// Parse configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        debug!(stages = self.stages.len(), "Config::validate: called");
        self.retry.validate("retry")?;

        if !(0.0..=1.0).contains(&self.filter.relevance_threshold) {
            return Err(eyre::eyre!(
                "filter.relevance_threshold must be within 0..=1, got {}",
                self.filter.relevance_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.gaps.threshold) {
            return Err(eyre::eyre!("gaps.threshold must be within 0..=1, got {}", self.gaps.threshold));
        }
        if !(0.0..=100.0).contains(&self.convergence.convergence_threshold_percent) {
            return Err(eyre::eyre!(
                "convergence.convergence_threshold_percent must be within 0..=100, got {}",
                self.convergence.convergence_threshold_percent
            ));
        }
        if self.convergence.max_iterations == 0 {
            return Err(eyre::eyre!("convergence.max_iterations must be at least 1"));
        }
        if self.report_file.trim().is_empty() {
            return Err(eyre::eyre!("report_file must not be empty"));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(eyre::eyre!("stage names must not be empty"));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(eyre::eyre!("duplicate stage name: {}", stage.name));
            }
            if stage.command.trim().is_empty() {
                return Err(eyre::eyre!("stage {} has no command", stage.name));
            }
            if stage.timeout_secs == 0 {
                return Err(eyre::eyre!("stage {} timeout_secs must be positive", stage.name));
            }
            self.retry_for(stage).validate(&format!("stages.{}.retry", stage.name))?;
        }
        Ok(())
    }

    /// Effective retry settings for a stage (defaults merged with overrides)
    pub fn retry_for(&self, stage: &StageConfig) -> RetryConfig {
        self.retry.merged(&stage.retry)
    }

    /// Absolute-or-relative path to the completeness report
    pub fn report_path(&self) -> PathBuf {
        self.output_directory.join(&self.report_file)
    }

    /// Apply a named filter preset
    pub fn apply_preset(&mut self, preset: FilterPreset) {
        debug!(?preset, "Config::apply_preset: called");
        self.filter.relevance_threshold = preset.threshold();
    }
}

/// Retry and circuit-breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts allowed per stage (first try included)
    pub max_attempts: u32,

    /// Exponential backoff base, in seconds
    pub backoff_base: f64,

    /// Backoff ceiling, in seconds
    pub backoff_max: f64,

    /// Consecutive failures (across all stages) that open the circuit
    pub circuit_breaker_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_max: 60.0,
            circuit_breaker_threshold: 3,
        }
    }
}

impl RetryConfig {
    /// Overlay per-stage overrides on these defaults
    pub fn merged(&self, overrides: &RetryOverrides) -> Self {
        Self {
            max_attempts: overrides.max_attempts.unwrap_or(self.max_attempts),
            backoff_base: overrides.backoff_base.unwrap_or(self.backoff_base),
            backoff_max: overrides.backoff_max.unwrap_or(self.backoff_max),
            circuit_breaker_threshold: overrides
                .circuit_breaker_threshold
                .unwrap_or(self.circuit_breaker_threshold),
        }
    }

    fn validate(&self, scope: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(eyre::eyre!("{}.max_attempts must be at least 1", scope));
        }
        if !self.backoff_base.is_finite() || self.backoff_base < 1.0 {
            return Err(eyre::eyre!("{}.backoff_base must be >= 1, got {}", scope, self.backoff_base));
        }
        if !self.backoff_max.is_finite() || self.backoff_max < 1.0 {
            return Err(eyre::eyre!("{}.backoff_max must be >= 1, got {}", scope, self.backoff_max));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(eyre::eyre!("{}.circuit_breaker_threshold must be at least 1", scope));
        }
        Ok(())
    }
}

/// Optional per-stage retry overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOverrides {
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<f64>,
    pub backoff_max: Option<f64>,
    pub circuit_breaker_threshold: Option<u32>,
}

/// Relevance prefilter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Narrow incremental runs and later iterations to gap-relevant items
    pub prefilter_enabled: bool,

    /// Minimum relevance score for an item to be analyzed
    pub relevance_threshold: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            prefilter_enabled: true,
            relevance_threshold: FilterPreset::Balanced.threshold(),
        }
    }
}

/// Named relevance thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FilterPreset {
    /// Keep anything loosely related (0.3)
    Conservative,
    /// Default threshold (0.5)
    Balanced,
    /// Keep only strongly related items (0.7)
    Aggressive,
}

impl FilterPreset {
    /// Threshold value this preset stands for
    pub fn threshold(self) -> f64 {
        match self {
            Self::Conservative => 0.3,
            Self::Balanced => 0.5,
            Self::Aggressive => 0.7,
        }
    }
}

/// Loop stopping conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Stop once the remaining gap percentage is at or below this value
    pub convergence_threshold_percent: f64,

    /// Hard cap on analysis iterations per run
    pub max_iterations: u32,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            convergence_threshold_percent: 5.0,
            max_iterations: 3,
        }
    }
}

/// Gap extraction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    /// Completeness fraction below which a sub-requirement is a gap
    pub threshold: f64,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            threshold: crate::gaps::DEFAULT_GAP_THRESHOLD,
        }
    }
}

/// One pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name, unique within the pipeline
    pub name: String,

    /// Shell command invoked for this stage
    #[serde(default)]
    pub command: String,

    /// A failed required stage fails the run
    #[serde(default = "default_required")]
    pub required: bool,

    /// Hard wall-clock timeout per attempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Memoize successful outputs for identical inputs
    #[serde(default)]
    pub cacheable: bool,

    /// Estimated cost of one external call
    #[serde(default)]
    pub cost_per_call: f64,

    /// Retry overrides for this stage
    #[serde(default)]
    pub retry: RetryOverrides,
}

fn default_required() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    600
}

impl StageConfig {
    /// Create a required stage with default settings
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            required: default_required(),
            timeout_secs: default_timeout_secs(),
            cacheable: false,
            cost_per_call: 0.0,
            retry: RetryOverrides::default(),
        }
    }

    /// Builder method to mark the stage optional
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Builder method to set retry overrides
    pub fn with_retry(mut self, retry: RetryOverrides) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_base, 2.0);
        assert_eq!(config.retry.circuit_breaker_threshold, 3);
        assert!(config.filter.prefilter_enabled);
        assert_eq!(config.filter.relevance_threshold, 0.5);
        assert_eq!(config.convergence.convergence_threshold_percent, 5.0);
        assert_eq!(config.gaps.threshold, 0.8);
        assert!(config.stages.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_minimal() {
        let config = Config::from_yaml("output_directory: /tmp/out\n").unwrap();

        assert_eq!(config.output_directory, PathBuf::from("/tmp/out"));
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_deserialize_full() {
        let yaml = r#"
output_directory: out
report_file: report.json
retry:
  max_attempts: 4
  backoff_base: 3.0
  backoff_max: 30
  circuit_breaker_threshold: 5
filter:
  prefilter_enabled: false
  relevance_threshold: 0.7
convergence:
  convergence_threshold_percent: 10
  max_iterations: 2
gaps:
  threshold: 0.75
stages:
  - name: extract
    command: "./extract.sh"
  - name: judge
    command: "./judge.sh"
    required: false
    timeout_secs: 30
    cacheable: true
    cost_per_call: 0.02
    retry:
      max_attempts: 5
"#;
        let config = Config::from_yaml(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.stages.len(), 2);
        assert!(config.stages[0].required);
        assert_eq!(config.stages[0].timeout_secs, 600);
        assert!(!config.stages[1].required);
        assert!(config.stages[1].cacheable);

        let judge_retry = config.retry_for(&config.stages[1]);
        assert_eq!(judge_retry.max_attempts, 5);
        assert_eq!(judge_retry.backoff_base, 3.0);
        assert_eq!(judge_retry.circuit_breaker_threshold, 5);
        assert_eq!(config.report_path(), PathBuf::from("out").join("report.json"));
    }

    #[test]
    fn test_validate_rejects_duplicate_stage() {
        let mut config = Config::default();
        config.stages = vec![StageConfig::new("a", "true"), StageConfig::new("a", "true")];

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate stage name"));
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = Config::default();
        config.filter.relevance_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stages = vec![StageConfig::new("a", "true").with_retry(RetryOverrides {
            backoff_base: Some(0.5),
            ..Default::default()
        })];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets() {
        let mut config = Config::default();
        config.apply_preset(FilterPreset::Aggressive);
        assert_eq!(config.filter.relevance_threshold, 0.7);
        assert_eq!(FilterPreset::Conservative.threshold(), 0.3);
    }

    #[test]
    fn test_load_explicit_path_and_log_level() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("gapflow.yml");
        fs::write(&path, "log_level: debug\nconvergence:\n  max_iterations: 7\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.convergence.max_iterations, 7);
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("debug"));

        let missing = temp.path().join("missing.yml");
        assert!(Config::load(Some(&missing)).is_err());
        assert_eq!(Config::load_log_level(Some(&missing)), None);
    }
}
