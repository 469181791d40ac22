//! CLI command definitions and subcommands

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::FilterPreset;

/// gapflow - gap-driven stage pipeline orchestrator
#[derive(Parser)]
#[command(
    name = "gf",
    about = "Run analysis stages until the completeness gaps converge",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the pipeline over a dataset, resuming an unfinished run if there is one
    Run {
        /// Dataset directory
        #[arg(short, long)]
        dataset: PathBuf,

        /// Resume or create this run instead of picking one
        #[arg(long)]
        run_id: Option<String>,

        /// Analyze every item even if a completed run exists
        #[arg(long)]
        full: bool,

        /// Maximum iterations
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Minimum relevance score (0-1) for an item to be analyzed
        #[arg(long, conflicts_with = "preset")]
        relevance_threshold: Option<f64>,

        /// Named relevance threshold
        #[arg(long, value_enum)]
        preset: Option<FilterPreset>,

        /// Disable relevance prefiltering
        #[arg(long)]
        no_prefilter: bool,

        /// Directory for run state, cache and stage outputs
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Show a run's state (latest run when omitted)
    Status {
        /// Run ID, unique prefix or name fragment
        run_id: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Directory holding run state
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// List runs with their parent lineage
    Runs {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,

        /// Directory holding run state
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Extract and summarize gaps from a completeness report
    Gaps {
        /// Completeness report file
        #[arg(short, long)]
        report: PathBuf,

        /// Completeness fraction (0-1) below which a sub-requirement is a gap
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Load and re-save every stored run, upgrading old schemas
    Migrate {
        /// Directory holding run state
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

/// Output format for status/runs/gaps commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gapflow")
        .join("logs")
        .join("gapflow.log")
}
