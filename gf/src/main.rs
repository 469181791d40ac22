use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use gapflow::cli::{Cli, Command, OutputFormat};
use gapflow::config::{Config, FilterPreset};
use gapflow::dataset::Dataset;
use gapflow::domain::{RunIdResolver, RunState, RunStatus, StageStatus};
use gapflow::gaps::{CompletenessReport, extract_gaps, summarize};
use gapflow::orchestrator::{Orchestrator, RunOptions, RunReport};
use gapflow::state::StateStore;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = gapflow::cli::get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run {
            dataset,
            run_id,
            full,
            max_iterations,
            relevance_threshold,
            preset,
            no_prefilter,
            output_dir,
        } => {
            debug!("main: matched Run command");
            apply_run_overrides(
                &mut config,
                max_iterations,
                relevance_threshold,
                preset,
                no_prefilter,
                output_dir,
            );
            cmd_run(config, &dataset, RunOptions { run_id, full }).await
        }
        Command::Status {
            run_id,
            format,
            output_dir,
        } => {
            debug!(?run_id, ?format, "main: matched Status command");
            override_output_dir(&mut config, output_dir);
            cmd_status(&config, run_id.as_deref(), format)
        }
        Command::Runs { format, output_dir } => {
            debug!(?format, "main: matched Runs command");
            override_output_dir(&mut config, output_dir);
            cmd_runs(&config, format)
        }
        Command::Gaps {
            report,
            threshold,
            format,
        } => {
            debug!(report = %report.display(), "main: matched Gaps command");
            cmd_gaps(&report, threshold.unwrap_or(config.gaps.threshold), format)
        }
        Command::Migrate { output_dir } => {
            debug!("main: matched Migrate command");
            override_output_dir(&mut config, output_dir);
            cmd_migrate(&config)
        }
    }
}

fn apply_run_overrides(
    config: &mut Config,
    max_iterations: Option<u32>,
    relevance_threshold: Option<f64>,
    preset: Option<FilterPreset>,
    no_prefilter: bool,
    output_dir: Option<PathBuf>,
) {
    if let Some(max) = max_iterations {
        config.convergence.max_iterations = max;
    }
    if let Some(preset) = preset {
        config.apply_preset(preset);
    }
    if let Some(threshold) = relevance_threshold {
        config.filter.relevance_threshold = threshold;
    }
    if no_prefilter {
        config.filter.prefilter_enabled = false;
    }
    override_output_dir(config, output_dir);
}

fn override_output_dir(config: &mut Config, output_dir: Option<PathBuf>) {
    if let Some(dir) = output_dir {
        config.output_directory = dir;
    }
}

async fn cmd_run(config: Config, dataset_dir: &Path, options: RunOptions) -> Result<()> {
    debug!(dataset = %dataset_dir.display(), ?options, "cmd_run: called");
    let dataset =
        Dataset::scan(dataset_dir).context(format!("Failed to scan dataset {}", dataset_dir.display()))?;
    let orchestrator = Orchestrator::from_config(config)?;

    println!(
        "{} {} ({} items)",
        "Dataset:".bold(),
        dataset.root().display(),
        dataset.items().len()
    );

    // The run future is dropped before exiting so an in-flight stage process is killed
    let finished = tokio::select! {
        result = orchestrator.run(&dataset, &options) => Some(result?),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(report) = finished else {
        warn!("Interrupted, run state is checkpointed");
        println!("{}", "Interrupted. Run `gf run` again to resume.".yellow());
        std::process::exit(130);
    };

    print_report(&report);
    if !report.succeeded() {
        bail!("Run {} failed", report.run_id);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let status = match report.status {
        RunStatus::Complete => "complete".green(),
        RunStatus::Failed => "failed".red(),
        RunStatus::Running => "running".yellow(),
    };
    println!("{} {} [{}]", "Run:".bold(), report.run_id, status);
    if let Some(parent) = &report.parent_run_id {
        println!("  parent:     {}", parent);
    }
    if let Some(outcome) = &report.outcome {
        println!("  outcome:    {}", outcome);
    }
    println!("  iterations: {}", report.iterations);
    if let (Some(count), Some(percent)) = (report.gap_count, report.gap_percent) {
        println!("  gaps:       {} ({:.1}%)", count, percent);
    }
    println!(
        "  calls:      {} (est. cost {:.4}, cache hit ratio {:.0}%)",
        report.metrics.external_calls,
        report.metrics.estimated_cost,
        report.metrics.cache_hit_ratio() * 100.0
    );
}

fn cmd_status(config: &Config, reference: Option<&str>, format: OutputFormat) -> Result<()> {
    debug!(?reference, "cmd_status: called");
    let store = StateStore::open(&config.output_directory)?;

    let state = match reference {
        Some(reference) => {
            let ids = store.ids()?;
            let run_id = match RunIdResolver::new(&ids).resolve(reference) {
                Ok(Some(id)) => id,
                Ok(None) => bail!("No run matches '{}'", reference),
                Err(candidates) => bail!("'{}' is ambiguous: {}", reference, candidates.join(", ")),
            };
            store.load(&run_id)?
        }
        None => store.latest()?,
    };
    let Some(state) = state else {
        println!("No runs found in {}", config.output_directory.display());
        return Ok(());
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&state)?),
        OutputFormat::Text => print_state(&state),
    }
    Ok(())
}

fn print_state(state: &RunState) {
    print_report(&RunReport::from_state(state));
    if let Some(dir) = &state.dataset_dir {
        println!("  dataset:    {} ({} items)", dir, state.dataset.item_count);
    }
    println!("  created:    {}", state.timestamps.created_at.to_rfc3339());
    if let Some(done) = state.timestamps.completed_at {
        println!("  completed:  {}", done.to_rfc3339());
    }

    if !state.stages.is_empty() {
        println!("{}", "Stages:".bold());
        for (name, record) in &state.stages {
            let status = match record.status {
                StageStatus::Complete => record.status.to_string().green(),
                StageStatus::Failed => record.status.to_string().red(),
                StageStatus::Retrying | StageStatus::Running => record.status.to_string().yellow(),
                StageStatus::NotStarted => record.status.to_string().dimmed(),
            };
            let cached = if record.cached { " (cached)" } else { "" };
            println!("  {:<20} {:<12} attempts={}{}", name, status, record.attempts, cached);
            if let Some(err) = &record.last_error {
                println!("    {}", err.dimmed());
            }
        }
    }
}

fn cmd_runs(config: &Config, format: OutputFormat) -> Result<()> {
    debug!("cmd_runs: called");
    let store = StateStore::open(&config.output_directory)?;
    let runs = store.list()?;

    if format == OutputFormat::Json {
        let reports: Vec<RunReport> = runs.iter().map(RunReport::from_state).collect();
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs found in {}", config.output_directory.display());
        return Ok(());
    }
    for run in &runs {
        let status = match run.status {
            RunStatus::Complete => run.status.to_string().green(),
            RunStatus::Failed => run.status.to_string().red(),
            RunStatus::Running => run.status.to_string().yellow(),
        };
        let lineage = run
            .parent_run_id
            .as_deref()
            .map(|p| format!(" <- {}", p))
            .unwrap_or_default();
        println!(
            "{}  {:<8}  {}{}",
            run.timestamps.created_at.format("%Y-%m-%d %H:%M:%S"),
            status,
            run.run_id,
            lineage.dimmed()
        );
    }
    Ok(())
}

fn cmd_gaps(report_path: &Path, threshold: f64, format: OutputFormat) -> Result<()> {
    debug!(report = %report_path.display(), threshold, "cmd_gaps: called");
    if !(0.0..=1.0).contains(&threshold) {
        bail!("threshold must be within 0..=1, got {}", threshold);
    }
    let Some(report) = CompletenessReport::load(report_path)? else {
        bail!("Report not found: {}", report_path.display());
    };
    let gaps = extract_gaps(&report, threshold);
    let summary = summarize(&gaps);

    if format == OutputFormat::Json {
        let body = serde_json::json!({ "summary": summary, "gaps": gaps });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!(
        "{} {} of {} sub-requirements below {:.0}%",
        "Gaps:".bold(),
        summary.total,
        report.sub_requirement_count(),
        threshold * 100.0
    );
    for (severity, count) in &summary.by_severity {
        println!("  {:<10} {}", severity.to_string(), count);
    }
    for gap in &gaps {
        println!(
            "  [{}] {} {:.0}%  {}",
            gap.severity,
            gap.key(),
            gap.completeness,
            gap.description.dimmed()
        );
    }
    Ok(())
}

fn cmd_migrate(config: &Config) -> Result<()> {
    debug!("cmd_migrate: called");
    let store = StateStore::open(&config.output_directory)?;
    let count = store.migrate_all()?;
    println!("Migrated {} run(s) in {}", count, config.output_directory.display());
    Ok(())
}
