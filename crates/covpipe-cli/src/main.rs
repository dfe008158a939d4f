//! covpipe - test-and-coverage reporting pipeline CLI
//!
//! ## Commands
//!
//! - `run`: run every matrix job and report each job's terminal status
//! - `plan`: print the expanded jobs and their commands without running them
//! - `init`: write a default pipeline file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use covpipe_core::{
    CommandRunner, GateVerdict, HelperReporter, MatrixGate, MatrixResult, MatrixRunner,
    NoopReporter, PipelineConfig, ProcessRunner, ReporterId, ReportingService,
    DEFAULT_PIPELINE_FILE,
};

#[derive(Parser)]
#[command(name = "covpipe")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run tests with coverage across an interpreter matrix", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every job of the matrix
    Run {
        /// Pipeline file
        #[arg(short, long, default_value = DEFAULT_PIPELINE_FILE)]
        config: PathBuf,

        /// Reporting-service identifier
        #[arg(long, env = "CC_TEST_REPORTER_ID", hide_env_values = true)]
        reporter_id: Option<String>,

        /// Skip the external reporting service
        #[arg(long)]
        no_report: bool,

        /// Write a JSON summary of the matrix to this file
        #[arg(long)]
        summary: Option<PathBuf>,

        /// Maximum number of jobs in flight (overrides the pipeline file)
        #[arg(long)]
        parallel: Option<usize>,

        /// Only run these versions (comma-separated)
        #[arg(long, value_delimiter = ',')]
        versions: Vec<String>,
    },

    /// Show the jobs and commands a run would execute
    Plan {
        /// Pipeline file
        #[arg(short, long, default_value = DEFAULT_PIPELINE_FILE)]
        config: PathBuf,

        /// Plan without the external reporting service
        #[arg(long)]
        no_report: bool,

        /// Only plan these versions (comma-separated)
        #[arg(long, value_delimiter = ',')]
        versions: Vec<String>,
    },

    /// Write a default pipeline file
    Init {
        /// Directory to initialize (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing pipeline file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    covpipe_core::init_tracing(cli.json_logs, level);

    match cli.command {
        Commands::Run {
            config,
            reporter_id,
            no_report,
            summary,
            parallel,
            versions,
        } => {
            let code = cmd_run(
                &config,
                reporter_id,
                no_report,
                summary.as_deref(),
                parallel,
                &versions,
            )
            .await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Plan {
            config,
            no_report,
            versions,
        } => cmd_plan(&config, no_report, &versions),
        Commands::Init { path, force } => cmd_init(&path, force),
    }
}

/// Load the pipeline file and apply command-line overrides.
fn load_config(path: &Path, parallel: Option<usize>, versions: &[String]) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(path)
        .with_context(|| format!("Failed to load pipeline file {}", path.display()))?;

    if !versions.is_empty() {
        config.restrict_versions(versions)?;
    }
    if let Some(parallel) = parallel {
        config.matrix.parallelism = parallel;
    }
    config.validate().context("Invalid pipeline configuration")?;

    Ok(config)
}

/// The command line wins over the pipeline file.
fn resolve_reporter_id(
    cli_id: Option<String>,
    config: &PipelineConfig,
    no_report: bool,
) -> Result<ReporterId> {
    match cli_id.or_else(|| config.reporter.id.clone()) {
        Some(id) if !id.is_empty() => Ok(ReporterId::new(id)),
        _ if no_report => Ok(ReporterId::new(String::new())),
        _ => anyhow::bail!(
            "No reporter id: pass --reporter-id, set CC_TEST_REPORTER_ID, or use --no-report"
        ),
    }
}

fn build_reporter(
    config: &PipelineConfig,
    no_report: bool,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn ReportingService>> {
    if no_report {
        return Ok(Arc::new(NoopReporter));
    }
    let reporter = HelperReporter::from_config(&config.reporter, runner)
        .context("Failed to set up the reporting helper")?;
    Ok(Arc::new(reporter))
}

#[derive(Serialize)]
struct RunSummary<'a> {
    result: &'a MatrixResult,
    gate: &'a GateVerdict,
}

/// Run the matrix; returns the process exit code.
async fn cmd_run(
    config_path: &Path,
    reporter_id: Option<String>,
    no_report: bool,
    summary: Option<&Path>,
    parallel: Option<usize>,
    versions: &[String],
) -> Result<i32> {
    let config = load_config(config_path, parallel, versions)?;
    let reporter_id = resolve_reporter_id(reporter_id, &config, no_report)?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
    let reporter = build_reporter(&config, no_report, Arc::clone(&runner))?;

    println!("Running pipeline: {}", config_path.display());
    println!(
        "Matrix: {} {}",
        config.matrix.interpreter,
        config.matrix.versions.join(", ")
    );
    println!("Reporter: {}", reporter.name());
    println!();

    let result = MatrixRunner::new(config, reporter_id, runner, reporter)
        .run()
        .await
        .context("Matrix failed to run")?;

    println!("Build ID: {}", result.build_id);
    println!(
        "Status: {}",
        if result.success() { "✓ PASSED" } else { "✗ FAILED" }
    );
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for job in &result.jobs {
        let status = if job.success { "✓" } else { "✗" };
        match job.aborted_at {
            Some(phase) => println!(
                "  {} {} ({}ms, aborted during {})",
                status, job.job.id, job.duration_ms, phase
            ),
            None => println!(
                "  {} {} ({}ms, exit code: {})",
                status, job.job.id, job.duration_ms, job.exit_code
            ),
        }
    }

    println!();
    println!(
        "Summary: {}/{} jobs passed",
        result.passed_count(),
        result.jobs.len()
    );

    let verdict = MatrixGate::evaluate(&result.jobs);
    println!(
        "Gate: {}",
        if verdict.passed { "✓ PASSED" } else { "✗ FAILED" }
    );

    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {}", violation);
        }
    }
    if !verdict.warnings.is_empty() {
        println!("Warnings:");
        for warning in &verdict.warnings {
            println!("  - {}", warning);
        }
    }

    if let Some(path) = summary {
        let json = serde_json::to_string_pretty(&RunSummary {
            result: &result,
            gate: &verdict,
        })?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!(path = %path.display(), "Wrote matrix summary");
    }

    let code = result.exit_code();
    if code == 0 {
        println!("\n✓ All jobs passed!");
    }
    Ok(code)
}

fn cmd_plan(config_path: &Path, no_report: bool, versions: &[String]) -> Result<()> {
    let config = load_config(config_path, None, versions)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
    let reporter = build_reporter(&config, no_report, Arc::clone(&runner))?;

    let matrix = MatrixRunner::new(config, ReporterId::new(String::new()), runner, reporter);
    let plan = matrix.plan().context("Failed to expand the matrix")?;

    println!(
        "Pipeline: {} ({} job(s), parallelism {})",
        config_path.display(),
        plan.len(),
        matrix.config().matrix.parallelism
    );

    for (ctx, phases) in &plan {
        println!();
        println!(
            "Job {} (#{}, digest {})",
            ctx.job.id,
            ctx.job.number,
            ctx.job.short_digest()
        );
        for (kind, steps) in phases {
            println!("  [{}] ({:?})", kind, kind.policy());
            for step in steps {
                println!("      {}", step);
            }
        }
    }

    Ok(())
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    let file = path.join(DEFAULT_PIPELINE_FILE);
    if file.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            file.display()
        );
    }

    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let content = PipelineConfig::default().to_toml_string()?;
    std::fs::write(&file, content)
        .with_context(|| format!("Failed to write {}", file.display()))?;

    println!("✓ Wrote {}", file.display());
    Ok(())
}
