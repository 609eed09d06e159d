//! qgate - staged quality gates for Rust workspaces
//!
//! ## Commands
//!
//! - `run`: run the gated workflow (optionally a subset of stages)
//! - `list`: show the stages and checks of the default workflow
//! - `cache`: inspect or clear the persisted result cache
//!
//! Exit codes: 0 success, 1 failed, 2 iteration limit reached, 3 aborted,
//! 4 usage or internal error.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use qgate_ci::{
    default_workflow, select_stages, AutofixCoordinator, CommandAutofix, NoopAutofix,
    OrchestratorConfig, PipelineEvent, StageDefinition, WorkflowRun, WorkflowStatus,
};
use qgate_core::fileset::CARGO_INPUT_EXTENSIONS;
use qgate_core::{
    CancelSource, CancelToken, FileSet, LogFormat, ResultCache, TelemetryConfig,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEFAULT_CACHE_FILE: &str = ".qgate/cache.json";
const EXIT_INTERNAL: u8 = 4;
const OUTPUT_TAIL_LINES: usize = 10;

#[derive(Parser)]
#[command(name = "qgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Staged quality gates with caching and autofix", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted events and log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the quality-gate workflow
    Run(RunArgs),

    /// List the stages and checks of the default workflow
    List,

    /// Inspect or clear the persisted result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Workspace path (default: current directory)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Stages to run, comma-separated (default: all)
    #[arg(short, long, value_delimiter = ',')]
    stages: Vec<String>,

    /// Maximum number of checks running at once
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Maximum autofix-triggered stage re-runs
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Skip the result cache
    #[arg(long)]
    no_cache: bool,

    /// Cache file, relative to the workspace unless absolute
    #[arg(long, default_value = DEFAULT_CACHE_FILE)]
    cache_file: PathBuf,

    /// Auto-repair failing checks with their fix commands
    #[arg(long)]
    fix: bool,

    /// Write the full run record as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show how many persisted entries are still valid
    Stats(CacheArgs),

    /// Delete the cache file
    Clear(CacheArgs),
}

#[derive(Args, Debug, Clone)]
struct CacheArgs {
    /// Workspace path (default: current directory)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Cache file, relative to the workspace unless absolute
    #[arg(long, default_value = DEFAULT_CACHE_FILE)]
    cache_file: PathBuf,
}

#[derive(Serialize)]
struct CacheSummary {
    path: PathBuf,
    valid: usize,
    expired: usize,
    stale: usize,
    inconsistent: usize,
    corrupt: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_INTERNAL)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let (telemetry, rejected) = TelemetryConfig::from_env();
    qgate_core::init_tracing(&telemetry_for(&cli, telemetry));
    for var in rejected {
        warn!(var, "ignoring invalid environment override");
    }

    let result = match cli.command {
        Commands::Run(args) => cmd_run(&args, cli.json)
            .await
            .map(|status| status.exit_code()),
        Commands::List => cmd_list().map(|()| 0),
        Commands::Cache { action } => match action {
            CacheAction::Stats(args) => cmd_cache_stats(&args, cli.json).map(|()| 0),
            CacheAction::Clear(args) => cmd_cache_clear(&args).map(|()| 0),
        },
    };

    match result {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(EXIT_INTERNAL)),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

/// Flags win over `QGATE_LOG_*`: `--json` forces JSON lines and
/// `--verbose` raises qgate's own targets to debug.
fn telemetry_for(cli: &Cli, mut telemetry: TelemetryConfig) -> TelemetryConfig {
    if cli.json {
        telemetry.format = LogFormat::Json;
    }
    if cli.verbose {
        telemetry.level = "debug".to_string();
    }
    telemetry
}

async fn cmd_run(args: &RunArgs, json: bool) -> Result<WorkflowStatus> {
    let names: Vec<String> = args
        .stages
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let stages = if names.is_empty() {
        default_workflow()
    } else {
        select_stages(&default_workflow(), &names)?
    };

    let source = CancelSource::new();
    let token = source.token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling workflow");
            source.cancel();
        }
    });

    let result = run_workflow(args, stages, &token, json).await;
    ctrl_c.abort();
    let run = result?;

    if !json {
        print_summary(&run);
    }
    Ok(run.status)
}

async fn run_workflow(
    args: &RunArgs,
    stages: Vec<StageDefinition>,
    cancel: &CancelToken,
    json: bool,
) -> Result<WorkflowRun> {
    let workspace = canonical_workspace(&args.workspace)?;
    let config = build_config(args)?;
    let files = FileSet::discover(&workspace, CARGO_INPUT_EXTENSIONS)
        .with_context(|| format!("failed to scan workspace {}", workspace.display()))?;
    info!(workspace = %workspace.display(), files = files.len(), "discovered source files");

    let cache_path = resolve_cache_path(&workspace, &args.cache_file);
    let cache = if args.no_cache {
        None
    } else {
        let (cache, report) = ResultCache::load(&cache_path, &workspace, config.cache.clone());
        info!(
            path = %cache_path.display(),
            restored = report.restored,
            stale = report.stale,
            expired = report.expired,
            corrupt = report.corrupt,
            "loaded result cache"
        );
        Some(Arc::new(cache))
    };

    let autofix: Arc<dyn AutofixCoordinator> = if args.fix {
        Arc::new(CommandAutofix::from_stages(files.clone(), &stages))
    } else {
        Arc::new(NoopAutofix)
    };

    let pipeline = config.build_pipeline(cache.clone(), autofix);
    let printer = spawn_printer(pipeline.events().subscribe(), json);
    let run = pipeline.run(&stages, &files, cancel).await;
    if let Err(e) = printer.await {
        warn!(error = %e, "event printer failed");
    }

    if let Some(cache) = &cache {
        match cache.save(&cache_path) {
            Ok(entries) => info!(entries, path = %cache_path.display(), "saved result cache"),
            Err(e) => warn!(error = %e, path = %cache_path.display(), "failed to save result cache"),
        }
    }

    if let Some(path) = &args.report {
        let body = serde_json::to_vec_pretty(&run).context("failed to serialize run report")?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
    }

    Ok(run)
}

fn build_config(args: &RunArgs) -> Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::from_env();
    if let Some(n) = args.max_parallel {
        if n == 0 {
            bail!("--max-parallel must be at least 1");
        }
        config.pipeline.max_parallel = n;
    }
    if let Some(n) = args.max_iterations {
        config.pipeline.max_iterations = n;
    }
    Ok(config)
}

fn canonical_workspace(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .with_context(|| format!("workspace not found: {}", path.display()))
}

fn resolve_cache_path(workspace: &Path, cache_file: &Path) -> PathBuf {
    if cache_file.is_absolute() {
        cache_file.to_path_buf()
    } else {
        workspace.join(cache_file)
    }
}

fn spawn_printer(mut rx: broadcast::Receiver<PipelineEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    print_event(&event, json);
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &PipelineEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, event = event.name(), "failed to encode event"),
        }
    } else if let Some(line) = render_event(event) {
        println!("{line}");
    }
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "✓"
    } else {
        "✗"
    }
}

/// Human-readable line for an event; the terminal event is left to the summary.
fn render_event(event: &PipelineEvent) -> Option<String> {
    match event {
        PipelineEvent::StageStarted {
            stage,
            iteration,
            checks,
            ..
        } => Some(format!(
            "▶ {stage} (iteration {iteration}): {}",
            checks.join(", ")
        )),
        PipelineEvent::CheckCompleted { execution, .. } => Some(format!(
            "  {} {}",
            mark(execution.passed()),
            execution.summary()
        )),
        PipelineEvent::StagePassed {
            stage, duration_ms, ..
        } => Some(format!("✓ {stage} passed ({duration_ms}ms)")),
        PipelineEvent::StageFailed {
            stage,
            policy,
            failing_checks,
            aborted,
            ..
        } => {
            let note = if *aborted {
                " (cancelled)".to_string()
            } else {
                format!(" [{}]", policy.as_str())
            };
            Some(format!(
                "✗ {stage} failed: {}{note}",
                failing_checks.join(", ")
            ))
        }
        PipelineEvent::AutofixAttempted {
            stage,
            applied,
            files_changed,
            error,
            ..
        } => Some(match error {
            Some(error) => format!("  autofix for {stage} failed: {error}"),
            None if *applied => format!(
                "  autofix for {stage} changed {} file(s); re-running",
                files_changed.len()
            ),
            None => format!("  autofix for {stage} changed nothing"),
        }),
        PipelineEvent::WorkflowTerminal { .. } => None,
    }
}

fn tail_lines(text: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}

fn print_summary(run: &WorkflowRun) {
    println!();
    println!("Run ID: {}", run.run_id);
    println!(
        "Status: {} {}",
        mark(run.status == WorkflowStatus::Success),
        run.status
    );
    println!("Iterations: {}/{}", run.iteration, run.max_iterations);
    println!("Duration: {}ms", run.duration_ms());
    if let Some(reason) = &run.abort_reason {
        println!("Reason: {reason}");
    }
    println!();

    for result in run.latest_results() {
        println!(
            "  {} {} [{}] {}/{} checks passed",
            mark(result.passed),
            result.stage,
            result.policy.as_str(),
            result.passed_count(),
            result.executions.len()
        );
        for exec in result.executions.iter().filter(|e| !e.passed()) {
            println!("      {}", exec.summary());
            if let Some(error) = &exec.error {
                println!("        {error}");
            }
            let output = if exec.stderr.trim().is_empty() {
                &exec.stdout
            } else {
                &exec.stderr
            };
            for line in tail_lines(output, OUTPUT_TAIL_LINES) {
                println!("        | {line}");
            }
        }
    }

    if !run.autofix_log.is_empty() {
        println!();
        println!("Autofix attempts: {}", run.autofix_log.len());
        for record in &run.autofix_log {
            println!(
                "  {} {} iteration {} ({} file(s), {} cache entries dropped)",
                mark(record.applied),
                record.stage,
                record.iteration,
                record.files_changed.len(),
                record.invalidated
            );
        }
    }
}

fn cmd_list() -> Result<()> {
    for stage in default_workflow() {
        println!("{} ({})", stage.name, stage.policy.as_str());
        for check in &stage.checks {
            let fix = if check.fix_command.is_some() {
                " [fixable]"
            } else {
                ""
            };
            println!(
                "  {:<14} {}  (timeout {}s){fix}",
                check.name,
                check.command.join(" "),
                check.timeout_secs
            );
        }
    }
    Ok(())
}

fn cmd_cache_stats(args: &CacheArgs, json: bool) -> Result<()> {
    let workspace = canonical_workspace(&args.workspace)?;
    let path = resolve_cache_path(&workspace, &args.cache_file);
    let config = OrchestratorConfig::from_env();
    let (cache, report) = ResultCache::load(&path, &workspace, config.cache);

    let summary = CacheSummary {
        path,
        valid: cache.len(),
        expired: report.expired,
        stale: report.stale,
        inconsistent: report.inconsistent,
        corrupt: report.corrupt,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Cache file: {}", summary.path.display());
    println!("Valid entries: {}", summary.valid);
    println!("Expired: {}", summary.expired);
    println!("Stale: {}", summary.stale);
    if summary.inconsistent > 0 {
        println!("Inconsistent: {}", summary.inconsistent);
    }
    if summary.corrupt {
        println!("The cache file is corrupt and will be rebuilt on the next run.");
    }
    Ok(())
}

fn cmd_cache_clear(args: &CacheArgs) -> Result<()> {
    let workspace = canonical_workspace(&args.workspace)?;
    let path = resolve_cache_path(&workspace, &args.cache_file);
    match std::fs::remove_file(&path) {
        Ok(()) => println!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No cache at {}", path.display())
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to remove {}", path.display()));
        }
    }
    Ok(())
}
