use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wavefront::config::Config;
use wavefront::orchestration::{Orchestrator, RunReport, SchedulerEvent};
use wavefront::plan::Plan;
use wavefront::{Error, Result};

/// Wavefront - run a multi-task implementation plan as parallel waves of
/// coding agents in isolated git worktrees
#[derive(Parser, Debug)]
#[command(name = "wavefront")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WAVEFRONT_LOG=<filter>   Log filter (e.g. wavefront=debug)\n    WAVEFRONT_DEBUG=1        Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Plan file (Markdown, or TOML with a .toml extension)
    #[arg(long)]
    pub plan: PathBuf,

    /// Maximum tasks running at once [default: 3]
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Parse and validate the plan, print the wave layout, execute nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Repository to work in (defaults to the current directory)
    #[arg(long)]
    pub repo: Option<PathBuf>,

    /// Config file (defaults to <repo>/.wavefront.toml, then ~/.wavefront/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Global deadline for the whole run, in minutes
    #[arg(long)]
    pub deadline_mins: Option<u64>,

    /// Attempts per task before it fails
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Enable debug logging (writes to ~/.wavefront/wavefront.log)
    #[arg(short = 'd', long)]
    pub debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    wavefront::log::init_with_debug(cli.debug);

    match run(cli) {
        Ok(None) => ExitCode::SUCCESS,
        Ok(Some(report)) if report.is_success() => ExitCode::SUCCESS,
        Ok(Some(_)) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "run aborted");
            eprintln!("error: {}", e);
            if let Some(path) = wavefront::log::log_path() {
                eprintln!("log: {}", path.display());
            }
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Returns `None` for a dry run.
fn run(cli: Cli) -> Result<Option<RunReport>> {
    let repo = match &cli.repo {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let config = load_config(&cli, &repo)?;
    let plan = Plan::load(&cli.plan)?;

    if cli.dry_run {
        print!("{}", plan.render_layout());
        return Ok(None);
    }

    println!("{}", plan.render_layout());
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let (event_tx, event_rx) = mpsc::channel(64);
        let printer = tokio::spawn(print_events(event_rx));

        let orchestrator = Orchestrator::new(&repo, plan, config)?.with_events(event_tx);
        let report = orchestrator.run(CancellationToken::new()).await;

        drop(orchestrator);
        let _ = printer.await;
        report
    })?;

    println!();
    print!("{}", report.render());
    Ok(Some(report))
}

/// Discover or load config, then apply CLI overrides.
fn load_config(cli: &Cli, repo: &Path) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::discover(repo)?,
    };
    if let Some(max) = cli.max_concurrent {
        config.run.max_concurrent = max;
    }
    if let Some(mins) = cli.deadline_mins {
        config.run.deadline_secs = Some(mins * 60);
    }
    if let Some(max) = cli.max_iterations {
        config.ralph.max_iterations = max;
    }
    config.validate()?;
    Ok(config)
}

async fn print_events(mut rx: mpsc::Receiver<SchedulerEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SchedulerEvent::TaskStarted { task_id } => println!("  task {} started", task_id),
            SchedulerEvent::TaskCompleted { task_id } => println!("  task {} passed its gates", task_id),
            SchedulerEvent::TaskFailed { task_id, reason } => {
                println!("  task {} failed: {}", task_id, reason.lines().next().unwrap_or_default())
            }
            SchedulerEvent::TaskMerged { task_id, commit } => {
                println!("  task {} merged ({})", task_id, commit.get(..7).unwrap_or(&commit))
            }
            SchedulerEvent::TaskMergeFailed { task_id, conflicts } => {
                println!("  task {} hit {} merge conflict(s)", task_id, conflicts)
            }
            SchedulerEvent::TaskSkipped { task_id, reason } => {
                println!("  task {} skipped: {}", task_id, reason)
            }
        }
    }
}

/// 2 for errors that stop the run before or instead of executing tasks.
fn exit_code(error: &Error) -> u8 {
    match error {
        e if e.is_structural() => 2,
        Error::TomlParse(_)
        | Error::Validation(_)
        | Error::RunInProgress { .. }
        | Error::AgentNotAvailable(_)
        | Error::NoHomeDir => 2,
        _ => 1,
    }
}
