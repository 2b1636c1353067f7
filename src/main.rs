//! Binary entry point (§6, §7). Grounded on the teacher's `main.rs`: parse
//! CLI, set up logging before anything else can log, load config, then
//! dispatch on the subcommand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use eyre::{Context, Result, eyre};
use tracing::info;

use devloop_core::cli::{Cli, Command};
use devloop_core::config::Config;
use devloop_core::domain::Prd;
use devloop_core::events::{EventBus, create_event_bus};
use devloop_core::metrics::MetricsBridge;
use devloop_core::orchestrator::{FilesystemPrerequisiteChecker, PrdExecutor, PrdOutcome, PrdSetOrchestrator};
use devloop_core::prd_loader::parse_prd_document;
use devloop_core::runner::{HandoffWriter, IterationRunner, RunnerConfig, TerminationReason};
use devloop_core::store::TaskStore;
use devloop_core::workflow::{ApplyPrimitive, CodeAgent, FilesystemApplyPrimitive, ProcessCodeAgent, ProcessTestRunner, TestRunner};

const SHUTDOWN_EXIT_CODE: i32 = 130;

/// Waits for SIGINT or SIGTERM (Unix) or Ctrl+C (elsewhere).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Races a cleanup future against a second shutdown signal, hard-exiting if
/// the operator signals again before cleanup finishes (§5 cancellation).
async fn finalize_on_shutdown<F: std::future::Future<Output = ()>>(cleanup: F) {
    tokio::select! {
        _ = cleanup => {}
        _ = wait_for_shutdown_signal() => {
            eprintln!("devloop: second shutdown signal received, exiting immediately");
            std::process::exit(SHUTDOWN_EXIT_CODE);
        }
    }
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose || std::env::var("DEBUG").map(|v| v == "true").unwrap_or(false) {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load(cli.config.as_ref()).context("failed to load configuration")?;
    let bus = create_event_bus();

    let result = match &cli.command {
        Command::Run { working_dir, prd_set } => cmd_run(&config, bus.clone(), working_dir.clone(), prd_set.clone()).await,
        Command::RunSet { prd_dir } => cmd_run_set(&config, bus.clone(), prd_dir.clone()).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("devloop: {e:#}");
            std::process::exit(config_error_exit_code());
        }
    }
}

fn config_error_exit_code() -> i32 {
    2
}

fn require_agent_command(config: &Config) -> Result<()> {
    if config.agent.command.trim().is_empty() {
        return Err(eyre!("agent.command must be set to a shell command before running an iteration"));
    }
    Ok(())
}

fn build_runner_config(config: &Config) -> RunnerConfig {
    RunnerConfig {
        max_iterations: config.runner.max_iterations,
        max_task_retries: config.runner.max_task_retries,
        handoff_interval: config.runner.handoff_interval,
        context_threshold_percent: config.runner.context_threshold_percent,
        context_window_size: config.runner.context_window_size,
        stall_window: config.runner.stall_window,
        persist_learnings: true,
        update_patterns: true,
    }
}

fn build_collaborators(config: &Config, working_dir: &PathBuf) -> (Arc<dyn CodeAgent>, Arc<dyn ApplyPrimitive>, Arc<dyn TestRunner>) {
    let agent: Arc<dyn CodeAgent> =
        Arc::new(ProcessCodeAgent::new(config.agent.command.clone(), Duration::from_millis(config.agent.timeout_ms)));
    let apply_primitive: Arc<dyn ApplyPrimitive> = Arc::new(FilesystemApplyPrimitive::new(working_dir));
    let test_runner: Arc<dyn TestRunner> = Arc::new(ProcessTestRunner);
    (agent, apply_primitive, test_runner)
}

async fn cmd_run(config: &Config, bus: Arc<EventBus>, working_dir: PathBuf, prd_set: Option<String>) -> Result<i32> {
    require_agent_command(config)?;

    let devloop_dir = working_dir.join(&config.storage.devloop_dir);
    std::fs::create_dir_all(&devloop_dir).context("failed to create devloop state directory")?;

    let metrics = Arc::new(MetricsBridge::new(&devloop_dir));
    metrics.attach(&bus);

    let tasks_path = devloop_dir.join("tasks.json");
    let retry_path = devloop_dir.join("retry-counts.json");
    let task_store = TaskStore::new(&tasks_path, &retry_path)
        .map_err(|e| eyre!("{e}"))
        .context("failed to open task store")?
        .with_max_retries(config.runner.max_task_retries);

    let (agent, apply_primitive, test_runner) = build_collaborators(config, &working_dir);
    let handoff = HandoffWriter::new(&devloop_dir, &working_dir);

    let mut runner = IterationRunner::new(
        task_store,
        agent,
        apply_primitive,
        test_runner,
        bus,
        handoff,
        build_runner_config(config),
        working_dir.clone(),
        config.testing.command.clone(),
        Duration::from_secs(config.testing.timeout_secs),
        prd_set,
    );

    let reason = tokio::select! {
        reason = runner.run() => reason,
        _ = wait_for_shutdown_signal() => {
            tracing::warn!("shutdown signal received, aborting in-progress work");
            finalize_on_shutdown(async { metrics.stop(); }).await;
            println!("devloop run aborted by shutdown signal");
            return Ok(SHUTDOWN_EXIT_CODE);
        }
    };
    metrics.stop();

    let reopened = TaskStore::new(&tasks_path, &retry_path).map_err(|e| eyre!("{e}"))?;
    let all_tasks = reopened.get_all_tasks();
    let completed = all_tasks.iter().filter(|t| t.status == devloop_core::domain::TaskStatus::Done).count();
    let blocked = all_tasks.iter().filter(|t| t.status == devloop_core::domain::TaskStatus::Blocked).count();

    println!("devloop run finished: {reason:?}");
    println!("  tasks completed: {completed}");
    println!("  tasks blocked:   {blocked}");
    if matches!(reason, TerminationReason::Stalled | TerminationReason::MaxIterations) {
        println!("  handoff written to: {}", devloop_dir.join("handoff.md").display());
        println!("  progress log at:    {}", devloop_dir.join("progress.md").display());
    }

    Ok(match reason {
        TerminationReason::Complete => 0,
        TerminationReason::MaxIterations | TerminationReason::Stalled | TerminationReason::Failed => 1,
    })
}

async fn cmd_run_set(config: &Config, bus: Arc<EventBus>, prd_dir: PathBuf) -> Result<i32> {
    let mut prds = Vec::new();
    let entries = std::fs::read_dir(&prd_dir).context("failed to read PRD directory")?;
    for entry in entries {
        let entry = entry.context("failed to read PRD directory entry")?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let markdown = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let loaded = parse_prd_document(&markdown).with_context(|| format!("failed to parse PRD at {}", path.display()))?;
        info!(prd = %loaded.prd.id, path = %path.display(), "loaded PRD");
        prds.push(loaded.prd);
    }

    if prds.is_empty() {
        return Err(eyre!("no PRD markdown documents found in {}", prd_dir.display()));
    }

    let working_dir = prd_dir.clone();
    let devloop_dir = working_dir.join(&config.storage.devloop_dir);
    std::fs::create_dir_all(&devloop_dir).context("failed to create devloop state directory")?;

    let metrics = Arc::new(MetricsBridge::new(&devloop_dir));
    metrics.attach(&bus);

    let executor = RunnerPrdExecutor {
        config: config.clone(),
        bus: bus.clone(),
        working_dir: working_dir.clone(),
        devloop_dir: devloop_dir.clone(),
    };
    let prerequisites = FilesystemPrerequisiteChecker::new(&working_dir);
    let orchestrator = PrdSetOrchestrator::new(&devloop_dir, config.concurrency.max_concurrent, bus);
    let prd_set_id = prd_dir.file_name().and_then(|n| n.to_str()).unwrap_or("default").to_string();

    let outcome = tokio::select! {
        outcome = orchestrator.run_set(&prd_set_id, &prds, &executor, &prerequisites) => outcome,
        _ = wait_for_shutdown_signal() => {
            tracing::warn!("shutdown signal received, finalizing in-progress PRD set as blocked");
            finalize_on_shutdown(async { metrics.stop(); }).await;
            println!("devloop run-set aborted by shutdown signal");
            return Ok(SHUTDOWN_EXIT_CODE);
        }
    };
    metrics.stop();

    match outcome {
        Ok(outcome) => {
            println!("devloop run-set finished: {outcome:?}");
            Ok(match outcome {
                devloop_core::orchestrator::SetOutcome::Complete => 0,
                devloop_core::orchestrator::SetOutcome::Failed | devloop_core::orchestrator::SetOutcome::Blocked => 1,
            })
        }
        Err(e) => {
            eprintln!("devloop: PRD set rejected: {e}");
            Ok(2)
        }
    }
}

/// Wraps a fresh [`IterationRunner`], scoped to one PRD via `active_set_filter`,
/// as the [`PrdExecutor`] the set orchestrator dispatches against.
struct RunnerPrdExecutor {
    config: Config,
    bus: Arc<EventBus>,
    working_dir: PathBuf,
    devloop_dir: PathBuf,
}

#[async_trait]
impl PrdExecutor for RunnerPrdExecutor {
    async fn run_with_fresh_context(&self, prd: &Prd) -> PrdOutcome {
        if self.config.agent.command.trim().is_empty() {
            return PrdOutcome::Blocked("agent.command is not configured".to_string());
        }

        let tasks_path = self.devloop_dir.join("tasks.json");
        let retry_path = self.devloop_dir.join("retry-counts.json");
        let task_store = match TaskStore::new(&tasks_path, &retry_path) {
            Ok(store) => store.with_id_pattern(prd.id_pattern.clone()).with_max_retries(self.config.runner.max_task_retries),
            Err(e) => return PrdOutcome::Failed(e.to_string()),
        };

        let (agent, apply_primitive, test_runner) = build_collaborators(&self.config, &self.working_dir);
        let handoff = HandoffWriter::new(&self.devloop_dir, &self.working_dir);

        let mut runner = IterationRunner::new(
            task_store,
            agent,
            apply_primitive,
            test_runner,
            self.bus.clone(),
            handoff,
            build_runner_config(&self.config),
            self.working_dir.clone(),
            self.config.testing.command.clone(),
            Duration::from_secs(self.config.testing.timeout_secs),
            Some(prd.id.clone()),
        );

        match runner.run().await {
            TerminationReason::Complete => PrdOutcome::Complete,
            TerminationReason::Failed => PrdOutcome::Failed("iteration runner reported a fatal failure".to_string()),
            TerminationReason::MaxIterations => PrdOutcome::Blocked("max iterations reached before completion".to_string()),
            TerminationReason::Stalled => PrdOutcome::Blocked("no progress within the stall window".to_string()),
        }
    }
}
