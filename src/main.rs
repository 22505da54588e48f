//! `loopherd` - concurrent agent loop orchestrator
//!
//! Entry point for the demo driver: runs simulated loops through the
//! orchestrator and prints what happens.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tokio::sync::{Notify, mpsc, watch};
use tracing::warn;

use loopherd::cli::{Args, ProjectIteration};
use loopherd::core::{
    EVENT_CHANNEL_SIZE, GuardDecision, InterruptedTask, LoopStatus, Orchestrator,
    OrchestratorConfig, OrchestratorUpdate, ProjectLoopState, RecoveryDecision, SimulatedBackend,
    SimulatedProject,
};
use loopherd::fs::{LoopherdPaths, PersistedSettings};
use loopherd::logging;

/// How long to wait for an update before re-checking progress.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let paths = match &args.base_dir {
        Some(dir) => LoopherdPaths::new(dir),
        None => LoopherdPaths::from_cwd()?,
    };
    let config = effective_config(&args, &paths);
    if args.save {
        paths.save_settings(&PersistedSettings::from(&config))?;
        println!("Saved settings to {}", paths.settings_file().display());
    }

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let backend = Arc::new(
        SimulatedBackend::new(events_tx, Duration::from_millis(args.delay_ms))
            .with_signals(&config.completion_signal, &config.precondition_marker)
            .with_interrupted(interrupted_tasks(&args.interrupted)),
    );
    for project_id in &args.projects {
        backend.configure(project_id, script_for(&args, project_id));
    }

    let orchestrator = Arc::new(Orchestrator::new(backend, config));
    let wake = Arc::new(Notify::new());
    let notify = Arc::clone(&wake);
    orchestrator.subscribe(move |update| {
        match update {
            OrchestratorUpdate::Notification(notification) => println!("* {notification}"),
            OrchestratorUpdate::Guard(Some(request)) => println!(
                "? {} needs a decision ({:?}): {}",
                request.project_id, request.reason, request.message
            ),
            _ => {}
        }
        notify.notify_one();
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let event_loop = tokio::spawn(Arc::clone(&orchestrator).run_event_loop(events_rx, shutdown_rx));

    recover(&orchestrator, args.on_interrupted.into()).await;

    for project_id in &args.projects {
        match orchestrator.start(project_id).await {
            Ok(outcome) => println!("> {project_id}: {outcome:?}"),
            Err(err) => println!("! {project_id}: {err}"),
        }
    }

    drive(&orchestrator, &wake, args.on_precondition.into()).await;

    let _ = shutdown_tx.send(true);
    if let Err(err) = event_loop.await {
        warn!(error = %err, "Event loop task failed");
    }

    print_table(&orchestrator.states());
    Ok(())
}

/// Loads persisted settings and applies command-line overrides.
fn effective_config(args: &Args, paths: &LoopherdPaths) -> OrchestratorConfig {
    let settings = paths.load_settings().unwrap_or_else(|err| {
        warn!(error = %format!("{err:#}"), "Ignoring unreadable settings");
        PersistedSettings::default()
    });
    let mut config = settings.into_config();
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent = max_concurrent.max(1);
    }
    if let Some(max_iterations) = args.max_iterations {
        config.default_max_iterations = max_iterations.max(1);
    }
    config
}

fn script_for(args: &Args, project_id: &str) -> SimulatedProject {
    let at = |entries: &[ProjectIteration]| {
        entries
            .iter()
            .find(|entry| entry.project_id == project_id)
            .map(|entry| entry.iteration)
    };
    SimulatedProject {
        complete_after: args.complete_after,
        fail_at: at(&args.fail),
        trusted: !args.untrusted.iter().any(|id| id == project_id),
        revoke_trust_at: at(&args.revoke_trust),
        skip_check: false,
    }
}

fn interrupted_tasks(entries: &[ProjectIteration]) -> Vec<InterruptedTask> {
    entries
        .iter()
        .map(|entry| InterruptedTask {
            project_id: entry.project_id.clone(),
            project_name: entry.project_id.clone(),
            iteration: entry.iteration,
            status: LoopStatus::Running,
        })
        .collect()
}

async fn recover(orchestrator: &Orchestrator, decision: RecoveryDecision) {
    let mut recovery = orchestrator.run_recovery().await;
    for task in recovery.pending() {
        println!(
            "~ {} was interrupted at iteration {} ({})",
            task.project_name, task.iteration, task.status
        );
    }
    if let Err(err) = recovery.decide_all(orchestrator, decision).await {
        println!("! recovery: {err}");
    }
    if let Some(selected) = orchestrator.selected_project() {
        println!("~ {selected} selected for a manual resume");
    }
}

/// Answers precondition prompts until no loop is running or waiting.
async fn drive(orchestrator: &Orchestrator, wake: &Notify, decision: GuardDecision) {
    loop {
        if let Some(request) = orchestrator.pending_guard() {
            match orchestrator.resolve_guard(decision).await {
                Ok(resolution) => println!("> {}: {resolution:?}", request.project_id),
                Err(err) => {
                    println!("! {}: {err}", request.project_id);
                    // Leave a request that keeps failing rather than spin on it.
                    if orchestrator.resolve_guard(GuardDecision::Cancel).await.is_err() {
                        warn!("Could not drop precondition request");
                    }
                }
            }
            continue;
        }
        if orchestrator.running().is_empty() && orchestrator.queued().is_empty() {
            return;
        }
        let _ = tokio::time::timeout(POLL_INTERVAL, wake.notified()).await;
    }
}

fn print_table(states: &[ProjectLoopState]) {
    let now = Utc::now();
    println!();
    println!(
        "{:<16} {:<10} {:>9} {:>8}  RESULT",
        "PROJECT", "STATUS", "ITER", "ELAPSED"
    );
    for state in states {
        let elapsed = state.elapsed(now).map_or_else(
            || "-".to_string(),
            |d| {
                let ms = d.num_milliseconds().max(0);
                format!("{}.{}s", ms / 1000, (ms % 1000) / 100)
            },
        );
        let iteration = format!("{}/{}", state.current_iteration, state.max_iterations);
        let result = state
            .last_error
            .as_deref()
            .or(state.summary.as_deref())
            .unwrap_or("");
        println!(
            "{:<16} {:<10} {iteration:>9} {elapsed:>8}  {result}",
            state.project_id, state.status
        );
    }
}
