//! Shared test utilities for orchestrator scenarios.
//!
//! - `RecordingBackend` - Backend mock that records calls and fails on demand
//! - `ready_orchestrator` - Orchestrator with recovery already run
//! - Event builders (`iteration_start`, `output`, `completed`, ...)
//! - `record_updates` - Captures everything published to observers

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use crate::core::{
    ExecutionBackend, InterruptedTask, LoopCommand, LoopEvent, Orchestrator, OrchestratorConfig,
    OrchestratorUpdate, ProjectId,
};

/// Error text the CLI prints when run outside a trusted repository.
pub const PRECONDITION_ERROR: &str =
    "Not inside a trusted directory and --skip-git-repo-check was not specified.";

/// Backend mock.
///
/// Starts succeed and mark the loop alive unless a failure was scripted.
/// No events are emitted; tests feed them to the orchestrator directly.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<(LoopCommand, ProjectId)>>,
    start_failures: Mutex<HashMap<ProjectId, VecDeque<String>>>,
    failing: Mutex<HashSet<LoopCommand>>,
    alive: Mutex<HashSet<ProjectId>>,
    interrupted: Mutex<Vec<InterruptedTask>>,
    listing_fails: Mutex<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next start of `project_id` fail with `message`.
    pub fn fail_next_start(&self, project_id: &str, message: &str) {
        lock(&self.start_failures)
            .entry(project_id.to_string())
            .or_default()
            .push_back(message.to_string());
    }

    /// Makes every call of `command` fail.
    pub fn fail(&self, command: LoopCommand) {
        lock(&self.failing).insert(command);
    }

    pub fn set_alive(&self, project_id: &str, alive: bool) {
        let mut loops = lock(&self.alive);
        if alive {
            loops.insert(project_id.to_string());
        } else {
            loops.remove(project_id);
        }
    }

    pub fn set_interrupted(&self, tasks: Vec<InterruptedTask>) {
        *lock(&self.interrupted) = tasks;
    }

    pub fn fail_listing(&self) {
        *lock(&self.listing_fails) = true;
    }

    /// Returns every call in order.
    pub fn calls(&self) -> Vec<(LoopCommand, ProjectId)> {
        lock(&self.calls).clone()
    }

    /// Returns the projects of every call of `command`, in order.
    pub fn calls_of(&self, command: LoopCommand) -> Vec<ProjectId> {
        self.calls()
            .into_iter()
            .filter(|(c, _)| *c == command)
            .map(|(_, id)| id)
            .collect()
    }

    fn record(&self, command: LoopCommand, project_id: &str) -> Result<()> {
        lock(&self.calls).push((command, project_id.to_string()));
        if lock(&self.failing).contains(&command) {
            bail!("{command} failed for {project_id}");
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionBackend for RecordingBackend {
    async fn start(&self, project_id: &str, _max_iterations: u32) -> Result<()> {
        self.record(LoopCommand::Start, project_id)?;
        let scripted = lock(&self.start_failures)
            .get_mut(project_id)
            .and_then(VecDeque::pop_front);
        if let Some(message) = scripted {
            return Err(anyhow!(message));
        }
        self.set_alive(project_id, true);
        Ok(())
    }

    async fn pause(&self, project_id: &str) -> Result<()> {
        self.record(LoopCommand::Pause, project_id)
    }

    async fn resume(&self, project_id: &str) -> Result<()> {
        self.record(LoopCommand::Resume, project_id)
    }

    async fn stop(&self, project_id: &str) -> Result<()> {
        self.record(LoopCommand::Stop, project_id)
    }

    async fn get_status(&self, project_id: &str) -> Result<bool> {
        self.record(LoopCommand::GetStatus, project_id)?;
        Ok(lock(&self.alive).contains(project_id))
    }

    async fn list_interrupted(&self) -> Result<Vec<InterruptedTask>> {
        if *lock(&self.listing_fails) {
            bail!("task store unreadable");
        }
        Ok(lock(&self.interrupted).clone())
    }

    async fn cancel_interrupted(&self, project_id: &str) -> Result<()> {
        self.record(LoopCommand::CancelInterrupted, project_id)
    }

    async fn init_precondition(&self, project_id: &str) -> Result<()> {
        self.record(LoopCommand::InitPrecondition, project_id)
    }

    async fn set_permanent_skip(&self, project_id: &str, _skip: bool) -> Result<()> {
        self.record(LoopCommand::SetPermanentSkip, project_id)
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Creates an orchestrator that has not run recovery yet.
pub fn orchestrator(max_concurrent: usize) -> (Arc<RecordingBackend>, Orchestrator) {
    let backend = RecordingBackend::new();
    let orchestrator = Orchestrator::new(
        backend.clone(),
        OrchestratorConfig::with_max_concurrent(max_concurrent),
    );
    (backend, orchestrator)
}

/// Creates an orchestrator that accepts work.
pub async fn ready_orchestrator(max_concurrent: usize) -> (Arc<RecordingBackend>, Orchestrator) {
    let (backend, orchestrator) = orchestrator(max_concurrent);
    orchestrator.run_recovery().await;
    (backend, orchestrator)
}

/// Collects every update the orchestrator publishes.
pub fn record_updates(orchestrator: &Orchestrator) -> Arc<Mutex<Vec<OrchestratorUpdate>>> {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    orchestrator.subscribe(move |update| lock(&sink).push(update.clone()));
    updates
}

/// Feeds events to the orchestrator in order.
pub async fn feed(orchestrator: &Orchestrator, events: Vec<LoopEvent>) {
    for event in events {
        orchestrator.handle_event(event).await;
    }
}

pub fn iteration_start(project_id: &str, iteration: u32) -> LoopEvent {
    LoopEvent::IterationStart {
        project_id: project_id.to_string(),
        iteration,
    }
}

pub fn output(project_id: &str, iteration: u32, content: &str) -> LoopEvent {
    LoopEvent::Output {
        project_id: project_id.to_string(),
        iteration,
        content: content.to_string(),
        is_stderr: false,
    }
}

pub fn stderr(project_id: &str, iteration: u32, content: &str) -> LoopEvent {
    LoopEvent::Output {
        project_id: project_id.to_string(),
        iteration,
        content: content.to_string(),
        is_stderr: true,
    }
}

pub fn pausing(project_id: &str, iteration: u32) -> LoopEvent {
    LoopEvent::Pausing {
        project_id: project_id.to_string(),
        iteration,
    }
}

pub fn paused(project_id: &str, iteration: u32) -> LoopEvent {
    LoopEvent::Paused {
        project_id: project_id.to_string(),
        iteration,
    }
}

pub fn resumed(project_id: &str, iteration: u32) -> LoopEvent {
    LoopEvent::Resumed {
        project_id: project_id.to_string(),
        iteration,
    }
}

pub fn completed(project_id: &str, iteration: u32) -> LoopEvent {
    LoopEvent::Completed {
        project_id: project_id.to_string(),
        iteration,
    }
}

pub fn max_reached(project_id: &str, iteration: u32) -> LoopEvent {
    LoopEvent::MaxIterationsReached {
        project_id: project_id.to_string(),
        iteration,
    }
}

pub fn error(project_id: &str, iteration: u32, message: &str) -> LoopEvent {
    LoopEvent::Error {
        project_id: project_id.to_string(),
        iteration,
        error: message.to_string(),
    }
}

pub fn stopped(project_id: &str) -> LoopEvent {
    LoopEvent::Stopped {
        project_id: project_id.to_string(),
    }
}

/// Runs a project's loop from first iteration to completion.
pub async fn run_to_completion(orchestrator: &Orchestrator, project_id: &str) {
    feed(
        orchestrator,
        vec![
            iteration_start(project_id, 1),
            output(project_id, 1, "done"),
            completed(project_id, 1),
        ],
    )
    .await;
}
