//! In-process execution backend.
//!
//! Runs each loop as a tokio task that emits the same events a real agent
//! CLI backend would, without spawning anything. Used by the demo binary and
//! by tests that need realistic event timing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use crate::core::ProjectId;
use crate::core::backend::{ExecutionBackend, InterruptedTask};
use crate::core::config::{DEFAULT_COMPLETION_SIGNAL, DEFAULT_PRECONDITION_MARKER};
use crate::core::events::LoopEvent;

/// Scripted behavior of one simulated project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedProject {
    /// Iteration that prints the completion signal. `None` runs to the ceiling.
    pub complete_after: Option<u32>,
    /// Iteration that fails with an execution error.
    pub fail_at: Option<u32>,
    /// Whether the start-time precondition check passes.
    pub trusted: bool,
    /// Iteration at which the running loop reports a precondition failure.
    pub revoke_trust_at: Option<u32>,
    /// Per-project override that bypasses both precondition checks.
    pub skip_check: bool,
}

impl Default for SimulatedProject {
    fn default() -> Self {
        Self {
            complete_after: None,
            fail_at: None,
            trusted: true,
            revoke_trust_at: None,
            skip_check: false,
        }
    }
}

impl SimulatedProject {
    const fn precondition_met(&self) -> bool {
        self.trusted || self.skip_check
    }
}

#[derive(Debug, Default)]
struct LoopControl {
    iteration: AtomicU32,
    pause: AtomicBool,
    stop: AtomicBool,
    wake: Notify,
}

type LoopMap = Arc<Mutex<HashMap<ProjectId, Arc<LoopControl>>>>;

/// Execution backend that simulates agent loops in-process.
pub struct SimulatedBackend {
    events: mpsc::Sender<LoopEvent>,
    iteration_delay: Duration,
    completion_signal: String,
    marker: String,
    projects: Mutex<HashMap<ProjectId, SimulatedProject>>,
    loops: LoopMap,
    interrupted: Mutex<Vec<InterruptedTask>>,
}

impl std::fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("iteration_delay", &self.iteration_delay)
            .finish_non_exhaustive()
    }
}

impl SimulatedBackend {
    /// Creates a backend pushing events into `events`.
    #[must_use]
    pub fn new(events: mpsc::Sender<LoopEvent>, iteration_delay: Duration) -> Self {
        Self {
            events,
            iteration_delay,
            completion_signal: DEFAULT_COMPLETION_SIGNAL.to_string(),
            marker: DEFAULT_PRECONDITION_MARKER.to_string(),
            projects: Mutex::new(HashMap::new()),
            loops: Arc::new(Mutex::new(HashMap::new())),
            interrupted: Mutex::new(Vec::new()),
        }
    }

    /// Uses a different completion signal and precondition marker.
    #[must_use]
    pub fn with_signals(mut self, completion_signal: &str, marker: &str) -> Self {
        self.completion_signal = completion_signal.to_string();
        self.marker = marker.to_string();
        self
    }

    /// Reports these loops as interrupted by a previous session.
    #[must_use]
    pub fn with_interrupted(self, tasks: Vec<InterruptedTask>) -> Self {
        *self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = tasks;
        self
    }

    /// Scripts a project's behavior. Unscripted projects are trusted and run
    /// to their iteration ceiling.
    pub fn configure(&self, project_id: &str, project: SimulatedProject) {
        self.projects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(project_id.to_string(), project);
    }

    /// Returns a project's current script.
    #[must_use]
    pub fn project(&self, project_id: &str) -> SimulatedProject {
        self.projects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    fn update_project(&self, project_id: &str, f: impl FnOnce(&mut SimulatedProject)) {
        let mut projects = self.projects.lock().unwrap_or_else(PoisonError::into_inner);
        f(projects.entry(project_id.to_string()).or_default());
    }

    fn control(&self, project_id: &str) -> Result<Arc<LoopControl>> {
        let loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        match loops.get(project_id) {
            Some(control) => Ok(Arc::clone(control)),
            None => bail!("no loop running for {project_id}"),
        }
    }

    fn precondition_error(&self) -> String {
        format!(
            "Not inside a trusted directory and --{} was not specified.",
            self.marker
        )
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    async fn start(&self, project_id: &str, max_iterations: u32) -> Result<()> {
        let project = self.project(project_id);
        if !project.precondition_met() {
            bail!(self.precondition_error());
        }

        let control = Arc::new(LoopControl::default());
        {
            let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
            if loops.contains_key(project_id) {
                bail!("loop already running for {project_id}");
            }
            loops.insert(project_id.to_string(), Arc::clone(&control));
        }

        let run = SimulatedRun {
            project_id: project_id.to_string(),
            project,
            max_iterations: max_iterations.max(1),
            delay: self.iteration_delay,
            completion_signal: self.completion_signal.clone(),
            precondition_error: self.precondition_error(),
            events: self.events.clone(),
            loops: Arc::clone(&self.loops),
            control,
        };
        tokio::spawn(run.run());
        Ok(())
    }

    async fn pause(&self, project_id: &str) -> Result<()> {
        let control = self.control(project_id)?;
        if control.pause.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let event = LoopEvent::Pausing {
            project_id: project_id.to_string(),
            iteration: control.iteration.load(Ordering::SeqCst),
        };
        self.events.send(event).await?;
        Ok(())
    }

    async fn resume(&self, project_id: &str) -> Result<()> {
        let control = self.control(project_id)?;
        control.pause.store(false, Ordering::SeqCst);
        control.wake.notify_one();
        Ok(())
    }

    async fn stop(&self, project_id: &str) -> Result<()> {
        let control = self.control(project_id)?;
        control.stop.store(true, Ordering::SeqCst);
        control.wake.notify_one();
        Ok(())
    }

    async fn get_status(&self, project_id: &str) -> Result<bool> {
        Ok(self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(project_id))
    }

    async fn list_interrupted(&self) -> Result<Vec<InterruptedTask>> {
        Ok(self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn cancel_interrupted(&self, project_id: &str) -> Result<()> {
        let mut interrupted = self
            .interrupted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = interrupted.len();
        interrupted.retain(|task| task.project_id != project_id);
        if interrupted.len() == before {
            bail!("no interrupted loop for {project_id}");
        }
        Ok(())
    }

    async fn init_precondition(&self, project_id: &str) -> Result<()> {
        self.update_project(project_id, |project| {
            project.trusted = true;
            project.revoke_trust_at = None;
        });
        Ok(())
    }

    async fn set_permanent_skip(&self, project_id: &str, skip: bool) -> Result<()> {
        self.update_project(project_id, |project| project.skip_check = skip);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// One spawned loop.
struct SimulatedRun {
    project_id: ProjectId,
    project: SimulatedProject,
    max_iterations: u32,
    delay: Duration,
    completion_signal: String,
    precondition_error: String,
    events: mpsc::Sender<LoopEvent>,
    loops: LoopMap,
    control: Arc<LoopControl>,
}

/// How a simulated iteration ended.
enum Step {
    Continue,
    Finish(LoopEvent),
    /// Receiver dropped.
    Abort,
}

impl SimulatedRun {
    async fn run(self) {
        let terminal = self.iterate().await;
        // Status queries must see the loop gone before the terminal event lands.
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.project_id);
        if let Some(event) = terminal {
            debug!(project_id = %self.project_id, event = event.kind(), "Simulated loop finished");
            let _ = self.events.send(event).await;
        }
    }

    async fn iterate(&self) -> Option<LoopEvent> {
        for iteration in 1..=self.max_iterations {
            if !self.wait_while_paused().await {
                return None;
            }
            if self.control.stop.load(Ordering::SeqCst) {
                return Some(self.stopped());
            }
            match self.step(iteration).await {
                Step::Continue => {}
                Step::Finish(event) => return Some(event),
                Step::Abort => return None,
            }
        }
        if self.control.stop.load(Ordering::SeqCst) {
            return Some(self.stopped());
        }
        Some(LoopEvent::MaxIterationsReached {
            project_id: self.project_id.clone(),
            iteration: self.max_iterations,
        })
    }

    async fn step(&self, iteration: u32) -> Step {
        self.control.iteration.store(iteration, Ordering::SeqCst);
        if !self
            .send(LoopEvent::IterationStart {
                project_id: self.project_id.clone(),
                iteration,
            })
            .await
        {
            return Step::Abort;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let project_id = self.project_id.clone();
        if self.project.revoke_trust_at == Some(iteration) && !self.project.skip_check {
            return Step::Finish(LoopEvent::Error {
                project_id,
                iteration,
                error: self.precondition_error.clone(),
            });
        }
        if self.project.fail_at == Some(iteration) {
            return Step::Finish(LoopEvent::Error {
                project_id,
                iteration,
                error: format!("agent exited with code 1 during iteration {iteration}"),
            });
        }

        let line = format!("iteration {iteration}: applied changes for {project_id}");
        if !self.output(iteration, &line).await {
            return Step::Abort;
        }
        if self.project.complete_after == Some(iteration) {
            let signal = self.completion_signal.clone();
            if !self.output(iteration, &signal).await {
                return Step::Abort;
            }
            return Step::Finish(LoopEvent::Completed {
                project_id,
                iteration,
            });
        }
        Step::Continue
    }

    /// Holds the loop at an iteration boundary while paused.
    ///
    /// Returns false if the event receiver is gone.
    async fn wait_while_paused(&self) -> bool {
        if !self.control.pause.load(Ordering::SeqCst) {
            return true;
        }
        let iteration = self.control.iteration.load(Ordering::SeqCst);
        if !self
            .send(LoopEvent::Paused {
                project_id: self.project_id.clone(),
                iteration,
            })
            .await
        {
            return false;
        }
        while self.control.pause.load(Ordering::SeqCst) && !self.control.stop.load(Ordering::SeqCst)
        {
            self.control.wake.notified().await;
        }
        if self.control.stop.load(Ordering::SeqCst) {
            return true;
        }
        self.send(LoopEvent::Resumed {
            project_id: self.project_id.clone(),
            iteration,
        })
        .await
    }

    async fn output(&self, iteration: u32, content: &str) -> bool {
        self.send(LoopEvent::Output {
            project_id: self.project_id.clone(),
            iteration,
            content: content.to_string(),
            is_stderr: false,
        })
        .await
    }

    async fn send(&self, event: LoopEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    fn stopped(&self) -> LoopEvent {
        LoopEvent::Stopped {
            project_id: self.project_id.clone(),
        }
    }
}
