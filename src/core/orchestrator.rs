//! Loop orchestrator.
//!
//! Owns every project's [`ProjectLoopState`], the admission queue and the
//! precondition guard behind a single mutex. The lock is never held across a
//! backend call: slots are reserved under the lock first, then the backend is
//! contacted, then the outcome is written back.
//!
//! Observers receive [`OrchestratorUpdate`]s after the lock is released, so a
//! callback may safely call back into the orchestrator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::core::ProjectId;
use crate::core::backend::{ExecutionBackend, InterruptedTask};
use crate::core::config::OrchestratorConfig;
use crate::core::error::OrchestratorError;
use crate::core::events::LoopCommand;
use crate::core::guard::{GuardDecision, GuardReason, PendingGuardRequest, PreconditionGuard};
use crate::core::machine::LoopStateMachine;
use crate::core::scheduler::{AdmissionScheduler, QueueStatus};
use crate::core::state::{LogEntry, LoopStatus, ProjectLoopState, RunSnapshot};

/// User-facing notice emitted when a run ends on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Completed {
        project_id: ProjectId,
        summary: Option<String>,
    },
    MaxIterationsReached {
        project_id: ProjectId,
        iteration: u32,
    },
    Failed {
        project_id: ProjectId,
        error: String,
    },
}

impl Notification {
    #[must_use]
    pub fn project_id(&self) -> &str {
        match self {
            Self::Completed { project_id, .. }
            | Self::MaxIterationsReached { project_id, .. }
            | Self::Failed { project_id, .. } => project_id,
        }
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed {
                project_id,
                summary,
            } => match summary {
                Some(summary) => write!(f, "{project_id} completed: {summary}"),
                None => write!(f, "{project_id} completed"),
            },
            Self::MaxIterationsReached {
                project_id,
                iteration,
            } => write!(
                f,
                "{project_id} stopped after reaching its limit of {iteration} iterations"
            ),
            Self::Failed { project_id, error } => write!(f, "{project_id} failed: {error}"),
        }
    }
}

/// Change pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorUpdate {
    /// A project's state changed.
    State(ProjectLoopState),
    /// A log line was appended. Sent instead of a full state snapshot.
    Log {
        project_id: ProjectId,
        entry: LogEntry,
    },
    /// Queue occupancy changed.
    Queue(QueueStatus),
    /// The surfaced precondition request changed.
    Guard(Option<PendingGuardRequest>),
    /// A run ended on its own.
    Notification(Notification),
}

/// Handle returned by [`Orchestrator::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Arc<dyn Fn(&OrchestratorUpdate) + Send + Sync>;

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Admitted and handed to the backend.
    Running,
    /// Waiting for a free slot at the given 1-based position.
    Queued { position: usize },
    /// Refused by the precondition check; a guard request is pending.
    AwaitingPrecondition,
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The project was only queued and has been taken off the queue.
    Dequeued,
    /// The backend was asked to stop the loop.
    Requested,
}

/// Result of a precondition decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardResolution {
    /// The attempt was dropped.
    Cancelled,
    /// The still-alive loop was resumed.
    Resumed,
    /// The loop was started again.
    Restarted(StartOutcome),
}

/// What one promotion pass did.
#[derive(Debug, Default)]
pub struct PromotionReport {
    pub started: Vec<ProjectId>,
    pub awaiting_precondition: Vec<ProjectId>,
    pub failed: Vec<(ProjectId, anyhow::Error)>,
}

impl PromotionReport {
    fn take_failure(&mut self, project_id: &str) -> Option<anyhow::Error> {
        let index = self.failed.iter().position(|(id, _)| id == project_id)?;
        Some(self.failed.remove(index).1)
    }
}

/// Outcome of a single backend start.
pub(crate) enum Launch {
    Started,
    AwaitingPrecondition,
    Failed(anyhow::Error),
}

pub(crate) struct Inner {
    pub(crate) states: HashMap<ProjectId, ProjectLoopState>,
    pub(crate) scheduler: AdmissionScheduler,
    pub(crate) guard: PreconditionGuard,
    accepting: bool,
    recovered: bool,
    selected: Option<ProjectId>,
    default_max_iterations: u32,
    log_capacity: usize,
}

impl Inner {
    /// Returns the project's state, creating a `ready` one if it is unknown.
    pub(crate) fn state_mut(&mut self, project_id: &str) -> &mut ProjectLoopState {
        let max_iterations = self.default_max_iterations;
        let log_capacity = self.log_capacity;
        self.states
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectLoopState::new(project_id, max_iterations, log_capacity))
    }

    pub(crate) fn state_update(&self, project_id: &str) -> Option<OrchestratorUpdate> {
        self.states
            .get(project_id)
            .cloned()
            .map(OrchestratorUpdate::State)
    }

    pub(crate) fn queue_update(&self) -> OrchestratorUpdate {
        OrchestratorUpdate::Queue(self.scheduler.status())
    }

    pub(crate) fn guard_update(&self) -> OrchestratorUpdate {
        OrchestratorUpdate::Guard(self.guard.current().cloned())
    }

    fn status_of(&self, project_id: &str) -> Result<LoopStatus, OrchestratorError> {
        self.states
            .get(project_id)
            .map(|state| state.status)
            .ok_or_else(|| OrchestratorError::UnknownProject(project_id.to_string()))
    }
}

/// Coordinates agent loops across projects.
pub struct Orchestrator {
    pub(crate) backend: Arc<dyn ExecutionBackend>,
    pub(crate) machine: LoopStateMachine,
    config: OrchestratorConfig,
    inner: Mutex<Inner>,
    observers: Mutex<Vec<(SubscriptionId, Observer)>>,
    next_subscription: AtomicU64,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    ///
    /// New work is refused until [`Self::run_recovery`] has been called.
    #[must_use]
    pub fn new(backend: Arc<dyn ExecutionBackend>, config: OrchestratorConfig) -> Self {
        let inner = Inner {
            states: HashMap::new(),
            scheduler: AdmissionScheduler::new(config.max_concurrent),
            guard: PreconditionGuard::new(config.precondition_marker.clone()),
            accepting: false,
            recovered: false,
            selected: None,
            default_max_iterations: config.default_max_iterations.max(1),
            log_capacity: config.log_capacity.max(1),
        };
        Self {
            backend,
            machine: LoopStateMachine::new(config.completion_signal.clone()),
            config,
            inner: Mutex::new(inner),
            observers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // --- Observers ---

    /// Registers a callback for every update.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&OrchestratorUpdate) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        id
    }

    /// Removes a callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    fn publish(&self, updates: Vec<OrchestratorUpdate>) {
        if updates.is_empty() {
            return;
        }
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for update in &updates {
            for observer in &observers {
                observer(update);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the state lock, then publishes the updates it collected.
    pub(crate) fn update<R>(
        &self,
        f: impl FnOnce(&mut Inner, &mut Vec<OrchestratorUpdate>) -> R,
    ) -> R {
        let mut updates = Vec::new();
        let result = {
            let mut inner = self.lock();
            f(&mut inner, &mut updates)
        };
        self.publish(updates);
        result
    }

    // --- Queries ---

    /// Returns a snapshot of a project's state.
    #[must_use]
    pub fn state(&self, project_id: &str) -> Option<ProjectLoopState> {
        self.lock().states.get(project_id).cloned()
    }

    /// Returns snapshots of all known projects in id order.
    #[must_use]
    pub fn states(&self) -> Vec<ProjectLoopState> {
        let mut states: Vec<_> = self.lock().states.values().cloned().collect();
        states.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        states
    }

    #[must_use]
    pub fn queue_status(&self) -> QueueStatus {
        self.lock().scheduler.status()
    }

    /// Returns queued project ids, head first.
    #[must_use]
    pub fn queued(&self) -> Vec<ProjectId> {
        self.lock().scheduler.queued()
    }

    /// Returns the ids holding an admission slot.
    #[must_use]
    pub fn running(&self) -> Vec<ProjectId> {
        self.lock().scheduler.running()
    }

    /// Returns true if the project holds an admission slot.
    #[must_use]
    pub fn is_running(&self, project_id: &str) -> bool {
        self.lock().scheduler.is_running(project_id)
    }

    /// Returns the surfaced precondition request.
    #[must_use]
    pub fn pending_guard(&self) -> Option<PendingGuardRequest> {
        self.lock().guard.current().cloned()
    }

    /// Returns the project selected for the user's attention.
    #[must_use]
    pub fn selected_project(&self) -> Option<ProjectId> {
        self.lock().selected.clone()
    }

    /// Returns true once startup recovery has opened admission.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    // --- Project configuration ---

    /// Sets the iteration ceiling used by the project's next run.
    pub fn configure_project(&self, project_id: &str, max_iterations: u32) {
        self.update(|inner, updates| {
            inner.state_mut(project_id).max_iterations = max_iterations.max(1);
            updates.extend(inner.state_update(project_id));
        });
    }

    /// Sets an externally owned status (`ready` or `brainstorming`).
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidStatus`] for any other status and
    /// [`OrchestratorError::AlreadyActive`] while a loop is queued or running.
    pub fn set_external_status(
        &self,
        project_id: &str,
        status: LoopStatus,
    ) -> Result<(), OrchestratorError> {
        if !status.is_external() {
            return Err(OrchestratorError::InvalidStatus {
                project_id: project_id.to_string(),
                status,
            });
        }
        self.update(|inner, updates| {
            let state = inner.state_mut(project_id);
            if state.status.is_active() {
                return Err(OrchestratorError::AlreadyActive {
                    project_id: project_id.to_string(),
                    status: state.status,
                });
            }
            state.status = status;
            updates.extend(inner.state_update(project_id));
            Ok(())
        })
    }

    /// Opens admission. Called once recovery has been surfaced.
    pub(crate) fn open_admission(&self) -> bool {
        let mut inner = self.lock();
        let first = !inner.recovered;
        inner.recovered = true;
        inner.accepting = true;
        first
    }

    /// Applies a "recover" decision: the project is seeded with its last
    /// iteration and selected, but not restarted.
    pub(crate) fn seed_recovered(&self, task: &InterruptedTask) {
        self.update(|inner, updates| {
            let state = inner.state_mut(&task.project_id);
            state.current_iteration = task.iteration;
            if !state.status.is_active() {
                state.status = LoopStatus::Ready;
            }
            inner.selected = Some(task.project_id.clone());
            updates.extend(inner.state_update(&task.project_id));
        });
    }

    // --- Admission ---

    /// Requests a run for a project.
    ///
    /// The project is marked `running` if a slot is free and the backend
    /// accepts it, `queued` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery has not run, the project is already
    /// queued, running or paused, the project is brainstorming, a precondition
    /// decision is pending, or the backend refused the start for a reason
    /// other than the precondition.
    pub async fn start(&self, project_id: &str) -> Result<StartOutcome, OrchestratorError> {
        {
            let inner = self.lock();
            Self::check_admissible(&inner, project_id)?;
            if let Some(state) = inner.states.get(project_id) {
                if state.status == LoopStatus::Brainstorming {
                    return Err(OrchestratorError::InvalidStatus {
                        project_id: project_id.to_string(),
                        status: state.status,
                    });
                }
                // A paused loop is still alive in its slot; it is resumed or stopped.
                let in_flight = matches!(
                    state.status,
                    LoopStatus::Queued
                        | LoopStatus::Running
                        | LoopStatus::Pausing
                        | LoopStatus::Paused
                );
                if in_flight
                    || inner.scheduler.is_running(project_id)
                    || inner.scheduler.is_queued(project_id)
                {
                    return Err(OrchestratorError::AlreadyActive {
                        project_id: project_id.to_string(),
                        status: state.status,
                    });
                }
            }
        }
        self.enqueue(project_id).await
    }

    /// Queues a project and promotes as many queued projects as slots allow.
    ///
    /// Enqueuing a project that is already queued or running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery has not run, a precondition decision is
    /// pending, or the backend refused this project's start.
    pub async fn enqueue(&self, project_id: &str) -> Result<StartOutcome, OrchestratorError> {
        let existing = self.update(|inner, updates| {
            Self::check_admissible(inner, project_id)?;
            if inner.scheduler.is_running(project_id) {
                return Ok(Some(StartOutcome::Running));
            }
            if let Some(position) = inner.scheduler.position(project_id) {
                return Ok(Some(StartOutcome::Queued { position }));
            }
            inner.state_mut(project_id).mark_queued();
            inner.scheduler.enqueue(project_id.to_string());
            updates.extend(inner.state_update(project_id));
            updates.push(inner.queue_update());
            Ok(None)
        })?;
        if let Some(outcome) = existing {
            return Ok(outcome);
        }

        let mut report = self.try_promote().await;
        if let Some(source) = report.take_failure(project_id) {
            return Err(OrchestratorError::dispatch(
                LoopCommand::Start,
                project_id,
                source,
            ));
        }
        Ok(self.admission_outcome(project_id))
    }

    fn check_admissible(inner: &Inner, project_id: &str) -> Result<(), OrchestratorError> {
        if !inner.accepting {
            return Err(OrchestratorError::NotReady);
        }
        if inner.guard.is_pending_for(project_id) {
            return Err(OrchestratorError::PreconditionPending(
                project_id.to_string(),
            ));
        }
        Ok(())
    }

    fn admission_outcome(&self, project_id: &str) -> StartOutcome {
        let inner = self.lock();
        if let Some(position) = inner.scheduler.position(project_id) {
            StartOutcome::Queued { position }
        } else if inner.guard.is_pending_for(project_id) {
            StartOutcome::AwaitingPrecondition
        } else {
            // Admitted, possibly already finished by the time we look.
            StartOutcome::Running
        }
    }

    /// Removes a project from the queue, restoring its prior status.
    pub fn dequeue(&self, project_id: &str) -> bool {
        self.update(|inner, updates| {
            if !inner.scheduler.dequeue(project_id) {
                return false;
            }
            if let Some(state) = inner.states.get_mut(project_id)
                && state.status == LoopStatus::Queued
            {
                state.abandon_run();
            }
            updates.extend(inner.state_update(project_id));
            updates.push(inner.queue_update());
            true
        })
    }

    /// Records that a project holds a slot. Returns false when none is free.
    pub fn mark_running(&self, project_id: &str) -> bool {
        self.update(|inner, updates| {
            let admitted = inner.scheduler.mark_running(project_id);
            if admitted {
                updates.push(inner.queue_update());
            }
            admitted
        })
    }

    /// Releases a project's slot and promotes waiting projects.
    pub async fn mark_stopped(&self, project_id: &str) -> PromotionReport {
        self.update(|inner, updates| {
            if inner.scheduler.mark_stopped(project_id) {
                updates.push(inner.queue_update());
            }
        });
        self.try_promote().await
    }

    /// Starts queued projects, head first, while slots are free.
    ///
    /// A project whose start fails is dropped from the queue and not retried.
    pub async fn try_promote(&self) -> PromotionReport {
        let mut report = PromotionReport::default();
        loop {
            let reserved = self.update(|inner, updates| {
                let project_id = inner.scheduler.reserve_next()?;
                let state = inner.state_mut(&project_id);
                let snapshot = state.begin_run();
                let max_iterations = state.max_iterations;
                updates.extend(inner.state_update(&project_id));
                updates.push(inner.queue_update());
                Some((project_id, snapshot, max_iterations))
            });
            let Some((project_id, snapshot, max_iterations)) = reserved else {
                break;
            };

            info!(project_id = %project_id, max_iterations, "Admitting loop");
            match self.launch(&project_id, snapshot, max_iterations).await {
                Launch::Started => report.started.push(project_id),
                Launch::AwaitingPrecondition => report.awaiting_precondition.push(project_id),
                Launch::Failed(err) => report.failed.push((project_id, err)),
            }
        }
        report
    }

    /// Hands a reserved project to the backend.
    ///
    /// On failure the slot is released and the pre-run state restored; a
    /// precondition failure additionally raises a guard request.
    pub(crate) async fn launch(
        &self,
        project_id: &str,
        snapshot: RunSnapshot,
        max_iterations: u32,
    ) -> Launch {
        let Err(err) = self.backend.start(project_id, max_iterations).await else {
            return Launch::Started;
        };

        let message = format!("{err:#}");
        self.update(|inner, updates| {
            inner.scheduler.mark_stopped(project_id);
            inner.state_mut(project_id).restore_run(snapshot);
            updates.extend(inner.state_update(project_id));
            updates.push(inner.queue_update());

            if inner.guard.matches(&message) {
                info!(project_id, "Start refused by precondition check");
                let surfaced = inner.guard.raise(PendingGuardRequest {
                    project_id: project_id.to_string(),
                    reason: GuardReason::Precheck,
                    message,
                });
                if surfaced {
                    updates.push(inner.guard_update());
                }
                Launch::AwaitingPrecondition
            } else {
                warn!(project_id, error = %message, "Failed to start loop");
                Launch::Failed(err)
            }
        })
    }

    // --- Loop commands ---

    /// Asks the backend to pause a running loop after its current iteration.
    ///
    /// # Errors
    ///
    /// Returns an error if the project is unknown or not running, or if the
    /// backend rejects the request.
    pub async fn pause(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let status = self.lock().status_of(project_id)?;
        if !matches!(status, LoopStatus::Running | LoopStatus::Pausing) {
            return Err(OrchestratorError::NotRunning {
                project_id: project_id.to_string(),
                command: LoopCommand::Pause,
                status,
            });
        }
        self.dispatch(LoopCommand::Pause, project_id, self.backend.pause(project_id))
            .await
    }

    /// Asks the backend to resume a paused loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the project is unknown or not paused, or if the
    /// backend rejects the request.
    pub async fn resume(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let (status, holds_slot) = {
            let inner = self.lock();
            (
                inner.status_of(project_id)?,
                inner.scheduler.is_running(project_id),
            )
        };
        if !matches!(status, LoopStatus::Paused | LoopStatus::Pausing) || !holds_slot {
            return Err(OrchestratorError::NotRunning {
                project_id: project_id.to_string(),
                command: LoopCommand::Resume,
                status,
            });
        }
        self.dispatch(LoopCommand::Resume, project_id, self.backend.resume(project_id))
            .await
    }

    /// Stops a project's loop.
    ///
    /// A project that is only queued is taken off the queue locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the project is unknown or has no loop, or if the
    /// backend rejects the request.
    pub async fn stop(&self, project_id: &str) -> Result<StopOutcome, OrchestratorError> {
        if self.dequeue(project_id) {
            info!(project_id, "Removed queued project");
            return Ok(StopOutcome::Dequeued);
        }
        let (status, holds_slot) = {
            let inner = self.lock();
            (
                inner.status_of(project_id)?,
                inner.scheduler.is_running(project_id),
            )
        };
        if !status.is_active() && !holds_slot {
            return Err(OrchestratorError::NotRunning {
                project_id: project_id.to_string(),
                command: LoopCommand::Stop,
                status,
            });
        }
        self.dispatch(LoopCommand::Stop, project_id, self.backend.stop(project_id))
            .await?;
        Ok(StopOutcome::Requested)
    }

    async fn dispatch(
        &self,
        command: LoopCommand,
        project_id: &str,
        call: impl Future<Output = anyhow::Result<()>>,
    ) -> Result<(), OrchestratorError> {
        call.await.map_err(|err| {
            warn!(project_id, %command, error = %format!("{err:#}"), "Backend rejected command");
            OrchestratorError::dispatch(command, project_id, err)
        })
    }

    /// Asks the backend whether a loop is alive, treating errors as "no".
    async fn loop_alive(&self, project_id: &str) -> bool {
        match self.backend.get_status(project_id).await {
            Ok(alive) => alive,
            Err(err) => {
                let err = OrchestratorError::dispatch(LoopCommand::GetStatus, project_id, err);
                warn!(error = %err, "Treating loop as exited");
                false
            }
        }
    }

    // --- Precondition guard ---

    /// Resolves the surfaced precondition request.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NoPendingGuard`] if nothing is pending,
    /// or a dispatch error if the backend call for the decision fails. In
    /// the latter case the request stays surfaced.
    pub async fn resolve_guard(
        &self,
        decision: GuardDecision,
    ) -> Result<GuardResolution, OrchestratorError> {
        let request = self
            .update(|inner, updates| {
                let taken = inner.guard.take_current();
                if taken.is_some() {
                    updates.push(inner.guard_update());
                }
                taken
            })
            .ok_or(OrchestratorError::NoPendingGuard)?;
        let project_id = request.project_id.clone();
        info!(project_id = %project_id, ?decision, reason = ?request.reason, "Resolving precondition request");

        let prepared = match decision {
            GuardDecision::Cancel => return Ok(self.cancel_guarded(&request).await),
            GuardDecision::Init => {
                self.dispatch(
                    LoopCommand::InitPrecondition,
                    &project_id,
                    self.backend.init_precondition(&project_id),
                )
                .await
            }
            GuardDecision::Skip => {
                self.dispatch(
                    LoopCommand::SetPermanentSkip,
                    &project_id,
                    self.backend.set_permanent_skip(&project_id, true),
                )
                .await
            }
        };
        if let Err(err) = prepared {
            self.update(|inner, updates| {
                inner.guard.reinstate(request);
                updates.push(inner.guard_update());
            });
            return Err(err);
        }

        match request.reason {
            GuardReason::Precheck => Ok(GuardResolution::Restarted(
                self.enqueue(&project_id).await?,
            )),
            GuardReason::Runtime => {
                if self.loop_alive(&project_id).await {
                    self.dispatch(
                        LoopCommand::Resume,
                        &project_id,
                        self.backend.resume(&project_id),
                    )
                    .await?;
                    return Ok(GuardResolution::Resumed);
                }
                Ok(GuardResolution::Restarted(
                    self.restart_in_slot(&project_id).await?,
                ))
            }
        }
    }

    async fn cancel_guarded(&self, request: &PendingGuardRequest) -> GuardResolution {
        let project_id = request.project_id.as_str();
        if request.reason == GuardReason::Precheck {
            return GuardResolution::Cancelled;
        }
        if self.loop_alive(project_id).await {
            // The Stopped event releases the slot.
            if self
                .dispatch(LoopCommand::Stop, project_id, self.backend.stop(project_id))
                .await
                .is_ok()
            {
                return GuardResolution::Cancelled;
            }
        }
        let released = self.update(|inner, updates| {
            let released = inner.scheduler.mark_stopped(project_id);
            inner.state_mut(project_id).abandon_run();
            updates.extend(inner.state_update(project_id));
            updates.push(inner.queue_update());
            released
        });
        if released {
            self.try_promote().await;
        }
        GuardResolution::Cancelled
    }

    /// Starts a new run for a project that still holds its slot.
    async fn restart_in_slot(&self, project_id: &str) -> Result<StartOutcome, OrchestratorError> {
        let reserved = self.update(|inner, updates| {
            if !inner.scheduler.is_running(project_id) {
                return None;
            }
            let state = inner.state_mut(project_id);
            let snapshot = state.begin_run();
            let max_iterations = state.max_iterations;
            updates.extend(inner.state_update(project_id));
            Some((snapshot, max_iterations))
        });
        let Some((snapshot, max_iterations)) = reserved else {
            return self.enqueue(project_id).await;
        };

        match self.launch(project_id, snapshot, max_iterations).await {
            Launch::Started => Ok(StartOutcome::Running),
            Launch::AwaitingPrecondition => {
                self.try_promote().await;
                Ok(StartOutcome::AwaitingPrecondition)
            }
            Launch::Failed(err) => {
                self.try_promote().await;
                Err(OrchestratorError::dispatch(
                    LoopCommand::Start,
                    project_id,
                    err,
                ))
            }
        }
    }
}
