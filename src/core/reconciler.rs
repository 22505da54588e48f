//! Event reconciliation.
//!
//! Applies backend events to project state and derives the side effects:
//! precondition interception, notifications and slot release.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::core::events::LoopEvent;
use crate::core::guard::{GuardReason, PendingGuardRequest};
use crate::core::machine::{Transition, drop_reason};
use crate::core::orchestrator::{Notification, Orchestrator, OrchestratorUpdate};
use crate::core::state::{LoopStatus, ProjectLoopState};

/// Buffer size for the backend event channel.
pub const EVENT_CHANNEL_SIZE: usize = 1000;

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Passed through the state machine.
    Applied(Transition),
    /// Error recognized as a precondition failure and turned into a guard
    /// request. The project's status is unchanged.
    PreconditionIntercepted,
}

impl Orchestrator {
    /// Applies one backend event.
    ///
    /// Events for unknown projects create a `ready` state first. A terminal
    /// transition releases the project's slot and promotes the queue.
    pub async fn handle_event(&self, event: LoopEvent) -> Reconciliation {
        let project_id = event.project_id().to_string();
        let (outcome, released) = self.update(|inner, updates| {
            if let LoopEvent::Error { error, .. } = &event
                && inner.guard.matches(error)
            {
                // A late error from a run that moved on or ended is not a prompt.
                if let Some(reason) = drop_reason(inner.state_mut(&project_id), &event) {
                    debug!(project_id = %project_id, ?reason, "Dropped precondition error");
                    return (
                        Reconciliation::Applied(Transition::Dropped(reason)),
                        false,
                    );
                }
                info!(project_id = %project_id, "Loop reported a precondition failure");
                let surfaced = inner.guard.raise(PendingGuardRequest {
                    project_id: project_id.clone(),
                    reason: GuardReason::Runtime,
                    message: error.clone(),
                });
                if surfaced {
                    updates.push(inner.guard_update());
                }
                return (Reconciliation::PreconditionIntercepted, false);
            }

            let state = inner.state_mut(&project_id);
            let transition = self.machine.apply(state, &event, Utc::now());
            let mut released = false;
            match transition {
                Transition::Dropped(reason) => {
                    debug!(project_id = %project_id, event = event.kind(), ?reason, "Dropped event");
                }
                Transition::Recorded => {
                    if let LoopEvent::Output { .. } = event {
                        if let Some(entry) = state.logs.back() {
                            updates.push(OrchestratorUpdate::Log {
                                project_id: project_id.clone(),
                                entry: entry.clone(),
                            });
                        }
                    } else {
                        updates.push(OrchestratorUpdate::State(state.clone()));
                    }
                }
                Transition::Changed { from, to } => {
                    let notification = notification_for(state);
                    updates.push(OrchestratorUpdate::State(state.clone()));
                    if to.is_terminal() {
                        info!(project_id = %project_id, %from, %to, iteration = state.current_iteration, "Loop finished");
                        released = inner.scheduler.mark_stopped(&project_id);
                        if released {
                            updates.push(inner.queue_update());
                        }
                    } else {
                        debug!(project_id = %project_id, %from, %to, "Status changed");
                    }
                    updates.extend(notification.map(OrchestratorUpdate::Notification));
                }
            }
            (Reconciliation::Applied(transition), released)
        });

        if released {
            self.try_promote().await;
        }
        outcome
    }

    /// Consumes backend events until the channel closes or shutdown is signaled.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<LoopEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                () = wait_for_shutdown(&mut shutdown_rx) => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
            }
        }
        debug!("Event loop stopped");
    }
}

fn notification_for(state: &ProjectLoopState) -> Option<Notification> {
    let project_id = state.project_id.clone();
    match state.status {
        LoopStatus::Done => Some(Notification::Completed {
            project_id,
            summary: state.summary.clone(),
        }),
        LoopStatus::Partial => Some(Notification::MaxIterationsReached {
            project_id,
            iteration: state.current_iteration,
        }),
        LoopStatus::Failed => Some(Notification::Failed {
            project_id,
            error: state.last_error.clone().unwrap_or_default(),
        }),
        _ => None,
    }
}

/// Resolves once the watch value is true or its sender is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
