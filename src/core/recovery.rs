//! Startup recovery of loops interrupted by a previous shutdown.

use tracing::{info, warn};

use crate::core::backend::{ExecutionBackend, InterruptedTask};
use crate::core::error::OrchestratorError;
use crate::core::events::LoopCommand;
use crate::core::orchestrator::Orchestrator;

/// User decision for an interrupted loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Keep the project and select it so the user can resume it by hand.
    Recover,
    /// Have the backend discard the interrupted loop.
    Cancel,
}

/// Interrupted loops awaiting a decision.
///
/// Nothing here restarts a loop.
#[derive(Debug, Clone, Default)]
pub struct RecoveryCoordinator {
    pending: Vec<InterruptedTask>,
}

impl RecoveryCoordinator {
    /// Lists interrupted loops. A listing failure counts as none.
    pub async fn discover(backend: &dyn ExecutionBackend) -> Self {
        let pending = match backend.list_interrupted().await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "Failed to list interrupted loops");
                Vec::new()
            }
        };
        if !pending.is_empty() {
            info!(count = pending.len(), "Found interrupted loops");
        }
        Self { pending }
    }

    /// Returns the loops still awaiting a decision.
    #[must_use]
    pub fn pending(&self) -> &[InterruptedTask] {
        &self.pending
    }

    /// Returns true once every interrupted loop has been decided.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies a decision to one interrupted loop.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::UnknownProject`] if the project is not
    /// pending, or a dispatch error if the backend fails to cancel it. The
    /// loop stays pending on error.
    pub async fn decide(
        &mut self,
        orchestrator: &Orchestrator,
        project_id: &str,
        decision: RecoveryDecision,
    ) -> Result<(), OrchestratorError> {
        let index = self
            .pending
            .iter()
            .position(|task| task.project_id == project_id)
            .ok_or_else(|| OrchestratorError::UnknownProject(project_id.to_string()))?;

        match decision {
            RecoveryDecision::Recover => {
                orchestrator.seed_recovered(&self.pending[index]);
            }
            RecoveryDecision::Cancel => {
                orchestrator
                    .backend
                    .cancel_interrupted(project_id)
                    .await
                    .map_err(|err| {
                        warn!(project_id, error = %format!("{err:#}"), "Failed to cancel interrupted loop");
                        OrchestratorError::dispatch(LoopCommand::CancelInterrupted, project_id, err)
                    })?;
            }
        }
        info!(project_id, ?decision, "Interrupted loop resolved");
        self.pending.remove(index);
        Ok(())
    }

    /// Applies the same decision to every pending loop.
    ///
    /// # Errors
    ///
    /// Returns the first failure; loops after it stay pending.
    pub async fn decide_all(
        &mut self,
        orchestrator: &Orchestrator,
        decision: RecoveryDecision,
    ) -> Result<(), OrchestratorError> {
        let ids: Vec<_> = self
            .pending
            .iter()
            .map(|task| task.project_id.clone())
            .collect();
        for project_id in ids {
            self.decide(orchestrator, &project_id, decision).await?;
        }
        Ok(())
    }
}

impl Orchestrator {
    /// Discovers interrupted loops, then opens admission for new work.
    ///
    /// Only the first call lists interrupted loops; later calls return an
    /// empty coordinator.
    pub async fn run_recovery(&self) -> RecoveryCoordinator {
        if self.is_accepting() {
            return RecoveryCoordinator::default();
        }
        let coordinator = RecoveryCoordinator::discover(self.backend.as_ref()).await;
        if !self.open_admission() {
            return RecoveryCoordinator::default();
        }
        info!(
            interrupted = coordinator.pending().len(),
            "Recovery surfaced; accepting new work"
        );
        coordinator
    }
}
