//! Errors returned by the orchestrator API.

use thiserror::Error;

use crate::core::events::LoopCommand;
use crate::core::state::LoopStatus;
use crate::core::ProjectId;

/// Failures reported synchronously to the caller of an orchestrator command.
///
/// None of these change project state.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("startup recovery has not run yet; new work is not accepted")]
    NotReady,

    #[error("unknown project: {0}")]
    UnknownProject(ProjectId),

    #[error("project {project_id} is already {status}")]
    AlreadyActive {
        project_id: ProjectId,
        status: LoopStatus,
    },

    #[error("project {project_id} cannot be started while {status}")]
    InvalidStatus {
        project_id: ProjectId,
        status: LoopStatus,
    },

    #[error("project {project_id} has no loop to {command} ({status})")]
    NotRunning {
        project_id: ProjectId,
        command: LoopCommand,
        status: LoopStatus,
    },

    #[error("project {0} is waiting on a precondition decision")]
    PreconditionPending(ProjectId),

    #[error("no precondition request is pending")]
    NoPendingGuard,

    #[error("failed to {command} project {project_id}: {source:#}")]
    Dispatch {
        command: LoopCommand,
        project_id: ProjectId,
        #[source]
        source: anyhow::Error,
    },
}

impl OrchestratorError {
    pub(crate) fn dispatch(
        command: LoopCommand,
        project_id: impl Into<ProjectId>,
        source: anyhow::Error,
    ) -> Self {
        Self::Dispatch {
            command,
            project_id: project_id.into(),
            source,
        }
    }
}
