//! Messages exchanged with the execution backend.

use serde::{Deserialize, Serialize};

use crate::core::ProjectId;

/// Progress signal pushed by the execution backend.
///
/// All loops share one channel; every event names its project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LoopEvent {
    #[serde(rename_all = "camelCase")]
    IterationStart { project_id: ProjectId, iteration: u32 },
    #[serde(rename_all = "camelCase")]
    Output {
        project_id: ProjectId,
        iteration: u32,
        content: String,
        is_stderr: bool,
    },
    #[serde(rename_all = "camelCase")]
    Pausing { project_id: ProjectId, iteration: u32 },
    #[serde(rename_all = "camelCase")]
    Paused { project_id: ProjectId, iteration: u32 },
    #[serde(rename_all = "camelCase")]
    Resumed { project_id: ProjectId, iteration: u32 },
    #[serde(rename_all = "camelCase")]
    Completed { project_id: ProjectId, iteration: u32 },
    #[serde(rename_all = "camelCase")]
    MaxIterationsReached { project_id: ProjectId, iteration: u32 },
    #[serde(rename_all = "camelCase")]
    Error {
        project_id: ProjectId,
        iteration: u32,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    Stopped { project_id: ProjectId },
}

impl LoopEvent {
    /// Returns the project the event belongs to.
    #[must_use]
    pub fn project_id(&self) -> &str {
        match self {
            Self::IterationStart { project_id, .. }
            | Self::Output { project_id, .. }
            | Self::Pausing { project_id, .. }
            | Self::Paused { project_id, .. }
            | Self::Resumed { project_id, .. }
            | Self::Completed { project_id, .. }
            | Self::MaxIterationsReached { project_id, .. }
            | Self::Error { project_id, .. }
            | Self::Stopped { project_id } => project_id,
        }
    }

    /// Returns the iteration the event refers to, if it carries one.
    #[must_use]
    pub const fn iteration(&self) -> Option<u32> {
        match self {
            Self::IterationStart { iteration, .. }
            | Self::Output { iteration, .. }
            | Self::Pausing { iteration, .. }
            | Self::Paused { iteration, .. }
            | Self::Resumed { iteration, .. }
            | Self::Completed { iteration, .. }
            | Self::MaxIterationsReached { iteration, .. }
            | Self::Error { iteration, .. } => Some(*iteration),
            Self::Stopped { .. } => None,
        }
    }

    /// Returns the event's wire name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::IterationStart { .. } => "iterationStart",
            Self::Output { .. } => "output",
            Self::Pausing { .. } => "pausing",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::Completed { .. } => "completed",
            Self::MaxIterationsReached { .. } => "maxIterationsReached",
            Self::Error { .. } => "error",
            Self::Stopped { .. } => "stopped",
        }
    }
}

/// Calls the orchestrator issues to the execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopCommand {
    Start,
    Pause,
    Resume,
    Stop,
    GetStatus,
    CancelInterrupted,
    InitPrecondition,
    SetPermanentSkip,
}

impl LoopCommand {
    /// Returns the command name used in error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::GetStatus => "get status",
            Self::CancelInterrupted => "cancel interrupted",
            Self::InitPrecondition => "init precondition",
            Self::SetPermanentSkip => "set permanent skip",
        }
    }
}

impl std::fmt::Display for LoopCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
