//! Core business logic for loop orchestration.
//!
//! The leaves ([`state`], [`machine`], [`scheduler`], [`guard`]) are plain
//! data structures with no I/O. [`Orchestrator`] ties them together behind a
//! single lock and talks to an [`ExecutionBackend`].

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod machine;
pub mod orchestrator;
pub mod reconciler;
pub mod recovery;
pub mod sanitize;
pub mod scheduler;
pub mod simulated;
pub mod state;
pub mod summary;

#[cfg(test)]
mod tests;

/// Opaque project identifier.
pub type ProjectId = String;

pub use backend::{ExecutionBackend, InterruptedTask};
pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
pub use events::{LoopCommand, LoopEvent};
pub use guard::{GuardDecision, GuardReason, PendingGuardRequest, PreconditionGuard};
pub use machine::{DropReason, LoopStateMachine, Transition};
pub use orchestrator::{
    GuardResolution, Notification, Orchestrator, OrchestratorUpdate, PromotionReport,
    StartOutcome, StopOutcome, SubscriptionId,
};
pub use reconciler::{EVENT_CHANNEL_SIZE, Reconciliation};
pub use recovery::{RecoveryCoordinator, RecoveryDecision};
pub use scheduler::{AdmissionScheduler, QueueStatus};
pub use simulated::{SimulatedBackend, SimulatedProject};
pub use state::{LogEntry, LoopStatus, ProjectLoopState};
