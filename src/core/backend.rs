//! Execution backend abstraction.
//!
//! The backend owns the agent CLI processes. The orchestrator only sends it
//! commands and consumes the [`crate::core::LoopEvent`]s it pushes back on a
//! shared channel.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::ProjectId;
use crate::core::state::LoopStatus;

/// A loop the backend found mid-execution from a previous session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptedTask {
    pub project_id: ProjectId,
    pub project_name: String,
    /// Last iteration the backend recorded.
    pub iteration: u32,
    /// Persisted status at the time of interruption.
    pub status: LoopStatus,
}

/// Trait for loop execution backends.
///
/// Every call is fire-and-forget from the state's point of view: a
/// successful `start` or `pause` means the request was accepted, and the
/// resulting status change arrives later as an event.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Starts a loop for the project.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop could not be started. A precondition
    /// failure is reported through the error text.
    async fn start(&self, project_id: &str, max_iterations: u32) -> Result<()>;

    /// Requests a pause after the current iteration.
    ///
    /// # Errors
    ///
    /// Returns an error if no loop is running for the project.
    async fn pause(&self, project_id: &str) -> Result<()>;

    /// Resumes a paused loop.
    ///
    /// # Errors
    ///
    /// Returns an error if no loop is running for the project.
    async fn resume(&self, project_id: &str) -> Result<()>;

    /// Stops a loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop request could not be delivered.
    async fn stop(&self, project_id: &str) -> Result<()>;

    /// Returns true if a loop is currently alive for the project.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be queried.
    async fn get_status(&self, project_id: &str) -> Result<bool>;

    /// Lists loops interrupted by a previous shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted loop records could not be read.
    async fn list_interrupted(&self) -> Result<Vec<InterruptedTask>>;

    /// Discards the persisted record of an interrupted loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be cleared.
    async fn cancel_interrupted(&self, project_id: &str) -> Result<()>;

    /// Establishes the precondition for the project (e.g. `git init`).
    ///
    /// # Errors
    ///
    /// Returns an error if the precondition could not be established.
    async fn init_precondition(&self, project_id: &str) -> Result<()>;

    /// Persists a per-project override that bypasses the precondition check.
    ///
    /// # Errors
    ///
    /// Returns an error if the override could not be saved.
    async fn set_permanent_skip(&self, project_id: &str, skip: bool) -> Result<()>;

    /// Returns the display name for this backend.
    fn name(&self) -> &'static str;
}
