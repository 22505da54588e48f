//! Orchestrator configuration.

use crate::core::state::DEFAULT_LOG_CAPACITY;

/// Default number of loops allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default iteration ceiling for a task.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// Line the agent prints when it considers the task finished.
pub const DEFAULT_COMPLETION_SIGNAL: &str = "<done>COMPLETE</done>";

/// Text identifying an untrusted-repository refusal from the CLI.
pub const DEFAULT_PRECONDITION_MARKER: &str = "skip-git-repo-check";

/// Tunables for [`crate::core::Orchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Maximum number of simultaneously running loops.
    pub max_concurrent: usize,
    /// Iteration ceiling for projects without their own.
    pub default_max_iterations: u32,
    /// Completion sentinel, excluded from summaries.
    pub completion_signal: String,
    /// Substring of error text that marks a precondition failure.
    pub precondition_marker: String,
    /// Log entries kept per project.
    pub log_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            completion_signal: DEFAULT_COMPLETION_SIGNAL.to_string(),
            precondition_marker: DEFAULT_PRECONDITION_MARKER.to_string(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    /// Returns the default configuration with a different concurrency limit.
    #[must_use]
    pub fn with_max_concurrent(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Self::default()
        }
    }
}
