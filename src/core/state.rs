//! Per-project loop state.
//!
//! [`ProjectLoopState`] is the authoritative snapshot of one project's
//! execution progress. It carries no behavior beyond bookkeeping helpers;
//! transitions are owned by [`crate::core::LoopStateMachine`].

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ProjectId;
use crate::core::sanitize::sanitize_log;

/// Default number of log entries retained per project.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Status of a project's agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopStatus {
    /// Task configured, not running. Owned by the project store.
    #[default]
    Ready,
    /// Waiting for a free admission slot.
    Queued,
    /// Loop executing.
    Running,
    /// Pause requested, waiting for the current iteration to finish.
    Pausing,
    /// Loop suspended between iterations.
    Paused,
    /// Completion signal observed.
    Done,
    /// Iteration ceiling reached without completion.
    Partial,
    /// Loop ended with an execution error.
    Failed,
    /// Loop stopped by the user.
    Cancelled,
    /// Prompt is still being designed. Owned by the brainstorm flow.
    Brainstorming,
}

impl LoopStatus {
    /// Returns the lowercase wire name of the status.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Brainstorming => "brainstorming",
        }
    }

    /// Returns true if a run has ended in this status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Partial | Self::Failed | Self::Cancelled
        )
    }

    /// Returns true if the status is owned outside the orchestrator.
    #[must_use]
    pub const fn is_external(&self) -> bool {
        matches!(self, Self::Ready | Self::Brainstorming)
    }

    /// Returns true while the project holds or awaits an admission slot.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Running | Self::Pausing | Self::Paused
        )
    }

    /// Parses a lowercase status name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let status = match name {
            "ready" => Self::Ready,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "pausing" => Self::Pausing,
            "paused" => Self::Paused,
            "done" => Self::Done,
            "partial" => Self::Partial,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "brainstorming" => Self::Brainstorming,
            _ => return None,
        };
        Some(status)
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

/// One line of loop output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Iteration that produced the line.
    pub iteration: u32,
    /// Line text, with secrets redacted.
    pub content: String,
    /// Whether the line came from stderr.
    pub is_stderr: bool,
    /// When the line was recorded.
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Creates a log entry, redacting secrets from `content`.
    #[must_use]
    pub fn new(iteration: u32, content: &str, is_stderr: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            iteration,
            content: sanitize_log(content),
            is_stderr,
            timestamp,
        }
    }
}

/// Run bookkeeping captured before a start attempt, restored if it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    current_iteration: u32,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    summary: Option<String>,
}

/// Authoritative execution snapshot of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectLoopState {
    /// Opaque project identifier.
    pub project_id: ProjectId,
    /// Current loop status.
    pub status: LoopStatus,
    /// Last iteration observed in the current run.
    pub current_iteration: u32,
    /// Iteration ceiling for the task.
    pub max_iterations: u32,
    /// Most recent output lines, oldest first.
    pub logs: VecDeque<LogEntry>,
    /// Error of the most recent failed run.
    pub last_error: Option<String>,
    /// First iteration start of the current run.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal event of the current run.
    pub ended_at: Option<DateTime<Utc>>,
    /// Digest computed when the run finished.
    pub summary: Option<String>,
    /// Status to fall back to when a queued or in-flight run is abandoned.
    #[serde(skip)]
    pub(crate) status_before_run: LoopStatus,
    #[serde(skip)]
    log_capacity: usize,
}

impl ProjectLoopState {
    /// Creates a `ready` state for a project.
    #[must_use]
    pub fn new(project_id: impl Into<ProjectId>, max_iterations: u32, log_capacity: usize) -> Self {
        Self {
            project_id: project_id.into(),
            status: LoopStatus::Ready,
            current_iteration: 0,
            max_iterations: max_iterations.max(1),
            logs: VecDeque::new(),
            last_error: None,
            started_at: None,
            ended_at: None,
            summary: None,
            status_before_run: LoopStatus::Ready,
            log_capacity: log_capacity.max(1),
        }
    }

    /// Appends a log entry, evicting the oldest once the buffer is full.
    pub fn push_log(&mut self, entry: LogEntry) {
        while self.logs.len() >= self.log_capacity {
            self.logs.pop_front();
        }
        self.logs.push_back(entry);
    }

    /// Marks the project as waiting for admission.
    pub(crate) fn mark_queued(&mut self) {
        if !self.status.is_active() {
            self.status_before_run = self.status;
        }
        self.status = LoopStatus::Queued;
    }

    /// Returns to the status held before the project was queued.
    pub(crate) fn abandon_run(&mut self) {
        self.status = self.status_before_run;
    }

    /// Resets run bookkeeping for a new run and marks it running.
    ///
    /// Logs are kept. Returns what was cleared so a failed start can undo it.
    pub(crate) fn begin_run(&mut self) -> RunSnapshot {
        if !self.status.is_active() {
            self.status_before_run = self.status;
        }
        let snapshot = RunSnapshot {
            current_iteration: self.current_iteration,
            last_error: self.last_error.take(),
            started_at: self.started_at.take(),
            ended_at: self.ended_at.take(),
            summary: self.summary.take(),
        };
        self.current_iteration = 0;
        self.status = LoopStatus::Running;
        snapshot
    }

    /// Undoes [`Self::begin_run`] after a start that never reached the backend loop.
    pub(crate) fn restore_run(&mut self, snapshot: RunSnapshot) {
        self.current_iteration = snapshot.current_iteration;
        self.last_error = snapshot.last_error;
        self.started_at = snapshot.started_at;
        self.ended_at = snapshot.ended_at;
        self.summary = snapshot.summary;
        self.status = self.status_before_run;
    }

    /// Returns how long the current or most recent run took.
    ///
    /// In-flight runs are measured against `now`.
    #[must_use]
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.ended_at.unwrap_or(now);
        Some(end - started)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn entry(iteration: u32, content: &str) -> LogEntry {
        LogEntry::new(iteration, content, false, Utc::now())
    }

    #[test]
    fn new_state_is_ready_and_empty() {
        let state = ProjectLoopState::new("p1", 10, DEFAULT_LOG_CAPACITY);

        assert_eq!(state.status, LoopStatus::Ready);
        assert_eq!(state.current_iteration, 0);
        assert_eq!(state.max_iterations, 10);
        assert!(state.logs.is_empty());
        assert!(state.summary.is_none());
    }

    #[test]
    fn max_iterations_is_at_least_one() {
        let state = ProjectLoopState::new("p1", 0, DEFAULT_LOG_CAPACITY);
        assert_eq!(state.max_iterations, 1);
    }

    #[test]
    fn push_log_evicts_oldest_entries() {
        let mut state = ProjectLoopState::new("p1", 10, 3);
        for i in 1..=5 {
            state.push_log(entry(i, &format!("line {i}")));
        }

        let lines: Vec<&str> = state.logs.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(lines, vec!["line 3", "line 4", "line 5"]);
    }

    #[test]
    fn log_buffer_holds_a_thousand_entries_by_default() {
        let mut state = ProjectLoopState::new("p1", 10, DEFAULT_LOG_CAPACITY);
        for i in 0..1200 {
            state.push_log(entry(1, &i.to_string()));
        }

        assert_eq!(state.logs.len(), 1000);
        assert_eq!(state.logs.front().unwrap().content, "200");
    }

    #[test]
    fn log_entries_are_sanitized() {
        let e = entry(1, "export OPENAI_API_KEY=abc123");
        assert!(e.content.contains("[REDACTED]"));
        assert!(!e.content.contains("abc123"));
    }

    #[test]
    fn begin_run_resets_run_fields_but_keeps_logs() {
        let mut state = ProjectLoopState::new("p1", 10, DEFAULT_LOG_CAPACITY);
        state.status = LoopStatus::Failed;
        state.current_iteration = 4;
        state.last_error = Some("boom".to_string());
        state.started_at = Some(Utc::now());
        state.ended_at = Some(Utc::now());
        state.summary = Some("old".to_string());
        state.push_log(entry(4, "kept"));

        state.begin_run();

        assert_eq!(state.status, LoopStatus::Running);
        assert_eq!(state.current_iteration, 0);
        assert!(state.last_error.is_none());
        assert!(state.started_at.is_none());
        assert!(state.ended_at.is_none());
        assert!(state.summary.is_none());
        assert_eq!(state.logs.len(), 1);
    }

    #[test]
    fn restore_run_undoes_begin_run() {
        let mut state = ProjectLoopState::new("p1", 10, DEFAULT_LOG_CAPACITY);
        state.status = LoopStatus::Done;
        state.current_iteration = 7;
        state.summary = Some("finished".to_string());

        state.mark_queued();
        let snapshot = state.begin_run();
        state.restore_run(snapshot);

        assert_eq!(state.status, LoopStatus::Done);
        assert_eq!(state.current_iteration, 7);
        assert_eq!(state.summary.as_deref(), Some("finished"));
    }

    #[test]
    fn mark_queued_then_abandon_returns_to_prior_status() {
        let mut state = ProjectLoopState::new("p1", 10, DEFAULT_LOG_CAPACITY);
        state.status = LoopStatus::Partial;

        state.mark_queued();
        assert_eq!(state.status, LoopStatus::Queued);

        state.abandon_run();
        assert_eq!(state.status, LoopStatus::Partial);
    }

    #[test]
    fn elapsed_is_none_before_first_iteration() {
        let state = ProjectLoopState::new("p1", 10, DEFAULT_LOG_CAPACITY);
        assert!(state.elapsed(Utc::now()).is_none());
    }

    #[test]
    fn elapsed_uses_end_time_when_finished() {
        let mut state = ProjectLoopState::new("p1", 10, DEFAULT_LOG_CAPACITY);
        let start = Utc::now();
        state.started_at = Some(start);
        state.ended_at = Some(start + Duration::seconds(90));

        let later = start + Duration::hours(1);
        assert_eq!(state.elapsed(later), Some(Duration::seconds(90)));
    }

    #[test]
    fn elapsed_uses_now_while_in_flight() {
        let mut state = ProjectLoopState::new("p1", 10, DEFAULT_LOG_CAPACITY);
        let start = Utc::now();
        state.started_at = Some(start);

        assert_eq!(
            state.elapsed(start + Duration::seconds(5)),
            Some(Duration::seconds(5))
        );
    }

    #[test]
    fn status_classification() {
        assert!(LoopStatus::Done.is_terminal());
        assert!(LoopStatus::Partial.is_terminal());
        assert!(LoopStatus::Failed.is_terminal());
        assert!(LoopStatus::Cancelled.is_terminal());
        assert!(!LoopStatus::Paused.is_terminal());

        assert!(LoopStatus::Queued.is_active());
        assert!(LoopStatus::Paused.is_active());
        assert!(!LoopStatus::Ready.is_active());

        assert!(LoopStatus::Brainstorming.is_external());
        assert!(LoopStatus::Ready.is_external());
    }

    #[test]
    fn status_names_round_trip() {
        let all = [
            LoopStatus::Ready,
            LoopStatus::Queued,
            LoopStatus::Running,
            LoopStatus::Pausing,
            LoopStatus::Paused,
            LoopStatus::Done,
            LoopStatus::Partial,
            LoopStatus::Failed,
            LoopStatus::Cancelled,
            LoopStatus::Brainstorming,
        ];
        for status in all {
            assert_eq!(LoopStatus::from_name(status.name()), Some(status));
        }
        assert_eq!(LoopStatus::from_name("unknown"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&LoopStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}
