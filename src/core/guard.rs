//! Precondition guard.
//!
//! Holds start attempts that failed a structural precondition (the CLI refusing
//! to run outside a trusted repository) until the user decides what to do.
//! One request is surfaced at a time; requests from other projects wait
//! behind it in arrival order.

use std::collections::VecDeque;

use serde::Serialize;

use crate::core::ProjectId;

/// Where the precondition failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardReason {
    /// The start call itself was refused.
    Precheck,
    /// A running iteration reported the failure.
    Runtime,
}

/// A start attempt waiting for a user decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingGuardRequest {
    pub project_id: ProjectId,
    pub reason: GuardReason,
    /// Error text that triggered the request.
    pub message: String,
}

/// User decision for a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// Establish the precondition, then retry.
    Init,
    /// Persist a per-project override, then retry.
    Skip,
    /// Drop the attempt.
    Cancel,
}

/// Detects precondition failures and tracks pending requests.
#[derive(Debug, Clone)]
pub struct PreconditionGuard {
    marker: String,
    current: Option<PendingGuardRequest>,
    waiting: VecDeque<PendingGuardRequest>,
}

impl PreconditionGuard {
    /// Creates a guard recognizing error text containing `marker`.
    #[must_use]
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into().to_lowercase(),
            current: None,
            waiting: VecDeque::new(),
        }
    }

    /// Returns true if `text` reports a precondition failure.
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        !self.marker.is_empty() && text.to_lowercase().contains(&self.marker)
    }

    /// Records a request.
    ///
    /// Returns true if it became the surfaced request. A project already
    /// pending is not added twice.
    pub fn raise(&mut self, request: PendingGuardRequest) -> bool {
        if self.is_pending_for(&request.project_id) {
            return false;
        }
        if self.current.is_none() {
            self.current = Some(request);
            return true;
        }
        self.waiting.push_back(request);
        false
    }

    /// Returns the surfaced request.
    #[must_use]
    pub fn current(&self) -> Option<&PendingGuardRequest> {
        self.current.as_ref()
    }

    /// Removes the surfaced request and surfaces the next waiting one.
    pub fn take_current(&mut self) -> Option<PendingGuardRequest> {
        let taken = self.current.take();
        self.current = self.waiting.pop_front();
        taken
    }

    /// Puts a taken request back in front, ahead of anything surfaced since.
    pub fn reinstate(&mut self, request: PendingGuardRequest) {
        if self.is_pending_for(&request.project_id) {
            return;
        }
        if let Some(current) = self.current.replace(request) {
            self.waiting.push_front(current);
        }
    }

    /// Returns true if the project has a surfaced or waiting request.
    #[must_use]
    pub fn is_pending_for(&self, project_id: &str) -> bool {
        self.current
            .iter()
            .chain(self.waiting.iter())
            .any(|request| request.project_id == project_id)
    }

    /// Number of requests waiting behind the surfaced one.
    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }
}
