//! Admission control for concurrently running loops.

use std::collections::{BTreeSet, VecDeque};

use serde::Serialize;

use crate::core::ProjectId;

/// Snapshot of queue occupancy for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub running_count: usize,
    pub available_slots: usize,
}

/// FIFO queue of waiting projects plus the bounded set of running ones.
///
/// A project is never both queued and running. The running set never grows
/// beyond `max_concurrent`.
#[derive(Debug, Clone)]
pub struct AdmissionScheduler {
    max_concurrent: usize,
    queue: VecDeque<ProjectId>,
    running: BTreeSet<ProjectId>,
}

impl AdmissionScheduler {
    /// Creates a scheduler admitting at most `max_concurrent` loops (at least one).
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            queue: VecDeque::new(),
            running: BTreeSet::new(),
        }
    }

    /// Returns the concurrency limit.
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Appends a project to the queue.
    ///
    /// Returns false if it is already queued or running.
    pub fn enqueue(&mut self, project_id: ProjectId) -> bool {
        if self.is_queued(&project_id) || self.running.contains(&project_id) {
            return false;
        }
        self.queue.push_back(project_id);
        true
    }

    /// Removes a project from the queue. Returns false if it was not queued.
    pub fn dequeue(&mut self, project_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|id| id != project_id);
        self.queue.len() != before
    }

    /// Adds a project to the running set, taking it out of the queue.
    ///
    /// Refused when no slot is free, unless the project is already running.
    pub fn mark_running(&mut self, project_id: &str) -> bool {
        if self.running.contains(project_id) {
            return true;
        }
        if !self.has_capacity() {
            return false;
        }
        self.dequeue(project_id);
        self.running.insert(project_id.to_string());
        true
    }

    /// Frees a project's slot. Returns false if it was not running.
    pub fn mark_stopped(&mut self, project_id: &str) -> bool {
        self.running.remove(project_id)
    }

    /// Moves the head of the queue into the running set if a slot is free.
    ///
    /// The slot is held from this point, so a start attempt made after
    /// releasing the caller's lock cannot be double-admitted.
    pub fn reserve_next(&mut self) -> Option<ProjectId> {
        if !self.has_capacity() {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.running.insert(next.clone());
        Some(next)
    }

    /// Returns true if another loop may be admitted.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.running.len() < self.max_concurrent
    }

    #[must_use]
    pub fn is_queued(&self, project_id: &str) -> bool {
        self.queue.iter().any(|id| id == project_id)
    }

    #[must_use]
    pub fn is_running(&self, project_id: &str) -> bool {
        self.running.contains(project_id)
    }

    /// Returns the 1-based queue position of a project.
    #[must_use]
    pub fn position(&self, project_id: &str) -> Option<usize> {
        self.queue
            .iter()
            .position(|id| id == project_id)
            .map(|index| index + 1)
    }

    /// Returns queued projects, head first.
    #[must_use]
    pub fn queued(&self) -> Vec<ProjectId> {
        self.queue.iter().cloned().collect()
    }

    /// Returns running projects in id order.
    #[must_use]
    pub fn running(&self) -> Vec<ProjectId> {
        self.running.iter().cloned().collect()
    }

    #[must_use]
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.queue.len(),
            running_count: self.running.len(),
            available_slots: self.max_concurrent.saturating_sub(self.running.len()),
        }
    }
}
