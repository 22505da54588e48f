//! Loop state machine.
//!
//! Applies a single [`LoopEvent`] to a single [`ProjectLoopState`]. No I/O and
//! no knowledge of other projects; admission, notifications and precondition
//! handling live in the reconciler.

use chrono::{DateTime, Utc};

use crate::core::events::LoopEvent;
use crate::core::state::{LogEntry, LoopStatus, ProjectLoopState};
use crate::core::summary::summarize;

/// Why an event was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Iteration older than the last one recorded for the run.
    StaleIteration { last: u32, received: u32 },
    /// Run already reached a terminal status.
    RunFinished(LoopStatus),
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Applied without a status change.
    Recorded,
    /// Applied and the status changed.
    Changed { from: LoopStatus, to: LoopStatus },
    /// Ignored.
    Dropped(DropReason),
}

impl Transition {
    /// Returns the new status if the event changed it.
    #[must_use]
    pub const fn new_status(&self) -> Option<LoopStatus> {
        match self {
            Self::Changed { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Transition rules for one project's loop.
#[derive(Debug, Clone)]
pub struct LoopStateMachine {
    completion_signal: String,
}

impl LoopStateMachine {
    /// Creates a state machine that treats `completion_signal` as loop output
    /// to leave out of summaries.
    #[must_use]
    pub fn new(completion_signal: impl Into<String>) -> Self {
        Self {
            completion_signal: completion_signal.into(),
        }
    }

    /// Applies `event` to `state` as of `now`.
    ///
    /// Error events are applied as execution failures; precondition errors
    /// must be filtered out by the caller first.
    pub fn apply(
        &self,
        state: &mut ProjectLoopState,
        event: &LoopEvent,
        now: DateTime<Utc>,
    ) -> Transition {
        if let Some(reason) = drop_reason(state, event) {
            return Transition::Dropped(reason);
        }

        match event {
            LoopEvent::IterationStart { iteration, .. } => {
                state.current_iteration = *iteration;
                if state.started_at.is_none() {
                    state.started_at = Some(now);
                }
                set_status(state, LoopStatus::Running)
            }
            LoopEvent::Output {
                iteration,
                content,
                is_stderr,
                ..
            } => {
                state.push_log(LogEntry::new(*iteration, content, *is_stderr, now));
                Transition::Recorded
            }
            LoopEvent::Pausing { .. } => set_status(state, LoopStatus::Pausing),
            LoopEvent::Paused { .. } => set_status(state, LoopStatus::Paused),
            LoopEvent::Resumed { .. } => set_status(state, LoopStatus::Running),
            LoopEvent::Completed { iteration, .. } => {
                state.current_iteration = *iteration;
                self.finish(state, now, true);
                set_status(state, LoopStatus::Done)
            }
            LoopEvent::MaxIterationsReached { iteration, .. } => {
                state.current_iteration = *iteration;
                self.finish(state, now, true);
                set_status(state, LoopStatus::Partial)
            }
            LoopEvent::Error { error, .. } => {
                state.last_error = Some(error.clone());
                self.finish(state, now, false);
                set_status(state, LoopStatus::Failed)
            }
            LoopEvent::Stopped { .. } => {
                self.finish(state, now, false);
                set_status(state, LoopStatus::Cancelled)
            }
        }
    }

    fn finish(&self, state: &mut ProjectLoopState, now: DateTime<Utc>, with_summary: bool) {
        state.ended_at = Some(now);
        if with_summary {
            state.summary = Some(summarize(&state.logs, &self.completion_signal));
        }
    }
}

/// Returns why `event` would be ignored for `state`, if it would be.
///
/// Iteration starts must move forward; other events may not go back. Only
/// iteration starts and output lines are accepted once the run has ended.
#[must_use]
pub fn drop_reason(state: &ProjectLoopState, event: &LoopEvent) -> Option<DropReason> {
    if let Some(received) = event.iteration() {
        let stale = match event {
            LoopEvent::IterationStart { .. } => received <= state.current_iteration,
            _ => received < state.current_iteration,
        };
        if stale {
            return Some(DropReason::StaleIteration {
                last: state.current_iteration,
                received,
            });
        }
    }
    let opens_or_logs = matches!(
        event,
        LoopEvent::IterationStart { .. } | LoopEvent::Output { .. }
    );
    if !opens_or_logs && state.status.is_terminal() {
        return Some(DropReason::RunFinished(state.status));
    }
    None
}

fn set_status(state: &mut ProjectLoopState, to: LoopStatus) -> Transition {
    let from = state.status;
    if from == to {
        return Transition::Recorded;
    }
    state.status = to;
    Transition::Changed { from, to }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::state::DEFAULT_LOG_CAPACITY;
    use crate::core::summary::NO_SUMMARY;

    const SIGNAL: &str = "<done>COMPLETE</done>";

    fn machine() -> LoopStateMachine {
        LoopStateMachine::new(SIGNAL)
    }

    fn state(max_iterations: u32) -> ProjectLoopState {
        ProjectLoopState::new("p1", max_iterations, DEFAULT_LOG_CAPACITY)
    }

    fn start(iteration: u32) -> LoopEvent {
        LoopEvent::IterationStart {
            project_id: "p1".to_string(),
            iteration,
        }
    }

    fn output(iteration: u32, content: &str) -> LoopEvent {
        LoopEvent::Output {
            project_id: "p1".to_string(),
            iteration,
            content: content.to_string(),
            is_stderr: false,
        }
    }

    fn apply_all(m: &LoopStateMachine, s: &mut ProjectLoopState, events: &[LoopEvent]) {
        for event in events {
            m.apply(s, event, Utc::now());
        }
    }

    mod iterations {
        use super::*;

        #[test]
        fn increasing_iterations_are_applied() {
            let m = machine();
            let mut s = state(10);

            for i in [1, 2, 5, 9] {
                let transition = m.apply(&mut s, &start(i), Utc::now());
                assert!(!matches!(transition, Transition::Dropped(_)));
                assert_eq!(s.current_iteration, i);
            }
        }

        #[test]
        fn non_increasing_iteration_start_is_dropped() {
            let m = machine();
            let mut s = state(10);
            apply_all(&m, &mut s, &[start(1), start(2), start(3)]);

            for i in [3, 2, 1] {
                assert_eq!(
                    m.apply(&mut s, &start(i), Utc::now()),
                    Transition::Dropped(DropReason::StaleIteration {
                        last: 3,
                        received: i
                    })
                );
            }
            assert_eq!(s.current_iteration, 3);
        }

        #[test]
        fn first_iteration_sets_running_and_started_at() {
            let m = machine();
            let mut s = state(10);

            let transition = m.apply(&mut s, &start(1), Utc::now());

            assert_eq!(
                transition,
                Transition::Changed {
                    from: LoopStatus::Ready,
                    to: LoopStatus::Running
                }
            );
            assert!(s.started_at.is_some());
        }

        #[test]
        fn started_at_is_set_once_per_run() {
            let m = machine();
            let mut s = state(10);
            let first = Utc::now();

            m.apply(&mut s, &start(1), first);
            m.apply(&mut s, &start(2), first + chrono::Duration::seconds(30));

            assert_eq!(s.started_at, Some(first));
        }

        #[test]
        fn stale_output_is_not_logged() {
            let m = machine();
            let mut s = state(10);
            apply_all(&m, &mut s, &[start(1), start(2)]);

            let transition = m.apply(&mut s, &output(1, "late line"), Utc::now());

            assert!(matches!(transition, Transition::Dropped(_)));
            assert!(s.logs.is_empty());
        }

        #[test]
        fn output_for_current_iteration_is_logged() {
            let m = machine();
            let mut s = state(10);
            apply_all(&m, &mut s, &[start(1), output(1, "hello")]);

            assert_eq!(s.logs.len(), 1);
            assert_eq!(s.logs[0].content, "hello");
            assert_eq!(s.logs[0].iteration, 1);
        }
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn pause_and_resume_cycle() {
            let m = machine();
            let mut s = state(10);
            m.apply(&mut s, &start(1), Utc::now());

            m.apply(
                &mut s,
                &LoopEvent::Pausing {
                    project_id: "p1".into(),
                    iteration: 1,
                },
                Utc::now(),
            );
            assert_eq!(s.status, LoopStatus::Pausing);

            m.apply(
                &mut s,
                &LoopEvent::Paused {
                    project_id: "p1".into(),
                    iteration: 1,
                },
                Utc::now(),
            );
            assert_eq!(s.status, LoopStatus::Paused);

            m.apply(
                &mut s,
                &LoopEvent::Resumed {
                    project_id: "p1".into(),
                    iteration: 1,
                },
                Utc::now(),
            );
            assert_eq!(s.status, LoopStatus::Running);
        }

        #[test]
        fn completed_sets_done_end_time_and_summary() {
            let m = machine();
            let mut s = state(10);
            apply_all(&m, &mut s, &[start(1), output(1, "build ok"), output(1, SIGNAL)]);

            let transition = m.apply(
                &mut s,
                &LoopEvent::Completed {
                    project_id: "p1".into(),
                    iteration: 1,
                },
                Utc::now(),
            );

            assert_eq!(transition.new_status(), Some(LoopStatus::Done));
            assert!(s.ended_at.is_some());
            assert_eq!(s.summary.as_deref(), Some("build ok"));
        }

        #[test]
        fn completed_without_output_still_has_summary() {
            let m = machine();
            let mut s = state(10);
            m.apply(&mut s, &start(1), Utc::now());

            m.apply(
                &mut s,
                &LoopEvent::Completed {
                    project_id: "p1".into(),
                    iteration: 1,
                },
                Utc::now(),
            );

            assert_eq!(s.summary.as_deref(), Some(NO_SUMMARY));
        }

        #[test]
        fn max_iterations_reached_is_partial() {
            let m = machine();
            let mut s = state(3);
            apply_all(&m, &mut s, &[start(1), start(2), start(3)]);

            m.apply(
                &mut s,
                &LoopEvent::MaxIterationsReached {
                    project_id: "p1".into(),
                    iteration: 3,
                },
                Utc::now(),
            );

            assert_eq!(s.status, LoopStatus::Partial);
            assert_eq!(s.current_iteration, 3);
            assert!(s.current_iteration <= s.max_iterations);
            assert!(s.ended_at.is_some());
            assert!(s.summary.is_some());
        }

        #[test]
        fn error_sets_failed_with_verbatim_message() {
            let m = machine();
            let mut s = state(10);
            m.apply(&mut s, &start(2), Utc::now());

            m.apply(
                &mut s,
                &LoopEvent::Error {
                    project_id: "p1".into(),
                    iteration: 2,
                    error: "Idle timeout: no output for 120s".into(),
                },
                Utc::now(),
            );

            assert_eq!(s.status, LoopStatus::Failed);
            assert_eq!(
                s.last_error.as_deref(),
                Some("Idle timeout: no output for 120s")
            );
            assert!(s.ended_at.is_some());
            assert!(s.summary.is_none());
        }

        #[test]
        fn stopped_cancels_without_summary() {
            let m = machine();
            let mut s = state(10);
            apply_all(&m, &mut s, &[start(1), output(1, "working")]);

            m.apply(
                &mut s,
                &LoopEvent::Stopped {
                    project_id: "p1".into(),
                },
                Utc::now(),
            );

            assert_eq!(s.status, LoopStatus::Cancelled);
            assert!(s.summary.is_none());
            assert!(s.ended_at.is_some());
        }

        #[test]
        fn second_terminal_event_is_dropped() {
            let m = machine();
            let mut s = state(10);
            m.apply(&mut s, &start(1), Utc::now());
            let ended = Utc::now();
            m.apply(
                &mut s,
                &LoopEvent::Stopped {
                    project_id: "p1".into(),
                },
                ended,
            );

            let transition = m.apply(
                &mut s,
                &LoopEvent::Completed {
                    project_id: "p1".into(),
                    iteration: 1,
                },
                ended + chrono::Duration::seconds(1),
            );

            assert_eq!(
                transition,
                Transition::Dropped(DropReason::RunFinished(LoopStatus::Cancelled))
            );
            assert_eq!(s.ended_at, Some(ended));
        }

        #[test]
        fn repeated_status_is_recorded_without_change() {
            let m = machine();
            let mut s = state(10);
            m.apply(&mut s, &start(1), Utc::now());

            let transition = m.apply(
                &mut s,
                &LoopEvent::Resumed {
                    project_id: "p1".into(),
                    iteration: 1,
                },
                Utc::now(),
            );

            assert_eq!(transition, Transition::Recorded);
        }

        #[test]
        fn restarted_run_accepts_iteration_one_again() {
            let m = machine();
            let mut s = state(10);
            apply_all(&m, &mut s, &[start(1), start(2)]);
            m.apply(
                &mut s,
                &LoopEvent::Stopped {
                    project_id: "p1".into(),
                },
                Utc::now(),
            );

            s.begin_run();
            let transition = m.apply(&mut s, &start(1), Utc::now());

            assert_eq!(transition.new_status(), None);
            assert_eq!(s.status, LoopStatus::Running);
            assert_eq!(s.current_iteration, 1);
            assert!(s.started_at.is_some());
        }
    }
}
