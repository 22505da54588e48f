//! Orchestrator scenario tests.
//!
//! Organized by concern:
//! - `helpers` - Recording backend and event builders
//! - `scheduling` - Admission, queueing and loop commands
//! - `reconcile` - Event application, notifications and the event loop
//! - `precondition` - Guard requests and their resolution
//! - `recovery` - Startup recovery of interrupted loops

#[allow(clippy::unwrap_used, clippy::expect_used)]
pub mod helpers;
