//! `loopherd` - concurrent agent loop orchestrator
//!
//! Admits autonomous agent loops across projects under a concurrency
//! limit, reconciles their lifecycle events, and gates them on a
//! user-answered precondition.

pub mod cli;
pub mod core;
pub mod fs;
pub mod logging;
