//! CLI argument parsing using clap.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::str::FromStr;

use crate::core::{GuardDecision, RecoveryDecision};

/// `loopherd` - concurrent agent loop orchestrator
///
/// Runs simulated agent loops for the given projects through the admission
/// queue, answering precondition prompts and recovery decisions with the
/// policies given on the command line.
#[derive(Parser, Debug)]
#[command(name = "loopherd", version, about, long_about = None)]
pub struct Args {
    /// Project ids to start, in queue order
    #[arg(required = true)]
    pub projects: Vec<String>,

    /// Maximum number of loops running at once (overrides settings)
    #[arg(long)]
    pub max_concurrent: Option<usize>,

    /// Iteration ceiling per project (overrides settings)
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Iteration at which every project prints the completion signal
    #[arg(long)]
    pub complete_after: Option<u32>,

    /// Project that fails the start-time trust check
    #[arg(long, value_name = "ID")]
    pub untrusted: Vec<String>,

    /// Project whose loop reports a trust failure at an iteration (default 1)
    #[arg(long, value_name = "ID[:N]")]
    pub revoke_trust: Vec<ProjectIteration>,

    /// Project whose loop fails at an iteration (default 1)
    #[arg(long, value_name = "ID[:N]")]
    pub fail: Vec<ProjectIteration>,

    /// Loop left over from a previous session (iteration default 1)
    #[arg(long, value_name = "ID[:N]")]
    pub interrupted: Vec<ProjectIteration>,

    /// Answer to precondition prompts
    #[arg(long, value_enum, default_value_t = PreconditionPolicy::Init)]
    pub on_precondition: PreconditionPolicy,

    /// Answer to interrupted loops found at startup
    #[arg(long, value_enum, default_value_t = RecoveryPolicy::Recover)]
    pub on_interrupted: RecoveryPolicy,

    /// Simulated duration of one iteration in milliseconds
    #[arg(long, default_value_t = 100)]
    pub delay_ms: u64,

    /// Directory holding `.loopherd/settings.json` (default: current directory)
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    pub save: bool,
}

/// How precondition prompts are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PreconditionPolicy {
    /// Establish the precondition, then retry
    Init,
    /// Persist a per-project override, then retry
    Skip,
    /// Give up on the project
    Cancel,
}

impl From<PreconditionPolicy> for GuardDecision {
    fn from(policy: PreconditionPolicy) -> Self {
        match policy {
            PreconditionPolicy::Init => Self::Init,
            PreconditionPolicy::Skip => Self::Skip,
            PreconditionPolicy::Cancel => Self::Cancel,
        }
    }
}

/// How interrupted loops are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecoveryPolicy {
    /// Keep the project selected for a manual resume
    Recover,
    /// Discard the interrupted loop
    Cancel,
}

impl From<RecoveryPolicy> for RecoveryDecision {
    fn from(policy: RecoveryPolicy) -> Self {
        match policy {
            RecoveryPolicy::Recover => Self::Recover,
            RecoveryPolicy::Cancel => Self::Cancel,
        }
    }
}

/// A project id with an optional iteration, written `ID` or `ID:N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectIteration {
    pub project_id: String,
    pub iteration: u32,
}

impl FromStr for ProjectIteration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (project_id, iteration) = match s.rsplit_once(':') {
            Some((id, n)) => {
                let iteration = n
                    .parse::<u32>()
                    .map_err(|_| format!("invalid iteration '{n}' in '{s}'"))?;
                (id, iteration)
            }
            None => (s, 1),
        };
        if project_id.is_empty() {
            return Err(format!("missing project id in '{s}'"));
        }
        if iteration == 0 {
            return Err(format!("iterations are numbered from 1 in '{s}'"));
        }
        Ok(Self {
            project_id: project_id.to_string(),
            iteration,
        })
    }
}
