//! Settings persistence module.
//!
//! Loads and saves orchestrator settings as JSON in `.loopherd/settings.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::OrchestratorConfig;

/// Persisted settings that are saved between sessions.
///
/// Every field is optional. Missing or unusable values fall back to the
/// orchestrator defaults when converted with [`PersistedSettings::into_config`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PersistedSettings {
    /// Maximum number of loops running at once.
    pub max_concurrent: Option<usize>,
    /// Iteration ceiling for projects without their own.
    pub default_max_iterations: Option<u32>,
    /// Line the agent prints when the task is finished.
    pub completion_signal: Option<String>,
    /// Text that identifies a precondition failure.
    pub precondition_marker: Option<String>,
}

impl PersistedSettings {
    /// Builds an orchestrator configuration, replacing missing, zero or
    /// blank values with defaults.
    #[must_use]
    pub fn into_config(self) -> OrchestratorConfig {
        let defaults = OrchestratorConfig::default();
        OrchestratorConfig {
            max_concurrent: self
                .max_concurrent
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent),
            default_max_iterations: self
                .default_max_iterations
                .filter(|n| *n > 0)
                .unwrap_or(defaults.default_max_iterations),
            completion_signal: non_blank(self.completion_signal)
                .unwrap_or(defaults.completion_signal),
            precondition_marker: non_blank(self.precondition_marker)
                .unwrap_or(defaults.precondition_marker),
            log_capacity: defaults.log_capacity,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl From<&OrchestratorConfig> for PersistedSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_concurrent: Some(config.max_concurrent),
            default_max_iterations: Some(config.default_max_iterations),
            completion_signal: Some(config.completion_signal.clone()),
            precondition_marker: Some(config.precondition_marker.clone()),
        }
    }
}

/// Loads settings from the specified settings file path.
///
/// If the file doesn't exist, returns default settings.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_settings(path: &Path) -> Result<PersistedSettings> {
    if !path.exists() {
        return Ok(PersistedSettings::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))
}

/// Saves settings to the specified settings file path as pretty-printed JSON.
///
/// The parent directory must exist.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_settings(path: &Path, settings: &PersistedSettings) -> Result<()> {
    let json = serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;

    std::fs::write(path, json)
        .with_context(|| format!("Failed to write settings file: {}", path.display()))
}
