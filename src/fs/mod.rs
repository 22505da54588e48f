//! File system operations.

use std::path::{Path, PathBuf};

use anyhow::Context;

pub mod settings;

pub use settings::{PersistedSettings, load_settings, save_settings};

/// Directory holding loopherd state under the base directory.
pub const LOOPHERD_DIR: &str = ".loopherd";

/// Holds all loopherd-related paths derived from a base directory.
///
/// Tests root this in a temporary directory; the binary roots it in the
/// working directory unless `--base-dir` is given.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use loopherd::fs::LoopherdPaths;
///
/// let paths = LoopherdPaths::new(Path::new("/tmp/test"));
/// assert_eq!(paths.settings_file(), Path::new("/tmp/test/.loopherd/settings.json"));
/// ```
#[derive(Debug, Clone)]
pub struct LoopherdPaths {
    base: PathBuf,
}

impl LoopherdPaths {
    /// Creates paths rooted at the given base directory.
    #[must_use]
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    /// Creates paths rooted at the current working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn from_cwd() -> anyhow::Result<Self> {
        let base = std::env::current_dir().context("Failed to get current directory")?;
        Ok(Self { base })
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Returns the `.loopherd` directory path.
    #[must_use]
    pub fn loopherd_dir(&self) -> PathBuf {
        self.base.join(LOOPHERD_DIR)
    }

    /// Returns the settings file path (`.loopherd/settings.json`).
    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.loopherd_dir().join("settings.json")
    }

    /// Ensures the `.loopherd` directory exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn ensure_loopherd_dir(&self) -> anyhow::Result<()> {
        let dir = self.loopherd_dir();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Loads settings, returning defaults if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_settings(&self) -> anyhow::Result<PersistedSettings> {
        load_settings(&self.settings_file())
    }

    /// Saves settings, creating the `.loopherd` directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot be written.
    pub fn save_settings(&self, settings: &PersistedSettings) -> anyhow::Result<()> {
        self.ensure_loopherd_dir()?;
        save_settings(&self.settings_file(), settings)
    }
}
