use std::path::{Path, PathBuf};

/// Holds a configurable base directory for all daemon file paths.
///
/// Use `ConfigPaths::new()` for production (resolves `~/.tally`),
/// or `ConfigPaths::with_base()` for testing with an isolated directory.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    base: PathBuf,
}

impl ConfigPaths {
    /// Create paths rooted at `~/.tally`. Returns an error if the home
    /// directory cannot be determined.
    pub fn new() -> anyhow::Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(Self {
            base: home.join(".tally"),
        })
    }

    /// Create paths rooted at a custom base directory (useful for tests).
    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_dir(&self) -> &Path {
        &self.base
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join("config.toml")
    }

    pub fn database_path(&self) -> PathBuf {
        self.base.join("usage.db")
    }

    /// Ensure the config directory exists, creating it if necessary.
    pub fn ensure_config_dir(&self) -> anyhow::Result<PathBuf> {
        if !self.base.exists() {
            std::fs::create_dir_all(&self.base)?;
        }
        Ok(self.base.clone())
    }
}
