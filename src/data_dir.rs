use std::path::{Path, PathBuf};

/// Manages the `.scrapewatch/` directory layout.
///
/// Everything the watchdog itself writes lives under a single data directory:
/// persisted supervisor state, the singleton lock, and the append-only log.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.scrapewatch/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the persisted supervisor state.
    pub fn state(&self) -> PathBuf {
        self.root.join("state.json")
    }

    /// Path to the singleton lock file.
    pub fn lock(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Path to the watchdog's own log.
    pub fn log(&self) -> PathBuf {
        self.root.join("watchdog.log")
    }

    /// Create the directory if missing.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        Ok(created)
    }
}
