/// Single-instance guard: an exclusive advisory lock on `<data_dir>/lock`,
/// held for the lifetime of the process, with the holder's PID inside.
use fs2::FileExt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held lock. Released when dropped (or when the process exits).
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock or fail with `LockError::Held` if another instance has it.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        // Don't truncate before holding the lock: that would wipe the
        // running instance's PID.
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;

        if file.try_lock_exclusive().is_err() {
            let holder = std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse().ok());
            return Err(LockError::Held {
                path: path.to_path_buf(),
                pid: holder,
            });
        }

        let write_pid = |file: &mut File| -> std::io::Result<()> {
            file.set_len(0)?;
            writeln!(file, "{}", std::process::id())?;
            file.flush()
        };
        write_pid(&mut file).map_err(|e| LockError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;

        tracing::debug!(path = %path.display(), pid = std::process::id(), "acquired instance lock");
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another instance holds the lock.
    Held { path: PathBuf, pid: Option<u32> },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {source}", path.display())
            }
            LockError::Held { path, pid: Some(pid) } => write!(
                f,
                "another scrapewatch instance (pid {pid}) holds {}",
                path.display()
            ),
            LockError::Held { path, pid: None } => {
                write!(f, "another scrapewatch instance holds {}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Held { .. } => None,
        }
    }
}
