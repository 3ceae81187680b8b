/// Durable supervisor state: survives watchdog restarts.
///
/// Written once per tick with the atomic write pattern: write to a temp file in
/// the same directory, then rename over the target.
use crate::job::JobKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Restart-controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    /// No job detected.
    #[default]
    Idle,
    /// Job detected, checkpoint fresh or signal-less.
    Monitoring,
    /// Job detected, checkpoint stale.
    Stalling,
    /// Killing and relaunching. Only observable if a tick is interrupted.
    Restarting,
    /// Job vanished with work left.
    CrashRecovery,
}

/// Why a job needs a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentCause {
    Stalled,
    Crashed,
}

/// An alerted-but-unresolved problem, so repeated ticks don't re-alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub kind: JobKind,
    pub cause: IncidentCause,
    pub since: DateTime<Utc>,
}

/// Everything the supervisor carries from one tick to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorState {
    /// Most recent job kind seen running.
    pub last_detected_kind: Option<JobKind>,
    /// When a relaunch was last issued (restart-storm suppression).
    pub last_restart_time: Option<DateTime<Utc>>,
    pub phase: SupervisorPhase,
    pub incident: Option<Incident>,
    pub restart_count: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Reads and writes the state file.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load saved state. Missing or corrupt files start from a blank state.
    pub fn load(&self) -> SupervisorState {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to read state file");
                }
                return SupervisorState::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "state file is corrupt, starting fresh"
                );
                SupervisorState::default()
            }
        }
    }

    /// Atomically replace the state file.
    pub fn save(&self, state: &SupervisorState) -> Result<(), StateError> {
        let json =
            serde_json::to_string_pretty(state).map_err(|e| StateError::Serialize { source: e })?;
        write_atomic(&self.path, json.as_bytes()).map_err(|e| StateError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write `bytes` to a temp file next to `path`, then rename over it, so
/// readers never see a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Errors from state file operations.
#[derive(Debug)]
pub enum StateError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Serialize { source } => write!(f, "failed to serialize state: {source}"),
            StateError::Write { path, source } => {
                write!(f, "failed to write state file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateError::Serialize { source } => Some(source),
            StateError::Write { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_is_default() {
        let dir = tempdir().unwrap();
        let file = StateFile::new(dir.path().join("state.json"));
        assert_eq!(file.load(), SupervisorState::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let file = StateFile::new(dir.path().join("state.json"));
        let now = Utc::now();
        let state = SupervisorState {
            last_detected_kind: Some(JobKind::Main),
            last_restart_time: Some(now),
            phase: SupervisorPhase::Monitoring,
            incident: Some(Incident {
                kind: JobKind::Main,
                cause: IncidentCause::Stalled,
                since: now,
            }),
            restart_count: 3,
            updated_at: Some(now),
        };

        file.save(&state).unwrap();
        assert_eq!(file.load(), state);

        let contents = std::fs::read_to_string(file.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["last_detected_kind"], "main");
        assert_eq!(parsed["phase"], "monitoring");
        assert_eq!(parsed["incident"]["cause"], "stalled");
    }

    #[test]
    fn test_corrupt_file_is_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(StateFile::new(path).load(), SupervisorState::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"last_detected_kind":"recovery"}"#).unwrap();
        let state = StateFile::new(path).load();
        assert_eq!(state.last_detected_kind, Some(JobKind::Recovery));
        assert_eq!(state.phase, SupervisorPhase::Idle);
        assert_eq!(state.last_restart_time, None);
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_save_into_missing_dir_fails() {
        let dir = tempdir().unwrap();
        let file = StateFile::new(dir.path().join("missing").join("state.json"));
        let err = file.save(&SupervisorState::default()).unwrap_err();
        assert!(matches!(err, StateError::Write { .. }));
    }
}
