/// Job relaunch: spawn a detached job process with its configured working
/// directory, environment and append-only log file.
use crate::config::WatchConfig;
use crate::job::JobKind;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Starts a job process and returns its pid. The watchdog never waits on it;
/// the next tick rediscovers the job through classification.
pub trait Launcher: Send + Sync {
    fn launch(&self, kind: JobKind) -> Result<u32, LaunchError>;
}

/// How to start one job kind.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub log_file: Option<PathBuf>,
}

/// Launcher that spawns real subprocesses.
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher {
    specs: BTreeMap<JobKind, LaunchSpec>,
}

impl CommandLauncher {
    pub fn new(specs: BTreeMap<JobKind, LaunchSpec>) -> Self {
        Self { specs }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        let specs = JobKind::PRIORITY
            .iter()
            .map(|&kind| {
                let job = config.jobs.get(kind);
                let working_dir = config.resolve(&job.working_dir);
                let spec = LaunchSpec {
                    command: job.command.clone(),
                    args: job.args.clone(),
                    log_file: job.log_file.as_ref().map(|p| {
                        if p.is_absolute() {
                            p.clone()
                        } else {
                            working_dir.join(p)
                        }
                    }),
                    working_dir,
                    env: job.env.clone(),
                };
                (kind, spec)
            })
            .collect();
        Self::new(specs)
    }
}

impl Launcher for CommandLauncher {
    /// The child gets its own process group so that killing the watchdog
    /// (or its terminal) leaves the job running.
    fn launch(&self, kind: JobKind) -> Result<u32, LaunchError> {
        let spec = self
            .specs
            .get(&kind)
            .ok_or(LaunchError::NotConfigured { kind })?;

        let (stdout, stderr) = match &spec.log_file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| LaunchError::LogFile {
                        path: path.clone(),
                        source: e,
                    })?;
                let file_stderr = file.try_clone().map_err(|e| LaunchError::LogFile {
                    path: path.clone(),
                    source: e,
                })?;
                (Stdio::from(file), Stdio::from(file_stderr))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        tracing::info!(
            %kind,
            command = %spec.command,
            args = ?spec.args,
            cwd = %spec.working_dir.display(),
            "launching job"
        );

        let child = Command::new(&spec.command)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| LaunchError::Spawn { kind, source: e })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(%kind, pid, "job process started");
        // Dropping the handle detaches; tokio reaps the child in the background.
        drop(child);
        Ok(pid)
    }
}

/// Errors that can occur when relaunching a job.
#[derive(Debug)]
pub enum LaunchError {
    NotConfigured {
        kind: JobKind,
    },
    /// Failed to open the job's log file.
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Spawn {
        kind: JobKind,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::NotConfigured { kind } => {
                write!(f, "no launch command configured for {kind}")
            }
            LaunchError::LogFile { path, source } => {
                write!(f, "failed to open job log {}: {source}", path.display())
            }
            LaunchError::Spawn { kind, source } => {
                write!(f, "failed to spawn {kind} job: {source}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::NotConfigured { .. } => None,
            LaunchError::LogFile { source, .. } => Some(source),
            LaunchError::Spawn { source, .. } => Some(source),
        }
    }
}
