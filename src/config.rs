use crate::checkpoint::CheckpointFormat;
use crate::job::JobKind;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from scrapewatch.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WatchConfig {
    pub watchdog: WatchdogConfig,
    pub auxiliary: AuxiliaryConfig,
    pub notify: NotifyConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub poll_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub restart_cooldown_secs: u64,
    pub kill_grace_secs: u64,
    /// Directory that relative job paths are resolved against.
    pub base_dir: PathBuf,
    /// Supervisor's own state, lock and log live here.
    pub data_dir: PathBuf,
}

/// Worker processes spawned by the jobs (headless browsers).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuxiliaryConfig {
    /// Regex matched against each process command line.
    pub pattern: String,
    pub ceiling: usize,
    pub excess_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    /// Bot API host, for a self-hosted server or proxy.
    pub api_base: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub recovery: JobConfig,
    pub rescrape: JobConfig,
    pub main: JobConfig,
}

/// How to recognise, inspect and relaunch one job kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Substrings identifying the job in a process command line.
    pub patterns: Vec<String>,
    pub checkpoint: PathBuf,
    pub format: CheckpointFormat,
    /// JSON array whose length is the pending count when the checkpoint lacks one.
    pub pending_file: Option<PathBuf>,
    pub expected_total: Option<u64>,
    /// JSON arrays of work items; the longest is the total when
    /// `expected_total` is unset.
    pub total_files: Vec<PathBuf>,
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub log_file: Option<PathBuf>,
}

impl WatchConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: WatchConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watchdog.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if let Err(e) = regex::Regex::new(&self.auxiliary.pattern) {
            return Err(ConfigError::Invalid(format!(
                "auxiliary.pattern is not a valid regex: {e}"
            )));
        }
        for kind in JobKind::PRIORITY {
            let job = self.jobs.get(kind);
            if job.patterns.iter().all(|p| p.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "jobs.{kind}.patterns must contain at least one non-empty pattern"
                )));
            }
            if job.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "jobs.{kind}.command must not be empty"
                )));
            }
        }
        Ok(())
    }

    /// Resolve a job-relative path against `watchdog.base_dir`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.watchdog.base_dir.join(path)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog.poll_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.watchdog.stale_threshold_secs)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.watchdog.restart_cooldown_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.watchdog.kill_grace_secs)
    }
}

impl JobsConfig {
    pub fn get(&self, kind: JobKind) -> &JobConfig {
        match kind {
            JobKind::Recovery => &self.recovery,
            JobKind::Rescrape => &self.rescrape,
            JobKind::Main => &self.main,
        }
    }
}

// --- Default implementations ---

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 300,
            stale_threshold_secs: 1800,
            restart_cooldown_secs: 600,
            kill_grace_secs: 5,
            base_dir: PathBuf::from("."),
            data_dir: PathBuf::from(".scrapewatch"),
        }
    }
}

impl Default for AuxiliaryConfig {
    fn default() -> Self {
        Self {
            pattern: "Google Chrome.*bota".to_string(),
            ceiling: 60,
            excess_grace_secs: 300,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            telegram_chat_id: None,
            api_base: "https://api.telegram.org".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            checkpoint: PathBuf::new(),
            format: CheckpointFormat::Progress,
            pending_file: None,
            expected_total: None,
            total_files: Vec::new(),
            command: "python3".to_string(),
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            env: BTreeMap::new(),
            log_file: None,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        let env = BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]);
        Self {
            recovery: JobConfig {
                patterns: vec!["recovery_search".to_string(), "run_full_recovery".to_string()],
                checkpoint: PathBuf::from("us-restaurant-scraper/checkpoints_recovery/progress.json"),
                args: vec!["../recovery_search.py".to_string(), "--skip-search".to_string()],
                working_dir: PathBuf::from("us-restaurant-scraper"),
                env: env.clone(),
                log_file: Some(PathBuf::from("recovery.log")),
                ..JobConfig::default()
            },
            rescrape: JobConfig {
                patterns: vec!["rescrape_rejected".to_string()],
                checkpoint: PathBuf::from("us-restaurant-scraper/checkpoints/rescrape_done.json"),
                format: CheckpointFormat::DoneList,
                total_files: vec![
                    PathBuf::from("m1_rescrape_place_ids.json"),
                    PathBuf::from("m2_rescrape_place_ids.json"),
                ],
                args: vec!["rescrape_rejected.py".to_string()],
                env: env.clone(),
                log_file: Some(PathBuf::from("rescrape.log")),
                ..JobConfig::default()
            },
            main: JobConfig {
                patterns: vec!["gmaps_scraper".to_string()],
                checkpoint: PathBuf::from("us-restaurant-scraper/checkpoints/progress.json"),
                pending_file: Some(PathBuf::from(
                    "us-restaurant-scraper/checkpoints/pending_links.json",
                )),
                args: vec!["-m".to_string(), "gmaps_scraper.cli".to_string()],
                working_dir: PathBuf::from("us-restaurant-scraper"),
                env,
                log_file: Some(PathBuf::from("scraper.log")),
                ..JobConfig::default()
            },
        }
    }
}

/// Errors from loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
