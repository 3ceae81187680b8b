/// Read-only projection of the jobs' progress files.
///
/// The job processes own their checkpoints. The only write the watchdog ever
/// performs is `touch_last_update`, right before relaunching a job.
use crate::config::WatchConfig;
use crate::job::JobKind;
use crate::state::write_atomic;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Phase tag the jobs write once all work is done.
pub const PHASE_COMPLETE: &str = "complete";

/// Layout of a checkpoint file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    /// JSON object with `phase`, `last_update` and progress counters.
    #[default]
    Progress,
    /// JSON array of finished item ids; carries no timestamp.
    DoneList,
}

/// A job's checkpoint at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointSnapshot {
    pub last_update: Option<DateTime<Utc>>,
    pub phase: String,
    /// Progress in the current phase.
    pub completed_count: Option<u64>,
    pub pending_count: Option<u64>,
    /// Known total for the current phase, from the checkpoint or config.
    pub total_count: Option<u64>,
    pub saved_count: Option<u64>,
    pub searches_count: Option<u64>,
    pub details_count: Option<u64>,
    /// Pending links discovered by this run rather than taken from a cache.
    pub new_links_count: Option<u64>,
}

impl CheckpointSnapshot {
    pub fn is_complete(&self) -> bool {
        self.phase == PHASE_COMPLETE
    }

    /// Work remains: not complete, and either pending items exist or the
    /// completed count is below the known total.
    pub fn has_incomplete_work(&self) -> bool {
        if self.is_complete() {
            return false;
        }
        let pending = self.pending_count.unwrap_or(0) > 0;
        let short_of_total = match (self.completed_count, self.total_count) {
            (Some(done), Some(total)) => done < total,
            _ => false,
        };
        pending || short_of_total
    }
}

/// Where and how to read one job's checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointSource {
    pub path: PathBuf,
    pub format: CheckpointFormat,
    pub pending_file: Option<PathBuf>,
    pub expected_total: Option<u64>,
    /// JSON arrays of work items; the largest one is the total when
    /// `expected_total` is unset.
    pub total_files: Vec<PathBuf>,
}

impl CheckpointSource {
    fn resolved_total(&self) -> Option<u64> {
        self.expected_total
            .or_else(|| self.total_files.iter().filter_map(|p| read_array_len(p)).max())
    }
}

/// Maps each job kind to its fixed checkpoint location.
#[derive(Debug, Clone, Default)]
pub struct CheckpointReader {
    sources: BTreeMap<JobKind, CheckpointSource>,
}

impl CheckpointReader {
    pub fn new(sources: BTreeMap<JobKind, CheckpointSource>) -> Self {
        Self { sources }
    }

    pub fn from_config(config: &WatchConfig) -> Self {
        let sources = JobKind::PRIORITY
            .iter()
            .map(|&kind| {
                let job = config.jobs.get(kind);
                let source = CheckpointSource {
                    path: config.resolve(&job.checkpoint),
                    format: job.format,
                    pending_file: job.pending_file.as_deref().map(|p| config.resolve(p)),
                    expected_total: job.expected_total,
                    total_files: job.total_files.iter().map(|p| config.resolve(p)).collect(),
                };
                (kind, source)
            })
            .collect();
        Self::new(sources)
    }

    pub fn source(&self, kind: JobKind) -> Option<&CheckpointSource> {
        self.sources.get(&kind)
    }

    /// Read the checkpoint for `kind`. `None` when the file is missing or
    /// unparseable, which is a normal early-lifecycle state.
    pub fn read(&self, kind: JobKind) -> Option<CheckpointSnapshot> {
        let source = self.sources.get(&kind)?;
        let text = match std::fs::read_to_string(&source.path) {
            Ok(t) => t,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        %kind,
                        path = %source.path.display(),
                        error = %e,
                        "failed to read checkpoint"
                    );
                }
                return None;
            }
        };

        let expected_total = source.resolved_total();
        let snapshot = match source.format {
            CheckpointFormat::Progress => parse_progress(&text, expected_total),
            CheckpointFormat::DoneList => parse_done_list(&text, expected_total),
        };
        let Some(mut snapshot) = snapshot else {
            tracing::warn!(%kind, path = %source.path.display(), "checkpoint is malformed, ignoring");
            return None;
        };

        if snapshot.pending_count.is_none() {
            if let Some(pending_file) = &source.pending_file {
                snapshot.pending_count = read_array_len(pending_file);
                if snapshot.phase == "details" {
                    if let Some(total) = details_total(snapshot.completed_count, snapshot.pending_count) {
                        snapshot.total_count = Some(total);
                    }
                }
            }
        }
        Some(snapshot)
    }
}

/// Parse a `progress` checkpoint. Requires a JSON object with a `phase` string.
pub fn parse_progress(text: &str, expected_total: Option<u64>) -> Option<CheckpointSnapshot> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    let phase = obj.get("phase")?.as_str()?.to_string();

    let count = |key: &str| -> Option<u64> {
        match obj.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::Array(items) => Some(items.len() as u64),
            _ => None,
        }
    };

    let searches = count("completed_searches_count").or_else(|| count("completed_searches"));
    let details = count("completed_details");
    let completed_count = if phase == "details" {
        details.or(searches)
    } else {
        searches.or(details)
    };

    let pending_count = count("pending_links");
    let total_count = match phase.as_str() {
        "search" => count("total_queries").or(expected_total),
        "details" => details_total(completed_count, pending_count).or(expected_total),
        _ => expected_total,
    };

    Some(CheckpointSnapshot {
        last_update: obj
            .get("last_update")
            .and_then(Value::as_str)
            .and_then(parse_timestamp),
        phase,
        completed_count,
        pending_count,
        total_count,
        saved_count: count("total_restaurants_saved"),
        searches_count: searches,
        details_count: details,
        new_links_count: count("total_new_links"),
    })
}

/// Parse a `done_list` checkpoint: a JSON array of finished ids.
pub fn parse_done_list(text: &str, expected_total: Option<u64>) -> Option<CheckpointSnapshot> {
    let value: Value = serde_json::from_str(text).ok()?;
    let done = value.as_array()?.len() as u64;
    let phase = match expected_total {
        Some(total) if done >= total => PHASE_COMPLETE,
        _ => "running",
    };
    Some(CheckpointSnapshot {
        last_update: None,
        phase: phase.to_string(),
        completed_count: Some(done),
        pending_count: None,
        total_count: expected_total,
        ..CheckpointSnapshot::default()
    })
}

/// In the details phase every link is either done or still pending.
fn details_total(done: Option<u64>, pending: Option<u64>) -> Option<u64> {
    Some(done.unwrap_or(0) + pending?)
}

/// Coerce an ISO-8601-like timestamp. Offset-less values are local time, which
/// is what the Python jobs write.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Render `ts` the way the jobs write it: naive local time, microseconds.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local)
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Set `last_update` to `now`, keeping every other field.
///
/// Grants a relaunched job a grace period before the next staleness check.
pub fn touch_last_update(path: &Path, now: DateTime<Utc>) -> Result<(), CheckpointError> {
    let text = std::fs::read_to_string(path).map_err(|e| CheckpointError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut value: Value = serde_json::from_str(&text).map_err(|e| CheckpointError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    let Some(obj) = value.as_object_mut() else {
        return Err(CheckpointError::NotAnObject {
            path: path.to_path_buf(),
        });
    };
    obj.insert(
        "last_update".to_string(),
        Value::String(format_timestamp(now)),
    );

    let json = serde_json::to_string_pretty(&value).map_err(|e| CheckpointError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    write_atomic(path, json.as_bytes()).map_err(|e| CheckpointError::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

fn read_array_len(path: &Path) -> Option<u64> {
    #[derive(Deserialize)]
    #[serde(transparent)]
    struct AnyArray(Vec<serde::de::IgnoredAny>);

    let text = std::fs::read_to_string(path).ok()?;
    let items: AnyArray = serde_json::from_str(&text).ok()?;
    Some(items.0.len() as u64)
}

/// Errors from rewriting a checkpoint.
#[derive(Debug)]
pub enum CheckpointError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    NotAnObject {
        path: PathBuf,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::Read { path, source } => {
                write!(f, "failed to read checkpoint {}: {source}", path.display())
            }
            CheckpointError::Parse { path, source } => {
                write!(f, "failed to parse checkpoint {}: {source}", path.display())
            }
            CheckpointError::NotAnObject { path } => {
                write!(f, "checkpoint {} is not a JSON object", path.display())
            }
            CheckpointError::Write { path, source } => {
                write!(f, "failed to write checkpoint {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckpointError::Read { source, .. } => Some(source),
            CheckpointError::Parse { source, .. } => Some(source),
            CheckpointError::NotAnObject { .. } => None,
            CheckpointError::Write { source, .. } => Some(source),
        }
    }
}
