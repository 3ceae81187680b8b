/// Human-readable status report for the active (or most recent) job.
use crate::checkpoint::{CheckpointReader, CheckpointSnapshot};
use crate::job::{JobClassifier, JobKind};
use crate::process::{self, ProcessHost};
use crate::staleness::{self, Staleness};
use chrono::{DateTime, Local, Utc};
use regex::Regex;
use std::fmt::Write as _;
use std::time::Duration;

const RULE_HEAVY: &str = "════════════════════════════════════════";
const RULE_LIGHT: &str = "────────────────────────────────────────";

pub const NO_DATA: &str = "No scraper data found.";

/// Liveness shown on the `Status:` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Stopped,
    Stalled(Duration),
}

impl RunStatus {
    pub fn new(running: bool, staleness: Staleness) -> Self {
        match (running, staleness) {
            (false, _) => RunStatus::Stopped,
            (true, Staleness::Stale(elapsed)) => RunStatus::Stalled(elapsed),
            (true, _) => RunStatus::Running,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Stopped => write!(f, "Stopped"),
            RunStatus::Stalled(elapsed) => {
                write!(f, "STALLED ({}m ago)", (elapsed.as_secs() + 30) / 60)
            }
        }
    }
}

fn title(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Recovery => "RECOVERY STATUS",
        JobKind::Rescrape => "RESCRAPE STATUS",
        JobKind::Main => "SCRAPER STATUS",
    }
}

/// Render the report block for one job kind.
pub fn render_status(
    kind: JobKind,
    snapshot: Option<&CheckpointSnapshot>,
    status: RunStatus,
    aux_count: usize,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    let time = now.with_timezone(&Local).format("%I:%M %p");
    let _ = writeln!(out, "{} ({time})", title(kind));
    let _ = writeln!(out, "{RULE_HEAVY}");
    let _ = writeln!(out, "Status:      {status}");
    let _ = writeln!(out, "Chrome:      {aux_count} processes");
    let _ = writeln!(out, "{RULE_LIGHT}");

    match snapshot {
        None => {
            let _ = writeln!(out, "No checkpoint found");
        }
        Some(snap) => render_counters(&mut out, kind, snap),
    }
    out.push_str(RULE_HEAVY);
    out
}

fn render_counters(out: &mut String, kind: JobKind, snap: &CheckpointSnapshot) {
    let done = snap.completed_count.unwrap_or(0);
    match kind {
        JobKind::Rescrape => {
            let _ = writeln!(out, "Done:        {}", progress(done, snap.total_count));
        }
        JobKind::Recovery if snap.phase == "search" => {
            let _ = writeln!(out, "Phase:       1 (Re-search)");
            let _ = writeln!(out, "Searches:    {}", progress(done, snap.total_count));
            if let Some(pending) = snap.pending_count {
                let new = snap.new_links_count.unwrap_or(0);
                let _ = writeln!(out, "Pending:     {} links", thousands(pending));
                let _ = writeln!(out, "  Cached:    {}", thousands(pending.saturating_sub(new)));
                let _ = writeln!(out, "  New:       {}", thousands(new));
            }
        }
        JobKind::Recovery => {
            let _ = writeln!(out, "Phase:       2 (Detail scrape)");
            let _ = writeln!(out, "Details:     {}", progress(done, snap.total_count));
            render_saved(out, snap);
            if let Some(pending) = snap.pending_count {
                let _ = writeln!(out, "Pending:     {} links", thousands(pending));
            }
        }
        JobKind::Main => {
            let _ = writeln!(out, "Phase:       {}", snap.phase);
            let _ = writeln!(out, "Searches:    {}", thousands(snap.searches_count.unwrap_or(0)));
            let _ = writeln!(out, "Details:     {}", thousands(snap.details_count.unwrap_or(0)));
            render_saved(out, snap);
        }
    }
}

fn render_saved(out: &mut String, snap: &CheckpointSnapshot) {
    if let Some(saved) = snap.saved_count {
        let _ = writeln!(out, "Saved:       {} restaurants", thousands(saved));
    }
}

/// `done / total (pct%)`, or just `done` when the total is unknown.
fn progress(done: u64, total: Option<u64>) -> String {
    match total.filter(|&t| t > 0) {
        Some(total) => format!(
            "{} / {} ({:.1}%)",
            thousands(done),
            thousands(total),
            done as f64 / total as f64 * 100.0
        ),
        None => thousands(done),
    }
}

fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Build the report from the live process table and checkpoints.
///
/// Shows the running job; when nothing runs, the most recent checkpoint
/// (Recovery first, then Main).
pub fn status_report<H: ProcessHost>(
    host: &H,
    classifier: &JobClassifier,
    reader: &CheckpointReader,
    aux_pattern: &Regex,
    threshold: Duration,
    now: DateTime<Utc>,
) -> String {
    let procs = host.list().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to list processes for status report");
        Vec::new()
    });
    let aux_count = process::matching_pids(&procs, aux_pattern).len();

    let (kind, running) = match classifier.classify(&procs) {
        Some(kind) => (kind, true),
        None => {
            let recent = [JobKind::Recovery, JobKind::Main]
                .into_iter()
                .find(|&k| reader.read(k).is_some());
            match recent {
                Some(kind) => (kind, false),
                None => return NO_DATA.to_string(),
            }
        }
    };

    let snapshot = reader.read(kind);
    let staleness = staleness::evaluate(snapshot.as_ref(), now, threshold);
    render_status(
        kind,
        snapshot.as_ref(),
        RunStatus::new(running, staleness),
        aux_count,
        now,
    )
}
