/// Job kinds and process-table classification.
///
/// Exactly one job kind is expected to run at a time. A job's process tree can
/// embed another job's identifying token (the recovery job drives the scraper
/// package internally), so classification walks a fixed priority list and
/// returns the first kind with a matching process.
use crate::config::JobsConfig;
use crate::process;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The mutually exclusive long-running jobs the watchdog supervises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Recovery,
    Rescrape,
    Main,
}

impl JobKind {
    /// Classification order: container jobs before jobs whose token they embed.
    pub const PRIORITY: [JobKind; 3] = [JobKind::Recovery, JobKind::Rescrape, JobKind::Main];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Recovery => "recovery",
            JobKind::Rescrape => "rescrape",
            JobKind::Main => "main",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    /// Full command line (argv joined by spaces).
    pub command: String,
}

impl ProcessInfo {
    pub fn new(pid: u32, ppid: u32, command: impl Into<String>) -> Self {
        Self {
            pid,
            ppid,
            command: command.into(),
        }
    }

    /// True for `grep`/`pgrep`/`ps` invocations, which carry the searched
    /// token in their own argv.
    fn is_search_tool(&self) -> bool {
        let program = self.command.split_whitespace().next().unwrap_or_default();
        let name = program.rsplit('/').next().unwrap_or(program);
        matches!(name, "grep" | "egrep" | "pgrep" | "ps")
    }
}

/// Identifying substrings for one job kind.
#[derive(Debug, Clone)]
pub struct JobMatcher {
    pub kind: JobKind,
    pub patterns: Vec<String>,
}

impl JobMatcher {
    pub fn matches(&self, proc: &ProcessInfo) -> bool {
        if proc.is_search_tool() {
            return false;
        }
        self.patterns
            .iter()
            .filter(|p| !p.is_empty())
            .any(|p| proc.command.contains(p.as_str()))
    }
}

/// Ordered `(JobKind, matcher)` list. First match wins.
#[derive(Debug, Clone)]
pub struct JobClassifier {
    matchers: Vec<JobMatcher>,
}

impl JobClassifier {
    pub fn new(matchers: Vec<JobMatcher>) -> Self {
        Self { matchers }
    }

    /// Build the classifier from job config, in `JobKind::PRIORITY` order.
    pub fn from_config(jobs: &JobsConfig) -> Self {
        let matchers = JobKind::PRIORITY
            .iter()
            .map(|&kind| JobMatcher {
                kind,
                patterns: jobs.get(kind).patterns.clone(),
            })
            .collect();
        Self::new(matchers)
    }

    /// Which job kind is active, if any.
    pub fn classify(&self, procs: &[ProcessInfo]) -> Option<JobKind> {
        self.matchers
            .iter()
            .find(|m| procs.iter().any(|p| m.matches(p)))
            .map(|m| m.kind)
    }

    /// PIDs of every process matching `kind` plus all their descendants.
    pub fn job_processes(&self, kind: JobKind, procs: &[ProcessInfo]) -> Vec<u32> {
        let roots: Vec<u32> = self
            .matchers
            .iter()
            .filter(|m| m.kind == kind)
            .flat_map(|m| procs.iter().filter(move |p| m.matches(p)))
            .map(|p| p.pid)
            .collect();

        let mut pids: BTreeSet<u32> = roots.iter().copied().collect();
        for root in roots {
            pids.extend(process::descendants(root, procs));
        }
        pids.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> JobClassifier {
        JobClassifier::from_config(&JobsConfig::default())
    }

    #[test]
    fn test_no_processes_is_none() {
        assert_eq!(classifier().classify(&[]), None);
    }

    #[test]
    fn test_unrelated_processes_is_none() {
        let procs = vec![
            ProcessInfo::new(1, 0, "/sbin/launchd"),
            ProcessInfo::new(200, 1, "/usr/bin/python3 other_tool.py"),
        ];
        assert_eq!(classifier().classify(&procs), None);
    }

    #[test]
    fn test_main_detected() {
        let procs = vec![ProcessInfo::new(
            300,
            1,
            "/usr/bin/python3 -m gmaps_scraper.cli --resume",
        )];
        assert_eq!(classifier().classify(&procs), Some(JobKind::Main));
    }

    #[test]
    fn test_rescrape_detected() {
        let procs = vec![ProcessInfo::new(
            301,
            1,
            "python3 rescrape_rejected.py",
        )];
        assert_eq!(classifier().classify(&procs), Some(JobKind::Rescrape));
    }

    #[test]
    fn test_recovery_child_embedding_main_token_is_recovery() {
        // The recovery job imports the scraper package; its workers carry the
        // main job's token in argv.
        let procs = vec![
            ProcessInfo::new(400, 1, "python3 ../recovery_search.py --skip-search"),
            ProcessInfo::new(
                401,
                400,
                "python3 -c from gmaps_scraper.extractors import details",
            ),
        ];
        assert_eq!(classifier().classify(&procs), Some(JobKind::Recovery));
    }

    #[test]
    fn test_order_of_process_list_does_not_matter() {
        let procs = vec![
            ProcessInfo::new(401, 400, "python3 -m gmaps_scraper worker"),
            ProcessInfo::new(400, 1, "bash run_full_recovery.sh"),
        ];
        assert_eq!(classifier().classify(&procs), Some(JobKind::Recovery));
    }

    #[test]
    fn test_grep_invocation_is_ignored() {
        let procs = vec![
            ProcessInfo::new(500, 1, "grep gmaps_scraper"),
            ProcessInfo::new(501, 1, "/usr/bin/pgrep -f recovery_search"),
        ];
        assert_eq!(classifier().classify(&procs), None);
    }

    #[test]
    fn test_custom_priority_is_respected() {
        let classifier = JobClassifier::new(vec![
            JobMatcher {
                kind: JobKind::Main,
                patterns: vec!["alpha".to_string()],
            },
            JobMatcher {
                kind: JobKind::Recovery,
                patterns: vec!["alpha-beta".to_string()],
            },
        ]);
        let procs = vec![ProcessInfo::new(1, 0, "run alpha-beta")];
        assert_eq!(classifier.classify(&procs), Some(JobKind::Main));
    }

    #[test]
    fn test_empty_pattern_never_matches() {
        let classifier = JobClassifier::new(vec![JobMatcher {
            kind: JobKind::Main,
            patterns: vec![String::new()],
        }]);
        let procs = vec![ProcessInfo::new(1, 0, "anything")];
        assert_eq!(classifier.classify(&procs), None);
    }

    #[test]
    fn test_job_processes_includes_descendants() {
        let procs = vec![
            ProcessInfo::new(10, 1, "python3 -m gmaps_scraper.cli"),
            ProcessInfo::new(11, 10, "chromedriver --port=9515"),
            ProcessInfo::new(12, 11, "Google Chrome --headless bota"),
            ProcessInfo::new(20, 1, "unrelated"),
        ];
        let pids = classifier().job_processes(JobKind::Main, &procs);
        assert_eq!(pids, vec![10, 11, 12]);
    }

    #[test]
    fn test_job_processes_for_inactive_kind_is_empty() {
        let procs = vec![ProcessInfo::new(10, 1, "python3 -m gmaps_scraper.cli")];
        assert!(classifier()
            .job_processes(JobKind::Rescrape, &procs)
            .is_empty());
    }

    #[test]
    fn test_job_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobKind::Recovery).unwrap(),
            "\"recovery\""
        );
        assert_eq!(JobKind::Main.to_string(), "main");
    }
}
