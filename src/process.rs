/// Process table inspection and signalling.
///
/// `PsProcessHost` reads the table from `ps` and signals through `nix`.
/// Everything here is best-effort: a process that exits between listing and
/// signalling is not an error.
use crate::clock::Clock;
use crate::job::ProcessInfo;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

/// Signals the watchdog sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM: ask the process to exit.
    Terminate,
    /// SIGKILL: force it.
    Kill,
}

impl KillSignal {
    fn as_nix(self) -> Signal {
        match self {
            KillSignal::Terminate => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Access to the host's processes.
pub trait ProcessHost: Send + Sync {
    /// Snapshot of running processes.
    fn list(&self) -> Result<Vec<ProcessInfo>, ProcessError>;
    /// Deliver `signal` to `pid`. A process that is already gone is `Ok`.
    fn signal(&self, pid: u32, signal: KillSignal) -> Result<(), ProcessError>;
}

/// Real process host backed by `ps` and `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsProcessHost;

impl ProcessHost for PsProcessHost {
    fn list(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
        let output = std::process::Command::new("ps")
            .args(["-axww", "-o", "pid=,ppid=,args="])
            .output()
            .map_err(|e| ProcessError::List { source: e })?;
        if !output.status.success() {
            return Err(ProcessError::ListStatus {
                code: output.status.code(),
            });
        }
        let own_pid = std::process::id();
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ps_output(&text)
            .into_iter()
            .filter(|p| p.pid != own_pid)
            .collect())
    }

    fn signal(&self, pid: u32, signal: KillSignal) -> Result<(), ProcessError> {
        let raw = i32::try_from(pid).map_err(|_| ProcessError::InvalidPid { pid })?;
        if raw <= 1 {
            return Err(ProcessError::InvalidPid { pid });
        }
        match signal::kill(Pid::from_raw(raw), signal.as_nix()) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(ProcessError::Signal { pid, errno }),
        }
    }
}

/// Parse `ps -o pid=,ppid=,args=` output. Malformed lines are skipped.
pub fn parse_ps_output(text: &str) -> Vec<ProcessInfo> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, rest) = line.split_once(char::is_whitespace)?;
            let rest = rest.trim_start();
            let (ppid, command) = match rest.split_once(char::is_whitespace) {
                Some((ppid, command)) => (ppid, command.trim()),
                None => (rest, ""),
            };
            Some(ProcessInfo::new(
                pid.parse().ok()?,
                ppid.parse().ok()?,
                command,
            ))
        })
        .collect()
}

/// All transitive children of `root`, by parent pid.
pub fn descendants(root: u32, procs: &[ProcessInfo]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for p in procs {
        if p.pid != p.ppid {
            children.entry(p.ppid).or_default().push(p.pid);
        }
    }

    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if child != root && seen.insert(child) {
                queue.push_back(child);
            }
        }
    }
    seen.into_iter().collect()
}

/// PIDs of processes whose command line matches `pattern`.
pub fn matching_pids(procs: &[ProcessInfo], pattern: &Regex) -> Vec<u32> {
    procs
        .iter()
        .filter(|p| pattern.is_match(&p.command))
        .map(|p| p.pid)
        .collect()
}

/// Signal every pid, logging failures. Returns how many were delivered.
pub fn signal_all<H: ProcessHost>(host: &H, pids: &[u32], signal: KillSignal) -> usize {
    pids.iter()
        .filter(|&&pid| match host.signal(pid, signal) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(pid, ?signal, error = %e, "failed to signal process");
                false
            }
        })
        .count()
}

/// What `terminate_tree` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Termination {
    pub terminated: usize,
    /// Processes that ignored SIGTERM and were killed.
    pub forced: usize,
}

/// SIGTERM `pids`, wait `grace`, then SIGKILL whatever is still alive.
pub async fn terminate_tree<H: ProcessHost, C: Clock>(
    host: &H,
    clock: &C,
    pids: &[u32],
    grace: Duration,
) -> Termination {
    if pids.is_empty() {
        return Termination::default();
    }

    let terminated = signal_all(host, pids, KillSignal::Terminate);
    tracing::info!(count = terminated, grace_secs = grace.as_secs(), "sent SIGTERM");
    clock.sleep(grace).await;

    let survivors: Vec<u32> = match host.list() {
        Ok(procs) => {
            let alive: BTreeSet<u32> = procs.iter().map(|p| p.pid).collect();
            pids.iter().copied().filter(|p| alive.contains(p)).collect()
        }
        // Can't tell who survived; SIGKILL on a dead pid is harmless.
        Err(e) => {
            tracing::warn!(error = %e, "failed to list processes after SIGTERM");
            pids.to_vec()
        }
    };

    let forced = signal_all(host, &survivors, KillSignal::Kill);
    if forced > 0 {
        tracing::warn!(count = forced, "processes ignored SIGTERM, sent SIGKILL");
    }
    Termination { terminated, forced }
}

/// Errors from process inspection and control.
#[derive(Debug)]
pub enum ProcessError {
    /// Failed to run `ps`.
    List { source: std::io::Error },
    /// `ps` exited unsuccessfully.
    ListStatus { code: Option<i32> },
    InvalidPid { pid: u32 },
    Signal { pid: u32, errno: Errno },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::List { source } => write!(f, "failed to run ps: {source}"),
            ProcessError::ListStatus { code } => write!(f, "ps exited with status {code:?}"),
            ProcessError::InvalidPid { pid } => write!(f, "refusing to signal pid {pid}"),
            ProcessError::Signal { pid, errno } => {
                write!(f, "failed to signal pid {pid}: {errno}")
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::List { source } => Some(source),
            ProcessError::Signal { errno, .. } => Some(errno),
            ProcessError::ListStatus { .. } | ProcessError::InvalidPid { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClock, FakeProcessHost};

    #[test]
    fn test_parse_ps_output() {
        let text = "    1     0 /sbin/init splash\n  412     1 python3 -m gmaps_scraper.cli --resume\n\
                    garbage line\n  413   412 \n";
        let procs = parse_ps_output(text);
        assert_eq!(
            procs,
            vec![
                ProcessInfo::new(1, 0, "/sbin/init splash"),
                ProcessInfo::new(412, 1, "python3 -m gmaps_scraper.cli --resume"),
                ProcessInfo::new(413, 412, ""),
            ]
        );
    }

    #[test]
    fn test_descendants_walks_tree() {
        let procs = vec![
            ProcessInfo::new(10, 1, "root"),
            ProcessInfo::new(11, 10, "child"),
            ProcessInfo::new(12, 11, "grandchild"),
            ProcessInfo::new(13, 10, "child2"),
            ProcessInfo::new(20, 1, "other"),
        ];
        assert_eq!(descendants(10, &procs), vec![11, 12, 13]);
        assert!(descendants(20, &procs).is_empty());
    }

    #[test]
    fn test_descendants_tolerates_cycles() {
        let procs = vec![
            ProcessInfo::new(10, 11, "a"),
            ProcessInfo::new(11, 10, "b"),
        ];
        assert_eq!(descendants(10, &procs), vec![11]);
    }

    #[test]
    fn test_matching_pids() {
        let procs = vec![
            ProcessInfo::new(1, 0, "/Applications/Google Chrome --user-data-dir=/tmp/bota-1"),
            ProcessInfo::new(2, 0, "/Applications/Google Chrome --profile personal"),
            ProcessInfo::new(3, 0, "python3"),
        ];
        let re = Regex::new("Google Chrome.*bota").unwrap();
        assert_eq!(matching_pids(&procs, &re), vec![1]);
    }

    #[test]
    fn test_real_host_refuses_init() {
        let err = PsProcessHost.signal(1, KillSignal::Terminate).unwrap_err();
        assert!(matches!(err, ProcessError::InvalidPid { pid: 1 }));
    }

    #[tokio::test]
    async fn test_terminate_tree_graceful() {
        let host = FakeProcessHost::new(vec![
            ProcessInfo::new(10, 1, "job"),
            ProcessInfo::new(11, 10, "worker"),
        ]);
        let clock = FakeClock::new();
        let start = clock.now();

        let result = terminate_tree(&host, &clock, &[10, 11], Duration::from_secs(5)).await;

        assert_eq!(result, Termination { terminated: 2, forced: 0 });
        assert!(host.processes().is_empty());
        assert_eq!((clock.now() - start).num_seconds(), 5);
    }

    #[tokio::test]
    async fn test_terminate_tree_forces_stubborn_processes() {
        let host = FakeProcessHost::new(vec![
            ProcessInfo::new(10, 1, "job"),
            ProcessInfo::new(11, 10, "stubborn"),
        ]);
        host.ignore_sigterm(11);
        let clock = FakeClock::new();

        let result = terminate_tree(&host, &clock, &[10, 11], Duration::from_secs(5)).await;

        assert_eq!(result, Termination { terminated: 2, forced: 1 });
        assert!(host.processes().is_empty());
        assert_eq!(
            host.signals(),
            vec![
                (10, KillSignal::Terminate),
                (11, KillSignal::Terminate),
                (11, KillSignal::Kill),
            ]
        );
    }

    #[tokio::test]
    async fn test_terminate_tree_empty_is_noop() {
        let host = FakeProcessHost::new(vec![]);
        let clock = FakeClock::new();
        let start = clock.now();
        let result = terminate_tree(&host, &clock, &[], Duration::from_secs(5)).await;
        assert_eq!(result, Termination::default());
        assert_eq!(clock.now(), start);
    }
}
