//! In-memory collaborators for driving the supervisor in tests.

use crate::clock::Clock;
use crate::job::{JobKind, ProcessInfo};
use crate::launcher::{LaunchError, Launcher};
use crate::notify::{Notifier, NotifyError};
use crate::process::{KillSignal, ProcessError, ProcessHost};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Manually driven clock. `sleep` advances time instead of waiting.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new() -> Self {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(duration).unwrap();
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Default)]
struct HostInner {
    procs: Vec<ProcessInfo>,
    signals: Vec<(u32, KillSignal)>,
    ignore_sigterm: BTreeSet<u32>,
    fail_list: bool,
}

/// Process table held in memory. Delivered signals remove processes.
#[derive(Clone, Default)]
pub struct FakeProcessHost {
    inner: Arc<Mutex<HostInner>>,
}

impl FakeProcessHost {
    pub fn new(procs: Vec<ProcessInfo>) -> Self {
        let host = Self::default();
        host.inner.lock().unwrap().procs = procs;
        host
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.inner.lock().unwrap().procs.clone()
    }

    pub fn add(&self, proc: ProcessInfo) {
        self.inner.lock().unwrap().procs.push(proc);
    }

    pub fn signals(&self) -> Vec<(u32, KillSignal)> {
        self.inner.lock().unwrap().signals.clone()
    }

    pub fn ignore_sigterm(&self, pid: u32) {
        self.inner.lock().unwrap().ignore_sigterm.insert(pid);
    }

    pub fn fail_list(&self, fail: bool) {
        self.inner.lock().unwrap().fail_list = fail;
    }
}

impl ProcessHost for FakeProcessHost {
    fn list(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_list {
            return Err(ProcessError::ListStatus { code: Some(1) });
        }
        Ok(inner.procs.clone())
    }

    fn signal(&self, pid: u32, signal: KillSignal) -> Result<(), ProcessError> {
        let mut inner = self.inner.lock().unwrap();
        inner.signals.push((pid, signal));
        let dies = signal == KillSignal::Kill || !inner.ignore_sigterm.contains(&pid);
        if dies {
            inner.procs.retain(|p| p.pid != pid);
        }
        Ok(())
    }
}

/// Records launches; optionally adds the launched process to a fake host.
#[derive(Clone)]
pub struct FakeLauncher {
    launches: Arc<Mutex<Vec<JobKind>>>,
    host: Option<FakeProcessHost>,
    commands: BTreeMap<JobKind, String>,
    fail: Arc<AtomicBool>,
    next_pid: Arc<AtomicU32>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            launches: Arc::default(),
            host: None,
            commands: BTreeMap::from([
                (JobKind::Recovery, "python3 ../recovery_search.py --skip-search".to_string()),
                (JobKind::Rescrape, "python3 rescrape_rejected.py".to_string()),
                (JobKind::Main, "python3 -m gmaps_scraper.cli".to_string()),
            ]),
            fail: Arc::default(),
            next_pid: Arc::new(AtomicU32::new(5000)),
        }
    }

    /// Launched jobs appear in `host`'s process table.
    pub fn spawning_into(host: &FakeProcessHost) -> Self {
        Self {
            host: Some(host.clone()),
            ..Self::new()
        }
    }

    pub fn launches(&self) -> Vec<JobKind> {
        self.launches.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, kind: JobKind) -> Result<u32, LaunchError> {
        self.launches.lock().unwrap().push(kind);
        if self.fail.load(Ordering::SeqCst) {
            return Err(LaunchError::Spawn {
                kind,
                source: std::io::Error::other("spawn refused"),
            });
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if let Some(host) = &self.host {
            let command = self.commands.get(&kind).cloned().unwrap_or_default();
            host.add(ProcessInfo::new(pid, 1, command));
        }
        Ok(pid)
    }
}

/// Captures every message; can be told to fail delivery.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.messages.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(NotifyError::Rejected {
                status: 500,
                description: "test failure".to_string(),
            });
        }
        Ok(())
    }
}
