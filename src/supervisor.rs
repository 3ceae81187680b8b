/// Restart controller: one poll tick at a time, decide whether to leave the
/// active job alone, restart a stalled one, or relaunch one that vanished with
/// work left.
///
/// States (persisted in `SupervisorState::phase`):
///
/// - `Idle`: no job running, nothing to recover.
/// - `Monitoring`: a job is running and its checkpoint is fresh or signal-less.
/// - `Stalling`: a job is running but its checkpoint is older than the threshold.
/// - `Restarting`: killing and relaunching (transient within a tick).
/// - `CrashRecovery`: no job running but the last one left incomplete work.
///
/// Every relaunch passes the restart cooldown first, and each incident alerts
/// once no matter how many ticks it takes to resolve.
use crate::checkpoint::{self, CheckpointFormat, CheckpointReader, CheckpointSnapshot};
use crate::clock::Clock;
use crate::config::WatchConfig;
use crate::job::{JobClassifier, JobKind, ProcessInfo};
use crate::launcher::Launcher;
use crate::notify::{notify_best_effort, Notifier};
use crate::process::{self, KillSignal, ProcessHost};
use crate::staleness::{self, Staleness};
use crate::state::{Incident, IncidentCause, StateFile, SupervisorPhase, SupervisorState};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::future::Future;
use std::time::Duration;

/// Tunables for the restart controller.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub stale_threshold: Duration,
    pub restart_cooldown: Duration,
    pub kill_grace: Duration,
    pub aux_pattern: Regex,
    pub aux_ceiling: usize,
    pub aux_excess_grace: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &WatchConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            poll_interval: config.poll_interval(),
            stale_threshold: config.stale_threshold(),
            restart_cooldown: config.restart_cooldown(),
            kill_grace: config.kill_grace(),
            aux_pattern: Regex::new(&config.auxiliary.pattern)?,
            aux_ceiling: config.auxiliary.ceiling,
            aux_excess_grace: Duration::from_secs(config.auxiliary.excess_grace_secs),
        })
    }
}

/// What one tick decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Process table unavailable; nothing was decided.
    Unknown,
    Idle,
    Monitoring { kind: JobKind, staleness: Staleness },
    Restarted { kind: JobKind, cause: IncidentCause, pid: u32 },
    /// Restart needed but the cooldown has not elapsed.
    RestartDeferred { kind: JobKind, cause: IncidentCause, retry_in: Duration },
    RestartFailed { kind: JobKind, cause: IncidentCause },
}

/// Result of a tick, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub outcome: TickOutcome,
    /// Auxiliary processes killed by leak cleanup (not restarts).
    pub aux_killed: usize,
}

pub struct Supervisor<H, L, N, C> {
    settings: SupervisorSettings,
    classifier: JobClassifier,
    reader: CheckpointReader,
    host: H,
    launcher: L,
    notifier: N,
    clock: C,
    state: SupervisorState,
    state_file: Option<StateFile>,
    /// When the auxiliary count first exceeded the ceiling.
    excess_since: Option<DateTime<Utc>>,
}

impl<H, L, N, C> Supervisor<H, L, N, C>
where
    H: ProcessHost,
    L: Launcher,
    N: Notifier,
    C: Clock,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: SupervisorSettings,
        classifier: JobClassifier,
        reader: CheckpointReader,
        host: H,
        launcher: L,
        notifier: N,
        clock: C,
    ) -> Self {
        Self {
            settings,
            classifier,
            reader,
            host,
            launcher,
            notifier,
            clock,
            state: SupervisorState::default(),
            state_file: None,
            excess_since: None,
        }
    }

    /// Persist state to `file` after every tick, starting from what it holds.
    pub fn with_state_file(mut self, file: StateFile) -> Self {
        self.state = file.load();
        tracing::debug!(path = %file.path().display(), state = ?self.state, "loaded supervisor state");
        self.state_file = Some(file);
        self
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    /// Poll until `shutdown` resolves (checked between ticks) or `max_ticks`
    /// ticks have run.
    pub async fn run<F>(&mut self, shutdown: F, max_ticks: Option<u64>)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticks = 0u64;
        loop {
            let report = self.tick().await;
            ticks += 1;
            tracing::debug!(tick = ticks, ?report, "tick complete");

            if max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
            tokio::select! {
                _ = self.clock.sleep(self.settings.poll_interval) => {}
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested, stopping poll loop");
                    break;
                }
            }
        }
    }

    /// One poll: classify, evaluate, act, clean up, persist.
    pub async fn tick(&mut self) -> TickReport {
        let now = self.clock.now();

        let procs = match self.host.list() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list processes, skipping tick");
                self.persist(now);
                return TickReport {
                    outcome: TickOutcome::Unknown,
                    aux_killed: 0,
                };
            }
        };

        let mut aux_killed = self.cleanup_auxiliaries(&procs, now);

        let outcome = match self.classifier.classify(&procs) {
            Some(kind) => self.on_job_running(kind, &procs, now).await,
            None => {
                aux_killed += self.kill_stray_auxiliaries(&procs);
                self.on_no_job(now).await
            }
        };

        self.persist(now);
        TickReport {
            outcome,
            aux_killed,
        }
    }

    async fn on_job_running(
        &mut self,
        kind: JobKind,
        procs: &[ProcessInfo],
        now: DateTime<Utc>,
    ) -> TickOutcome {
        self.state.last_detected_kind = Some(kind);
        let snapshot = self.reader.read(kind);
        let staleness = staleness::evaluate(snapshot.as_ref(), now, self.settings.stale_threshold);

        if let Staleness::Stale(elapsed) = staleness {
            return self.on_stall(kind, elapsed, procs, now).await;
        }

        if let Some(incident) = self.state.incident.take() {
            tracing::info!(%kind, cause = ?incident.cause, "job healthy again, incident resolved");
        }
        self.state.phase = SupervisorPhase::Monitoring;
        tracing::debug!(%kind, ?staleness, "job running");
        TickOutcome::Monitoring { kind, staleness }
    }

    async fn on_stall(
        &mut self,
        kind: JobKind,
        elapsed: Duration,
        procs: &[ProcessInfo],
        now: DateTime<Utc>,
    ) -> TickOutcome {
        let cause = IncidentCause::Stalled;
        self.state.phase = SupervisorPhase::Stalling;
        tracing::warn!(%kind, elapsed_secs = elapsed.as_secs(), "job stalled");

        if self.open_incident(kind, cause, now) {
            let text = format!(
                "⚠️ {} scraper STALLED: no checkpoint update for {}m. Restarting.",
                kind,
                elapsed.as_secs() / 60
            );
            notify_best_effort(&self.notifier, &text).await;
        }

        if let Some(retry_in) = self.cooldown_remaining(now) {
            tracing::info!(%kind, retry_in_secs = retry_in.as_secs(), "restart deferred by cooldown");
            return TickOutcome::RestartDeferred {
                kind,
                cause,
                retry_in,
            };
        }

        self.state.phase = SupervisorPhase::Restarting;
        let pids = self.classifier.job_processes(kind, procs);
        let termination =
            process::terminate_tree(&self.host, &self.clock, &pids, self.settings.kill_grace)
                .await;
        tracing::info!(%kind, ?termination, "stalled job terminated");

        // Workers the job spawned die with it; the relaunch starts its own.
        match self.host.list() {
            Ok(after) => {
                let aux = process::matching_pids(&after, &self.settings.aux_pattern);
                process::signal_all(&self.host, &aux, KillSignal::Kill);
            }
            Err(e) => tracing::warn!(error = %e, "failed to list processes for worker cleanup"),
        }

        let outcome = self.relaunch(kind, cause).await;
        if matches!(outcome, TickOutcome::RestartFailed { .. }) {
            self.state.phase = SupervisorPhase::Stalling;
        }
        outcome
    }

    async fn on_no_job(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let Some(kind) = self.state.last_detected_kind else {
            self.state.phase = SupervisorPhase::Idle;
            return TickOutcome::Idle;
        };

        let snapshot = self.reader.read(kind);
        let Some(snapshot) = snapshot.filter(CheckpointSnapshot::has_incomplete_work) else {
            if self.state.phase != SupervisorPhase::Idle {
                tracing::info!(%kind, "job no longer running, nothing left to recover");
            }
            self.state.incident = None;
            self.state.phase = SupervisorPhase::Idle;
            return TickOutcome::Idle;
        };

        let cause = IncidentCause::Crashed;
        self.state.phase = SupervisorPhase::CrashRecovery;
        tracing::warn!(%kind, phase = %snapshot.phase, pending = ?snapshot.pending_count, "job not running with work left");

        if self.open_incident(kind, cause, now) {
            let text = format!(
                "🔴 {} scraper is not running but has work left ({}). Restarting.",
                kind,
                describe_progress(&snapshot)
            );
            notify_best_effort(&self.notifier, &text).await;
        }

        if let Some(retry_in) = self.cooldown_remaining(now) {
            tracing::info!(%kind, retry_in_secs = retry_in.as_secs(), "crash recovery deferred by cooldown");
            self.state.phase = SupervisorPhase::Idle;
            return TickOutcome::RestartDeferred {
                kind,
                cause,
                retry_in,
            };
        }

        let outcome = self.relaunch(kind, cause).await;
        if matches!(outcome, TickOutcome::RestartFailed { .. }) {
            self.state.phase = SupervisorPhase::Idle;
        }
        outcome
    }

    /// Record the restart, refresh the checkpoint timestamp, spawn the job.
    async fn relaunch(&mut self, kind: JobKind, cause: IncidentCause) -> TickOutcome {
        let now = self.clock.now();
        self.state.last_restart_time = Some(now);
        self.state.restart_count += 1;
        self.refresh_checkpoint(kind, now);

        match self.launcher.launch(kind) {
            Ok(pid) => {
                tracing::info!(%kind, pid, ?cause, "job relaunched");
                let text = format!("✅ {kind} scraper restarted (pid {pid}).");
                notify_best_effort(&self.notifier, &text).await;
                self.state.incident = None;
                self.state.last_detected_kind = Some(kind);
                self.state.phase = SupervisorPhase::Monitoring;
                TickOutcome::Restarted { kind, cause, pid }
            }
            Err(e) => {
                tracing::error!(%kind, error = %e, "failed to relaunch job");
                let text = format!("❌ {kind} scraper restart FAILED: {e}");
                notify_best_effort(&self.notifier, &text).await;
                TickOutcome::RestartFailed { kind, cause }
            }
        }
    }

    /// Grant the relaunched job a grace period before the next staleness check.
    fn refresh_checkpoint(&self, kind: JobKind, now: DateTime<Utc>) {
        let Some(source) = self.reader.source(kind) else {
            return;
        };
        if source.format != CheckpointFormat::Progress || !source.path.exists() {
            return;
        }
        if let Err(e) = checkpoint::touch_last_update(&source.path, now) {
            tracing::warn!(%kind, error = %e, "failed to refresh checkpoint timestamp");
        }
    }

    /// Open an incident; `false` if this one was already alerted.
    fn open_incident(&mut self, kind: JobKind, cause: IncidentCause, now: DateTime<Utc>) -> bool {
        if matches!(self.state.incident, Some(i) if i.kind == kind && i.cause == cause) {
            return false;
        }
        self.state.incident = Some(Incident {
            kind,
            cause,
            since: now,
        });
        true
    }

    /// Time left before another relaunch is allowed, if any.
    fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.state.last_restart_time?;
        // A restart "in the future" means the wall clock moved back.
        let elapsed = (now - last).to_std().ok()?;
        self.settings.restart_cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Leak mitigation: kill auxiliaries once their count has stayed above
    /// the ceiling for the excess grace period. Not a restart.
    pub fn cleanup_auxiliaries(&mut self, procs: &[ProcessInfo], now: DateTime<Utc>) -> usize {
        let pids = process::matching_pids(procs, &self.settings.aux_pattern);
        if pids.len() <= self.settings.aux_ceiling {
            self.excess_since = None;
            return 0;
        }

        let since = *self.excess_since.get_or_insert(now);
        let lasted = (now - since).to_std().unwrap_or_default();
        if lasted < self.settings.aux_excess_grace {
            tracing::debug!(
                count = pids.len(),
                ceiling = self.settings.aux_ceiling,
                "auxiliary process count above ceiling"
            );
            return 0;
        }

        tracing::warn!(
            count = pids.len(),
            ceiling = self.settings.aux_ceiling,
            "too many auxiliary processes, killing them"
        );
        self.excess_since = None;
        process::signal_all(&self.host, &pids, KillSignal::Kill)
    }

    /// With no job running, every auxiliary process is a leftover.
    fn kill_stray_auxiliaries(&self, procs: &[ProcessInfo]) -> usize {
        let pids = process::matching_pids(procs, &self.settings.aux_pattern);
        if pids.is_empty() {
            return 0;
        }
        tracing::info!(count = pids.len(), "killing stray auxiliary processes");
        process::signal_all(&self.host, &pids, KillSignal::Kill)
    }

    fn persist(&mut self, now: DateTime<Utc>) {
        self.state.updated_at = Some(now);
        if let Some(file) = &self.state_file {
            if let Err(e) = file.save(&self.state) {
                tracing::warn!(error = %e, "failed to persist supervisor state");
            }
        }
    }
}

fn describe_progress(snapshot: &CheckpointSnapshot) -> String {
    let mut parts = vec![format!("phase {}", snapshot.phase)];
    if let Some(pending) = snapshot.pending_count.filter(|&p| p > 0) {
        parts.push(format!("{pending} pending"));
    }
    match (snapshot.completed_count, snapshot.total_count) {
        (Some(done), Some(total)) => parts.push(format!("{done}/{total} done")),
        (Some(done), None) => parts.push(format!("{done} done")),
        _ => {}
    }
    parts.join(", ")
}
