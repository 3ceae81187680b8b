mod checkpoint;
mod clock;
mod config;
mod data_dir;
mod job;
mod launcher;
mod lock;
mod notify;
mod process;
mod report;
mod signals;
mod staleness;
mod state;
mod supervisor;
#[cfg(test)]
mod testing;

use crate::checkpoint::CheckpointReader;
use crate::clock::{Clock, SystemClock};
use crate::config::WatchConfig;
use crate::data_dir::DataDir;
use crate::job::JobClassifier;
use crate::launcher::CommandLauncher;
use crate::lock::{InstanceLock, LockError};
use crate::notify::{notify_best_effort, ConfiguredNotifier};
use crate::process::PsProcessHost;
use crate::signals::ShutdownSignals;
use crate::state::StateFile;
use crate::supervisor::{Supervisor, SupervisorSettings};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: i32 = 1;
const EXIT_ALREADY_RUNNING: i32 = 2;

/// Watchdog for long-running scraper jobs: detects which job is active,
/// restarts it when its checkpoint stops advancing, relaunches it when it
/// dies with work left, and reports what it did.
#[derive(Parser, Debug)]
#[command(name = "scrapewatch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "scrapewatch.toml")]
    config: PathBuf,

    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// Staleness threshold in seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    threshold: Option<u64>,

    /// Minimum seconds between restarts (overrides config)
    #[arg(long, value_name = "SECS")]
    cooldown: Option<u64>,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the current scraper status and exit
    #[arg(long)]
    status: bool,

    /// With --status, also send the report through the notifier
    #[arg(long, requires = "status")]
    notify: bool,

    /// Debug logging (every tick decision)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut WatchConfig) {
        if let Some(secs) = self.interval {
            config.watchdog.poll_interval_secs = secs;
        }
        if let Some(secs) = self.threshold {
            config.watchdog.stale_threshold_secs = secs;
        }
        if let Some(secs) = self.cooldown {
            config.watchdog.restart_cooldown_secs = secs;
        }
    }

    fn default_filter(&self) -> &'static str {
        if self.verbose {
            "scrapewatch=debug"
        } else if self.quiet {
            "scrapewatch=warn"
        } else {
            "scrapewatch=info"
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let mut config = match WatchConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_FAILURE;
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        return EXIT_FAILURE;
    }

    if cli.dry_run {
        println!("scrapewatch v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("{config:#?}");
        println!("Dry run mode, config validated, not running.");
        return 0;
    }

    let data_dir = DataDir::new(config.resolve(&config.watchdog.data_dir));
    if let Err(e) = data_dir.init() {
        eprintln!(
            "Error: failed to create data dir {}: {e}",
            data_dir.root().display()
        );
        return EXIT_FAILURE;
    }
    if let Err(e) = init_logging(&cli, &data_dir.log()) {
        eprintln!("Error: failed to open log file {}: {e}", data_dir.log().display());
        return EXIT_FAILURE;
    }
    tracing::debug!(?cli, "parsed CLI arguments");

    let settings = match SupervisorSettings::from_config(&config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: invalid auxiliary pattern: {e}");
            return EXIT_FAILURE;
        }
    };
    let classifier = JobClassifier::from_config(&config.jobs);
    let reader = CheckpointReader::from_config(&config);
    let notifier = ConfiguredNotifier::from_config(&config.notify);

    if cli.status {
        let text = report::status_report(
            &PsProcessHost,
            &classifier,
            &reader,
            &settings.aux_pattern,
            settings.stale_threshold,
            SystemClock.now(),
        );
        println!("{text}");
        if cli.notify {
            notify_best_effort(&notifier, &text).await;
        }
        return 0;
    }

    let lock = match InstanceLock::acquire(&data_dir.lock()) {
        Ok(lock) => lock,
        Err(e @ LockError::Held { .. }) => {
            eprintln!("Error: {e}");
            return EXIT_ALREADY_RUNNING;
        }
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_FAILURE;
        }
    };

    let shutdown = match ShutdownSignals::install() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: failed to install signal handlers: {e}");
            return EXIT_FAILURE;
        }
    };

    tracing::info!(
        interval_secs = settings.poll_interval.as_secs(),
        threshold_secs = settings.stale_threshold.as_secs(),
        cooldown_secs = settings.restart_cooldown.as_secs(),
        data_dir = %data_dir.root().display(),
        lock = %lock.path().display(),
        "scrapewatch starting"
    );

    let mut supervisor = Supervisor::new(
        settings,
        classifier,
        reader,
        PsProcessHost,
        CommandLauncher::from_config(&config),
        notifier,
        SystemClock,
    )
    .with_state_file(StateFile::new(data_dir.state()));

    let max_ticks = cli.once.then_some(1);
    supervisor.run(shutdown.recv(), max_ticks).await;

    tracing::info!(
        restarts = supervisor.state().restart_count,
        "scrapewatch stopped"
    );
    0
}

/// Log to stderr and append to `log_path`.
fn init_logging(cli: &Cli, log_path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.default_filter()));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(())
}
