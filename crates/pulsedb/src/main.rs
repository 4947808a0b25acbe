//! pulsedb - records meter pulse intervals from a POSIX message queue.
//!
//! Usage:
//!   pulsedb /gas 7 --db /var/lib/pulsedb/pulses.sqlite3

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use pulsedb_core::config::{Config, LogFormat};
use pulsedb_core::event::MeterId;
use pulsedb_core::logging::init_logging;
use pulsedb_core::queue::backup_queue_name;

/// Crash-safe meter pulse recorder.
#[derive(Parser, Debug)]
#[command(name = "pulsedb", version, about = "Record meter pulses from a POSIX message queue")]
struct Cli {
    /// Main event queue, e.g. /gas. The backup queue is this name plus a suffix.
    queue: String,

    /// Meter id stored with every interval.
    meter: MeterId,

    /// TOML configuration file.
    #[arg(long, env = "PULSEDB_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file (overrides [store] path).
    #[arg(long, env = "PULSEDB_DB")]
    db: Option<PathBuf>,

    /// Log level or filter directive (overrides [log] level).
    #[arg(long, env = "PULSEDB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: pretty or json (overrides [log] format).
    #[arg(long, env = "PULSEDB_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Append logs to this file as well as stderr.
    #[arg(long, env = "PULSEDB_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(db) = &self.db {
            config.store.path.clone_from(db);
        }
        if let Some(level) = &self.log_level {
            config.log.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        if let Some(file) = &self.log_file {
            config.log.file = Some(file.clone());
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("fatal: {err:#}");
        if let Some(remediation) = err
            .downcast_ref::<pulsedb_core::Error>()
            .and_then(pulsedb_core::Error::remediation)
        {
            eprintln!("\n{}", remediation.render_plain());
        }
        process::exit(1);
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    init_logging(&config.log).context("initializing logging")?;
    let backup_name = backup_queue_name(&cli.queue, &config.queue.backup_suffix)?;
    info!(
        version = pulsedb_core::VERSION,
        queue = %cli.queue,
        backup = %backup_name,
        meter = cli.meter,
        db = %config.store.path.display(),
        "starting pulsedb"
    );
    record(cli, &config, &backup_name)
}

#[cfg(target_os = "linux")]
fn record(cli: &Cli, config: &Config, backup_name: &str) -> anyhow::Result<()> {
    use pulsedb_core::daemon::{Daemon, DaemonSettings, Exit};
    use pulsedb_core::mqueue::{PosixBackup, PosixQueue};
    use pulsedb_core::signals::{self, SignalGate};
    use pulsedb_core::sqlite::SqliteStore;

    let queue = PosixQueue::open(&cli.queue, config.queue.capacity)?;
    let backup = PosixBackup::open(backup_name)?;
    let mut store = SqliteStore::new(&config.store.path);
    if let Err(err) = store.connect() {
        // The daemon retries every store call, so an outage at startup is not fatal.
        warn!(error = %err, "store unavailable at startup");
    }
    let gate = SignalGate::install()?;

    let settings = DaemonSettings::from_config(cli.meter, config);
    let mut daemon = Daemon::new(queue, backup, store, gate, settings);
    match daemon.run()? {
        Exit::Terminated(signal) => {
            let (queue, backup, _store) = daemon.into_parts();
            queue.close()?;
            backup.close()?;
            signals::redeliver(signal)?;
            // Only reached if the signal did not end the process.
            process::exit(1);
        }
        Exit::Drained => {
            info!("event queue closed");
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn record(_cli: &Cli, _config: &Config, _backup_name: &str) -> anyhow::Result<()> {
    anyhow::bail!("POSIX message queues are only supported on Linux")
}
