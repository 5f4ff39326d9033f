//! poly-send - Scheduler daemon
//!
//! Polls the shared store for due schedule entries, claims them and
//! publishes through the platform adapters. Several instances may run
//! against the same database.

use clap::Parser;
use libpolycast::logging::{LogFormat, LoggingConfig};
use libpolycast::service::PolycastService;
use libpolycast::{Config, PolycastError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "poly-send")]
#[command(version)]
#[command(about = "Scheduler daemon for Polycast")]
#[command(long_about = "\
poly-send - Scheduler daemon for Polycast

DESCRIPTION:
    poly-send is a long-running daemon that watches the Polycast schedule
    and publishes due entries to Meta, LinkedIn and Google Business.

    Each poll claims a batch of due entries, publishes them through the
    shared rate limiter and records the outcome. Transient failures are
    retried with exponential backoff; claims abandoned by a crashed
    worker are reclaimed by the reaper.

USAGE:
    # Run in foreground (logs to stderr)
    poly-send

    # Poll every 5 seconds
    poly-send --poll-interval 5

    # Single poll and reaper pass, then exit
    poly-send --once

    # JSON logs for a supervisor
    poly-send --log-format json

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the in-flight batch)

CONFIGURATION:
    Configuration file: ~/.config/polycast/config.toml
    Database location: ~/.local/share/polycast/polycast.db

    [scheduler]
    poll_interval_secs = 10
    lease_timeout_secs = 300
    concurrency = 4

    [retry]
    base_delay_secs = 2
    max_retries = 5

    Override with environment variables:
        POLYCAST_CONFIG    - Path to config file
        POLYCAST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Worker identity recorded on claims (overrides config)
    #[arg(long, value_name = "ID")]
    worker_id: Option<String>,

    /// Log output format: text, json or pretty
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Run one reaper pass and one poll, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.log_format, cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!("poly-send failed: {:#}", e);
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<PolycastError>()
            .map(PolycastError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(secs) = cli.poll_interval {
        config.scheduler.poll_interval_secs = secs;
    }
    if let Some(worker_id) = cli.worker_id {
        config.scheduler.worker_id = Some(worker_id);
    }

    let service = PolycastService::from_config(config).await?;
    let scheduler = service.scheduler();

    info!(
        worker = scheduler.worker().worker_id(),
        platforms = ?service.registry().platforms(),
        "poly-send starting"
    );

    if cli.once {
        let reaped = scheduler.reap().await?;
        let report = scheduler.tick().await?;
        info!(
            reaped = reaped.requeued + reaped.failed,
            due = report.due,
            claimed = report.claimed,
            posted = report.posted(),
            "Processed due entries once, exiting"
        );
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(Arc::clone(&shutdown))?;
    spawn_event_logger(&service);

    scheduler.run(shutdown).await?;

    info!("poly-send stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
    Ok(())
}

/// Mirror dispatch events into the log at debug level
fn spawn_event_logger(service: &PolycastService) {
    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(?event, "dispatch event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event logger lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
