//! pcp-sync - copies line controller pulses into the production store
//!
//! Reads new rows from the controller's legacy pulse table, writes one pulse
//! per active plate session, and opens a stoppage when the gap since the
//! previous pulse exceeds the product's ideal cycle time.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/pcp/pcp.db (~/.local/share/pcp/pcp.db)
//! - Logs: $XDG_STATE_HOME/pcp/pcp.log (~/.local/state/pcp/pcp.log)
//! - Config: $XDG_CONFIG_HOME/pcp/config.toml (~/.config/pcp/config.toml)

mod process_lock;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use pcp_core::ingest::{IngestPolicy, IngestReport, LegacyPulseFeed, LegacySource, PulseIngestor};
use pcp_core::store::{open_store, SyncStateStore, SystemClock};
use pcp_core::{Config, Store};
use process_lock::{acquire_poller_guard, store_scope, Poller};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pcp-sync")]
#[command(about = "Copy line controller pulses into the production store")]
#[command(version)]
struct Args {
    /// Verbose output
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Watch mode - continuously sync instead of one-shot
    #[arg(short, long)]
    watch: bool,

    /// Poll interval in milliseconds (only with --watch; defaults to sync.interval_ms)
    #[arg(long)]
    poll: Option<u64>,

    /// SQLite copy of the legacy pulse table (overrides sync.legacy_url and sync.legacy_path)
    #[arg(long)]
    legacy: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let _log_guard =
        pcp_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("pcp-sync starting");

    let legacy = args
        .legacy
        .clone()
        .map(LegacySource::Sqlite)
        .or_else(|| config.sync.legacy_source())
        .context(
            "no legacy pulse database configured \
             (set sync.legacy_url or sync.legacy_path, or pass --legacy)",
        )?;

    let scope = store_scope(&config.store);
    let _guard =
        acquire_poller_guard(Poller::Sync, &scope).context("failed to acquire process lock")?;

    let store = open_store(&config.store).context("failed to open store")?;
    let feed = legacy
        .open(Duration::from_secs(config.sync.legacy_timeout_secs))
        .context("failed to open legacy pulses")?;

    println!("Store: {} ({})", scope, store.backend_name());
    println!("Legacy pulses: {}", legacy);

    let policy = config.sync.ingest_policy(&config.watchdog);

    if args.watch {
        let poll = Duration::from_millis(args.poll.unwrap_or(config.sync.interval_ms));
        run_watch_mode(store.as_ref(), feed.as_ref(), policy, poll, args.verbose)
    } else {
        run_single_sync(store.as_ref(), feed.as_ref(), policy, args.verbose)
    }
}

/// Run one ingestion pass with a spinner and print a summary
fn run_single_sync(
    store: &dyn Store,
    feed: &dyn LegacyPulseFeed,
    policy: IngestPolicy,
    verbose: u8,
) -> Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(format!("reading pulses after #{}", store.last_legacy_id()?));
    pb.enable_steady_tick(Duration::from_millis(100));

    let clock = SystemClock;
    let result = PulseIngestor::new(store, feed, &clock, policy).sync_once();
    pb.finish_and_clear();
    let report = result.context("sync failed")?;

    print_sync_result(&report, verbose);

    tracing::info!(
        rows_read = report.rows_read,
        pulses_inserted = report.pulses_inserted,
        stoppages_opened = report.stoppages_opened,
        "pcp-sync complete"
    );

    Ok(())
}

/// Run continuous watch mode
///
/// A failed pass is logged and retried on the next poll.
fn run_watch_mode(
    store: &dyn Store,
    feed: &dyn LegacyPulseFeed,
    policy: IngestPolicy,
    poll: Duration,
    verbose: u8,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    println!(
        "Watch mode active (poll every {}ms). Press Ctrl+C to stop.",
        poll.as_millis()
    );
    println!();

    let clock = SystemClock;
    let ingestor = PulseIngestor::new(store, feed, &clock, policy);
    let mut iteration = 0u64;

    while running.load(Ordering::SeqCst) {
        iteration += 1;

        match ingestor.sync_once() {
            Ok(report) if report.rows_read > 0 => {
                let timestamp = chrono::Local::now().format("%H:%M:%S");
                println!(
                    "[{}] Synced: {} rows, {} pulses, {} stoppages (checkpoint {})",
                    timestamp,
                    report.rows_read,
                    report.pulses_inserted,
                    report.stoppages_opened,
                    report.last_id
                );
                if verbose >= 1 && report.duplicates > 0 {
                    println!("  {} duplicate pulse(s) ignored", report.duplicates);
                }
                if verbose >= 1 && report.rows_malformed > 0 {
                    println!("  {} malformed row(s) skipped", report.rows_malformed);
                }

                tracing::info!(
                    iteration,
                    rows_read = report.rows_read,
                    pulses_inserted = report.pulses_inserted,
                    "watch sync iteration"
                );
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("Sync failed: {}", e);
                tracing::error!(iteration, error = %e, transient = e.is_transient(), "Sync pass failed");
            }
        }

        thread::sleep(poll);
    }

    println!("Watch mode stopped.");
    tracing::info!("pcp-sync watch mode stopped");

    Ok(())
}

/// Print sync result summary
fn print_sync_result(report: &IngestReport, verbose: u8) {
    println!("\nSync complete:");
    println!("  Rows read:        {}", report.rows_read);
    println!("  Pulses inserted:  {}", report.pulses_inserted);
    println!("  Stoppages opened: {}", report.stoppages_opened);
    println!("  Checkpoint:       {}", report.last_id);

    if verbose >= 1 {
        println!("  Duplicates:       {}", report.duplicates);
        println!("  Rows skipped:     {}", report.rows_skipped);
        println!("  Rows malformed:   {}", report.rows_malformed);
    }
}
