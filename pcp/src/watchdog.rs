//! pcp-watchdog - opens unplanned stoppages for idle production sessions
//!
//! Every pass looks at the sessions in progress. A session whose last pulse
//! (or start, if it has none) is older than 1.6 × the product's ideal cycle
//! time gets an unplanned stoppage, unless one is already open.

mod process_lock;

use anyhow::{Context, Result};
use clap::Parser;
use pcp_core::store::{open_store, SystemClock};
use pcp_core::watchdog::{EvaluationMode, IdleEvaluator, IdlePolicy, Outcome, WatchdogReport};
use pcp_core::{Config, Store};
use process_lock::{acquire_poller_guard, store_scope, Poller};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "pcp-watchdog")]
#[command(about = "Open unplanned stoppages for idle production sessions")]
#[command(version)]
struct Args {
    /// Watch mode - evaluate repeatedly instead of once
    #[arg(short, long)]
    watch: bool,

    /// Seconds between passes (only with --watch; defaults to watchdog.poll_interval_secs)
    #[arg(long)]
    poll: Option<u64>,

    /// Report what would be opened without writing
    #[arg(long)]
    dry_run: bool,

    /// Only evaluate sessions of this machine id
    #[arg(long)]
    machine: Option<String>,

    /// Print one JSON line per evaluated session
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let _log_guard =
        pcp_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!(dry_run = args.dry_run, "pcp-watchdog starting");

    let scope = store_scope(&config.store);
    // Dry runs never write, so they may run next to a live watchdog
    let _guard = if args.dry_run {
        None
    } else {
        Some(
            acquire_poller_guard(Poller::Watchdog, &scope)
                .context("failed to acquire process lock")?,
        )
    };

    let store = open_store(&config.store).context("failed to open store")?;
    let policy = config.watchdog.policy();
    let mode = if args.dry_run {
        EvaluationMode::DryRun
    } else {
        EvaluationMode::Apply
    };

    if !args.json {
        println!("Store: {} ({})", scope, store.backend_name());
        println!(
            "Idle threshold: ideal cycle × {} (default cycle {}s)",
            policy.idle_multiplier, policy.default_cycle_secs
        );
    }

    if args.watch {
        let poll = Duration::from_secs(args.poll.unwrap_or(config.watchdog.poll_interval_secs));
        run_watch_mode(store.as_ref(), policy, mode, poll, &args)
    } else {
        let report = run_pass(store.as_ref(), policy, mode, &args)?;
        if !report.failures.is_empty() {
            anyhow::bail!("{} session(s) could not be evaluated", report.failures.len());
        }
        Ok(())
    }
}

fn run_pass(
    store: &dyn Store,
    policy: IdlePolicy,
    mode: EvaluationMode,
    args: &Args,
) -> Result<WatchdogReport> {
    let clock = SystemClock;
    let evaluator = IdleEvaluator::new(store, &clock, policy);
    let report = evaluator
        .evaluate_active(args.machine.as_deref(), mode)
        .context("failed to list sessions in progress")?;

    if args.json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(report)
}

/// Run continuous watch mode
///
/// A pass that cannot list sessions is logged and retried on the next poll.
fn run_watch_mode(
    store: &dyn Store,
    policy: IdlePolicy,
    mode: EvaluationMode,
    poll: Duration,
    args: &Args,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    if !args.json {
        println!(
            "Watch mode active (every {}s). Press Ctrl+C to stop.",
            poll.as_secs()
        );
    }

    let mut iteration = 0u64;
    while running.load(Ordering::SeqCst) {
        iteration += 1;
        if let Err(e) = run_pass(store, policy, mode, args) {
            eprintln!("Watchdog pass failed: {:#}", e);
            tracing::error!(iteration, error = %e, "Watchdog pass failed");
        }

        // Sleep in short steps so Ctrl+C is honored promptly
        let mut slept = Duration::ZERO;
        while slept < poll && running.load(Ordering::SeqCst) {
            let step = Duration::from_millis(200).min(poll - slept);
            thread::sleep(step);
            slept += step;
        }
    }

    if !args.json {
        println!("Watch mode stopped.");
    }
    tracing::info!("pcp-watchdog watch mode stopped");
    Ok(())
}

fn print_report(report: &WatchdogReport) {
    let timestamp = chrono::Local::now().format("%H:%M:%S");
    println!(
        "[{}] {} session(s): {} opened, {} already stopped, {} within tolerance{}",
        timestamp,
        report.sessions_checked,
        report.stoppages_opened,
        report.already_stopped,
        report.within_tolerance,
        if report.would_open > 0 {
            format!(", {} would open", report.would_open)
        } else {
            String::new()
        }
    );

    for (session, outcome) in &report.outcomes {
        match outcome {
            Outcome::StoppageOpened { assessment, .. } => println!(
                "  STOPPED  {} plate {} ({}): idle {}s > {:.0}s",
                session.machine_id,
                session.plate,
                session.product_code,
                assessment.idle_secs,
                assessment.threshold_secs
            ),
            Outcome::WouldOpen(assessment) => println!(
                "  WOULD    {} plate {} ({}): idle {}s > {:.0}s",
                session.machine_id,
                session.plate,
                session.product_code,
                assessment.idle_secs,
                assessment.threshold_secs
            ),
            _ => {}
        }
    }

    for (session_id, error) in &report.failures {
        println!("  FAILED   {}: {}", session_id, error);
    }
}

fn print_json(report: &WatchdogReport) -> Result<()> {
    for (session, outcome) in &report.outcomes {
        let (status, assessment, stoppage_id) = match outcome {
            Outcome::NotInProgress => ("not_in_progress", None, None),
            Outcome::AlreadyStopped { stoppage_id } => {
                ("already_stopped", None, Some(stoppage_id.as_str()))
            }
            Outcome::WithinTolerance(a) => ("within_tolerance", Some(a), None),
            Outcome::StoppageOpened {
                stoppage,
                assessment,
            } => ("stoppage_opened", Some(assessment), Some(stoppage.id.as_str())),
            Outcome::WouldOpen(a) => ("would_open", Some(a), None),
        };
        let line = serde_json::json!({
            "session_id": session.id,
            "machine_id": session.machine_id,
            "plate": session.plate,
            "status": status,
            "stoppage_id": stoppage_id,
            "assessment": assessment,
        });
        println!("{}", serde_json::to_string(&line)?);
    }
    for (session_id, error) in &report.failures {
        let line = serde_json::json!({
            "session_id": session_id,
            "status": "failed",
            "error": error,
        });
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}
