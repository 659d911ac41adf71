//! Mender CLI entry point.
//!
//! Provides `once`, `run`, `health`, and `scan` subcommands for a single
//! detection cycle, the continuous daemon loop, a one-shot health report, or
//! a one-shot scan with remediation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use mender::config::{load_settings, Settings};
use mender::cooldown::CooldownTracker;
use mender::daemon::{Daemon, RunContext, RunSchedule, ScanSummary};
use mender::db::StateDb;
use mender::health::HealthMonitor;
use mender::host::{Host, SystemHost};
use mender::logging;
use mender::rules::load_rules;

/// Mender: self-healing monitoring daemon.
#[derive(Parser)]
#[command(name = "mender", version, about)]
struct Cli {
    /// Error pattern rule file (JSON).
    #[arg(long, global = true, default_value = "error_patterns.json")]
    config: PathBuf,

    /// Daemon settings file (TOML).
    #[arg(long, global = true, default_value = "mender.toml")]
    settings: PathBuf,

    /// Diagnostic log file for `once` and `run`.
    #[arg(long, global = true, default_value = "logs/mender.log")]
    log_file: PathBuf,

    /// Subcommand to execute; defaults to `once`.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run a single detection cycle and exit.
    Once,
    /// Run detection cycles until interrupted.
    Run {
        /// Cycles per iteration (overrides settings).
        #[arg(long)]
        loop_count: Option<u32>,
        /// Minutes to wait between iterations (overrides settings).
        #[arg(long)]
        wait_minutes: Option<u64>,
    },
    /// Run the health checks and print the report as JSON.
    Health,
    /// Scan logs once, remediate, and print a JSON summary.
    Scan,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Once) => handle_once(&cli).await,
        Some(Command::Run {
            loop_count,
            wait_minutes,
        }) => handle_run(&cli, loop_count, wait_minutes).await,
        Some(Command::Health) => handle_health(&cli).await,
        Some(Command::Scan) => handle_scan(&cli).await,
    }
}

/// Run a single detection cycle.
async fn handle_once(cli: &Cli) -> anyhow::Result<()> {
    let _logging_guard = logging::init_production(&cli.log_file)?;

    let settings = load_settings(&cli.settings)
        .with_context(|| format!("failed to load {}", cli.settings.display()))?;
    let (daemon, mut ctx) = build_daemon(cli, &settings).await;

    daemon.run_detection_cycle(&mut ctx, 1).await?;
    ctx.stats.log_summary();

    Ok(())
}

/// Run the continuous loop until Ctrl-C.
async fn handle_run(
    cli: &Cli,
    loop_count: Option<u32>,
    wait_minutes: Option<u64>,
) -> anyhow::Result<()> {
    let _logging_guard = logging::init_production(&cli.log_file)?;

    let mut settings = load_settings(&cli.settings)
        .with_context(|| format!("failed to load {}", cli.settings.display()))?;
    if let Some(n) = loop_count {
        settings.run.loop_count = n;
    }
    if let Some(m) = wait_minutes {
        settings.run.wait_minutes = m;
    }
    settings.validate()?;

    let (daemon, mut ctx) = build_daemon(cli, &settings).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, finishing current cycle");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!(error = %e, "failed to listen for interrupt"),
        }
    });

    info!(
        config = %cli.config.display(),
        settings = %cli.settings.display(),
        "mender daemon started"
    );

    daemon
        .run_continuous(&mut ctx, RunSchedule::from(&settings.run), shutdown_rx)
        .await?;

    info!("mender daemon stopped");
    Ok(())
}

/// Print a health report as JSON.
async fn handle_health(cli: &Cli) -> anyhow::Result<()> {
    logging::init_cli();

    let settings = load_settings(&cli.settings)
        .with_context(|| format!("failed to load {}", cli.settings.display()))?;
    let monitor = HealthMonitor::new(settings.health.clone(), settings.host.command_timeout());
    let report = monitor.run_all_checks().await;

    let json =
        serde_json::to_string_pretty(&report).context("failed to serialize health report")?;
    println!("{json}");

    Ok(())
}

/// Scan and remediate once, then print the summary as JSON.
async fn handle_scan(cli: &Cli) -> anyhow::Result<()> {
    logging::init_cli();

    let settings = load_settings(&cli.settings)
        .with_context(|| format!("failed to load {}", cli.settings.display()))?;
    let (daemon, mut ctx) = build_daemon(cli, &settings).await;

    let report = daemon.scan_and_remediate(&mut ctx).await?;
    let summary = ScanSummary::new(&report, &ctx.stats);

    let json = serde_json::to_string_pretty(&summary).context("failed to serialize summary")?;
    println!("{json}");

    Ok(())
}

/// Load the rule set, open the state database, and wire the daemon.
///
/// The state database is optional: if it cannot be opened, cooldowns are
/// kept in memory and no history is written.
async fn build_daemon(cli: &Cli, settings: &Settings) -> (Daemon, RunContext) {
    let rules = load_rules(&cli.config);

    let db = match StateDb::open(&settings.state.db_path).await {
        Ok(db) => Some(db),
        Err(e) => {
            warn!(
                path = %settings.state.db_path.display(),
                error = %format!("{e:#}"),
                "state db unavailable, cooldowns kept in memory only"
            );
            None
        }
    };

    let cooldowns = match &db {
        Some(db) if settings.state.persist_cooldowns => {
            CooldownTracker::with_store(db.clone()).await
        }
        _ => CooldownTracker::new(),
    };

    let host: Arc<dyn Host> = Arc::new(SystemHost::new(&settings.host));
    let daemon = Daemon::new(settings, rules, host, db);

    (daemon, RunContext::new(cooldowns))
}
