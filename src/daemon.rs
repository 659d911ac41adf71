//! Detection cycle orchestration and the continuous run loop.
//!
//! A cycle runs three phases in order: health check, log scan, remediation.
//! No phase is skipped because another reported problems. The continuous
//! loop runs cycles in iterations and honours shutdown only between cycles
//! and during waits, so an in-flight cycle always completes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::alerts::AlertSink;
use crate::config::{RunConfig, Settings};
use crate::cooldown::CooldownTracker;
use crate::db::StateDb;
use crate::health::{HealthMonitor, HealthReport, OverallStatus};
use crate::host::Host;
use crate::remediation::{ActionExecutor, FixOutcome, Remediator};
use crate::rules::RuleSet;
use crate::scanner::{self, DetectedError};
use crate::stats::RunStatistics;

/// Mutable state owned by the control flow and passed into every phase.
#[derive(Debug, Default)]
pub struct RunContext {
    /// Lifetime counters.
    pub stats: RunStatistics,
    /// Per-pattern cooldowns.
    pub cooldowns: CooldownTracker,
    /// Cycles finished so far.
    pub cycles_completed: u64,
}

impl RunContext {
    /// Create a context with zeroed statistics around a cooldown tracker.
    pub fn new(cooldowns: CooldownTracker) -> Self {
        Self {
            stats: RunStatistics::default(),
            cooldowns,
            cycles_completed: 0,
        }
    }
}

/// Summary of one detection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Cycle number, starting at 1.
    pub cycle: u64,
    /// Overall health, absent when the health phase is disabled.
    pub health_status: Option<OverallStatus>,
    /// Errors detected by the scan.
    pub detected: u64,
    /// Remediations attempted.
    pub attempted: u64,
    /// Remediations where every action succeeded.
    pub succeeded: u64,
    /// Remediations where some action failed.
    pub failed: u64,
    /// Detections skipped because of cooldown.
    pub skipped_cooldown: u64,
    /// Detections skipped because auto-fix is off.
    pub skipped_disabled: u64,
    /// The last error detected in this cycle.
    pub last_error: Option<DetectedError>,
}

impl CycleReport {
    fn tally(&mut self, outcome: FixOutcome) {
        let counter = match outcome {
            FixOutcome::SkippedCooldown => &mut self.skipped_cooldown,
            FixOutcome::SkippedDisabled => &mut self.skipped_disabled,
            FixOutcome::Succeeded => &mut self.succeeded,
            FixOutcome::Failed => &mut self.failed,
        };
        *counter = counter.saturating_add(1);
        if outcome.attempted() {
            self.attempted = self.attempted.saturating_add(1);
        }
    }
}

/// JSON summary printed by the `scan` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    /// Errors detected so far.
    pub errors_detected: u64,
    /// Remediations attempted so far.
    pub fixes_attempted: u64,
    /// Remediations that succeeded so far.
    pub fixes_succeeded: u64,
    /// Pattern id of the last detection, if any.
    pub last_error_id: Option<String>,
    /// `name: line` of the last detection, if any.
    pub last_error_summary: Option<String>,
}

impl ScanSummary {
    /// Build the summary from a cycle report and the lifetime statistics.
    pub fn new(report: &CycleReport, stats: &RunStatistics) -> Self {
        Self {
            errors_detected: stats.errors_detected,
            fixes_attempted: stats.fixes_attempted,
            fixes_succeeded: stats.fixes_succeeded,
            last_error_id: report.last_error.as_ref().map(|e| e.pattern_id.clone()),
            last_error_summary: report
                .last_error
                .as_ref()
                .map(|e| format!("{}: {}", e.pattern_name, e.matched_line)),
        }
    }
}

/// Timing of the continuous loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSchedule {
    /// Cycles per iteration.
    pub loop_count: u32,
    /// Pause between cycles of one iteration.
    pub cycle_pause: Duration,
    /// Wait between iterations.
    pub iteration_wait: Duration,
}

impl From<&RunConfig> for RunSchedule {
    fn from(config: &RunConfig) -> Self {
        Self {
            loop_count: config.loop_count,
            cycle_pause: Duration::from_secs(config.cycle_pause_secs),
            iteration_wait: Duration::from_secs(config.wait_minutes.saturating_mul(60)),
        }
    }
}

/// The monitoring daemon: rule set, probes and remediation wired together.
#[derive(Debug, Clone)]
pub struct Daemon {
    sources: Vec<PathBuf>,
    rules: Arc<RuleSet>,
    health: HealthMonitor,
    remediator: Remediator,
}

impl Daemon {
    /// Wire a daemon from settings, a loaded rule set and a host.
    ///
    /// `history` receives remediation records when present.
    pub fn new(
        settings: &Settings,
        rules: RuleSet,
        host: Arc<dyn Host>,
        history: Option<StateDb>,
    ) -> Self {
        let executor = ActionExecutor::new(host, AlertSink::new(&settings.alerts.log_path));
        let remediator = Remediator::new(executor, rules.auto_fix.clone(), history);

        Self {
            sources: settings.logs.sources.clone(),
            rules: Arc::new(rules),
            health: HealthMonitor::new(settings.health.clone(), settings.host.command_timeout()),
            remediator,
        }
    }

    /// The loaded rule set.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Run the health phase alone.
    pub async fn health_check(&self) -> HealthReport {
        self.health.run_all_checks().await
    }

    /// Run one full cycle: health check, log scan, remediation.
    ///
    /// # Errors
    ///
    /// Returns an error only if the scan task itself dies.
    pub async fn run_detection_cycle(
        &self,
        ctx: &mut RunContext,
        cycle: u64,
    ) -> anyhow::Result<CycleReport> {
        info!(cycle, "detection cycle started");

        let health_status = if self.health.enabled() {
            let report = self.health.run_all_checks().await;
            match report.overall_status {
                OverallStatus::Healthy => info!(status = "healthy", "health check complete"),
                OverallStatus::Degraded => warn!(status = "degraded", "health check complete"),
                OverallStatus::Critical => error!(status = "critical", "health check complete"),
            }
            Some(report.overall_status)
        } else {
            info!("health checks disabled, skipping");
            None
        };

        let mut report = self.scan_and_remediate(ctx).await?;
        report.cycle = cycle;
        report.health_status = health_status;

        ctx.cycles_completed = ctx.cycles_completed.saturating_add(1);
        info!(
            cycle,
            detected = report.detected,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped_cooldown = report.skipped_cooldown,
            skipped_disabled = report.skipped_disabled,
            "detection cycle complete"
        );

        Ok(report)
    }

    /// Run the log scan and remediation phases without the health phase.
    ///
    /// # Errors
    ///
    /// Returns an error only if the scan task itself dies.
    pub async fn scan_and_remediate(&self, ctx: &mut RunContext) -> anyhow::Result<CycleReport> {
        let sources = self.sources.clone();
        let rules = Arc::clone(&self.rules);
        let detected = tokio::task::spawn_blocking(move || scanner::scan_logs(&sources, &rules))
            .await
            .context("log scan task panicked")?;

        let mut report = CycleReport::default();
        for _ in &detected {
            ctx.stats.record_detection();
            report.detected = report.detected.saturating_add(1);
        }

        if detected.is_empty() {
            info!("no errors detected");
        }

        for found in &detected {
            let Some(pattern) = self.rules.pattern(&found.pattern_id) else {
                warn!(pattern = %found.pattern_id, "detected pattern missing from rule set");
                continue;
            };
            let outcome = self
                .remediator
                .auto_fix_error(ctx, found, &pattern.def, Utc::now())
                .await;
            report.tally(outcome);
        }

        report.last_error = detected.into_iter().last();
        Ok(report)
    }

    /// Run cycles until shutdown is requested.
    ///
    /// Each iteration runs `loop_count` cycles separated by `cycle_pause`,
    /// logs the statistics, then waits `iteration_wait`. The `shutdown`
    /// flag is checked before each cycle and during every pause or wait.
    ///
    /// # Errors
    ///
    /// Returns the first error escaping a cycle; the loop stops there.
    pub async fn run_continuous(
        &self,
        ctx: &mut RunContext,
        schedule: RunSchedule,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(
            loop_count = schedule.loop_count,
            cycle_pause_secs = schedule.cycle_pause.as_secs(),
            iteration_wait_secs = schedule.iteration_wait.as_secs(),
            "continuous run started"
        );

        let mut cycle: u64 = 0;
        let mut iteration: u64 = 0;

        loop {
            iteration = iteration.saturating_add(1);
            info!(iteration, "iteration started");

            for index in 0..schedule.loop_count {
                if *shutdown.borrow() {
                    stop(ctx);
                    return Ok(());
                }

                cycle = cycle.saturating_add(1);
                if let Err(e) = self.run_detection_cycle(ctx, cycle).await {
                    error!(cycle, error = %format!("{e:#}"), "control loop fault, stopping");
                    return Err(e.context(format!("detection cycle {cycle} failed")));
                }

                let last_in_iteration = index.saturating_add(1) >= schedule.loop_count;
                if !last_in_iteration && wait_or_shutdown(schedule.cycle_pause, &mut shutdown).await
                {
                    stop(ctx);
                    return Ok(());
                }
            }

            ctx.stats.log_summary();
            info!(
                iteration,
                wait_secs = schedule.iteration_wait.as_secs(),
                "iteration complete, waiting"
            );

            if wait_or_shutdown(schedule.iteration_wait, &mut shutdown).await {
                stop(ctx);
                return Ok(());
            }
        }
    }
}

/// Log the shutdown and the final statistics.
fn stop(ctx: &RunContext) {
    info!(cycles = ctx.cycles_completed, "shutdown requested, stopping");
    ctx.stats.log_summary();
}

/// Sleep for `duration` unless shutdown is requested first.
///
/// Returns whether shutdown was requested. If the sender is gone the full
/// duration is slept.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            () = &mut sleep => return *shutdown.borrow(),
            changed = shutdown.changed() => {
                if changed.is_err() {
                    (&mut sleep).await;
                    return *shutdown.borrow();
                }
                if *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}
