//! Remediation: running the actions of a detected error pattern.
//!
//! [`ActionExecutor`] maps every [`ActionKind`] to one bounded behavior and
//! never propagates an error: a failing action logs the cause and reports
//! `false`. [`Remediator`] adds the cooldown and auto-fix gates around a
//! pattern's action list and records the attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertRecord, AlertSink};
use crate::daemon::RunContext;
use crate::db::{RemediationRecord, StateDb};
use crate::host::Host;
use crate::rules::{Action, ActionKind, AutoFixConfig, ErrorPattern};
use crate::scanner::DetectedError;

/// Log files at or above this size (10 MiB) are rotated by `log_rotate`.
pub const LOG_ROTATE_THRESHOLD_BYTES: u64 = 10_485_760;

const SECS_PER_DAY: u64 = 86_400;

/// Executes single remediation actions against the host.
#[derive(Clone)]
pub struct ActionExecutor {
    host: Arc<dyn Host>,
    alerts: AlertSink,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("alerts", &self.alerts)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    /// Create an executor using `host` for side effects and `alerts` as the
    /// alert sink.
    pub fn new(host: Arc<dyn Host>, alerts: AlertSink) -> Self {
        Self { host, alerts }
    }

    /// Run one action. Returns whether it succeeded.
    pub async fn execute(&self, action: &Action) -> bool {
        let tag = action.kind.tag();
        info!(action = %tag, description = %action.description, "executing action");

        match self.dispatch(action).await {
            Ok(()) => true,
            Err(e) => {
                error!(action = %tag, error = %format!("{e:#}"), "action failed");
                false
            }
        }
    }

    async fn dispatch(&self, action: &Action) -> anyhow::Result<()> {
        match &action.kind {
            ActionKind::ServiceRestart { service } => {
                let service = service
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .context("service_restart requires a service name")?;
                self.host
                    .restart(service)
                    .await
                    .with_context(|| format!("failed to restart service {service}"))?;
                info!(service, "service restarted");
                Ok(())
            }
            ActionKind::LogRotate { log_files } => rotate_logs(log_files),
            ActionKind::CacheClear { directories } => clear_caches(directories),
            ActionKind::TempFileCleanup { directories } => cleanup_temp_files(directories),
            ActionKind::CreateMissingDirs { directories } => create_dirs(directories),
            ActionKind::FixPermissions { paths, owner, mode } => {
                self.fix_permissions(paths, owner, mode).await
            }
            ActionKind::CheckPort { port } => {
                let port = (*port).context("check_port requires a port")?;
                match self.host.port_in_use(port).await {
                    Ok(in_use) => info!(port, in_use, "port status"),
                    Err(e) => warn!(port, error = %e, "failed to inspect port"),
                }
                Ok(())
            }
            ActionKind::KillProcessOnPort { port } => {
                let port = (*port).context("kill_process_on_port requires a port")?;
                self.kill_on_port(port).await
            }
            ActionKind::OldFileCleanup { directories, days } => {
                cleanup_old_files(directories, *days)
            }
            ActionKind::Alert => {
                self.alerts
                    .append(&AlertRecord::new(&action.description, Utc::now()))?;
                warn!(description = %action.description, "alert raised");
                Ok(())
            }
            ActionKind::LogAnalysis => {
                info!(description = %action.description, "log analysis requested");
                Ok(())
            }
            ActionKind::Unknown { kind } => {
                warn!(action = %kind, "unknown action type");
                anyhow::bail!("unknown action type '{kind}'")
            }
            ActionKind::Invalid { kind, reason } => {
                anyhow::bail!("invalid '{kind}' action: {reason}")
            }
        }
    }

    /// Recursive chown and chmod. Command failures are logged but do not
    /// fail the action; owner or mode values that could be read as options do.
    async fn fix_permissions(&self, paths: &[PathBuf], owner: &str, mode: &str) -> anyhow::Result<()> {
        validate_owner(owner)?;
        validate_mode(mode)?;

        for path in paths {
            if let Err(e) = self.host.chown_recursive(path, owner).await {
                warn!(path = %path.display(), owner, error = %e, "chown failed");
            }
            if let Err(e) = self.host.chmod_recursive(path, mode).await {
                warn!(path = %path.display(), mode, error = %e, "chmod failed");
            }
            info!(path = %path.display(), owner, mode, "permissions fixed");
        }
        Ok(())
    }

    async fn kill_on_port(&self, port: u16) -> anyhow::Result<()> {
        let pids = match self.host.pids_on_port(port).await {
            Ok(pids) => pids,
            Err(e) => {
                warn!(port, error = %e, "failed to list processes on port");
                return Ok(());
            }
        };

        if pids.is_empty() {
            info!(port, "no process bound to port");
            return Ok(());
        }

        for pid in pids {
            match self.host.kill(pid).await {
                Ok(()) => info!(port, pid, "process killed"),
                Err(e) => warn!(port, pid, error = %e, "failed to kill process"),
            }
        }
        Ok(())
    }
}

/// Result of one remediation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixOutcome {
    /// The pattern was remediated recently; nothing ran.
    SkippedCooldown,
    /// The pattern does not allow auto-fix; nothing ran.
    SkippedDisabled,
    /// Every action succeeded.
    Succeeded,
    /// At least one action failed.
    Failed,
}

impl FixOutcome {
    /// Whether actions were run.
    pub fn attempted(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Applies the cooldown and auto-fix gates and runs a pattern's actions.
#[derive(Debug, Clone)]
pub struct Remediator {
    executor: ActionExecutor,
    auto_fix: AutoFixConfig,
    history: Option<StateDb>,
}

impl Remediator {
    /// Create a remediator. `history` receives one row per attempt.
    pub fn new(executor: ActionExecutor, auto_fix: AutoFixConfig, history: Option<StateDb>) -> Self {
        Self {
            executor,
            auto_fix,
            history,
        }
    }

    /// Cooldown period for a pattern: its own override or the global one.
    pub fn cooldown_period(&self, pattern: &ErrorPattern) -> Duration {
        Duration::from_secs(pattern.cooldown_secs.unwrap_or(self.auto_fix.cooldown_period))
    }

    /// Remediate one detected error.
    ///
    /// Skips when the pattern is in cooldown or has auto-fix disabled.
    /// Otherwise runs every action in order (a failure does not stop the
    /// rest), records the attempt time and outcome, and returns the outcome.
    pub async fn auto_fix_error(
        &self,
        ctx: &mut RunContext,
        detected: &DetectedError,
        pattern: &ErrorPattern,
        now: DateTime<Utc>,
    ) -> FixOutcome {
        if ctx
            .cooldowns
            .is_in_cooldown(&pattern.id, self.cooldown_period(pattern), now)
        {
            info!(pattern = %pattern.id, "pattern in cooldown, skipping remediation");
            return FixOutcome::SkippedCooldown;
        }

        if !pattern.auto_fix {
            info!(pattern = %pattern.id, "auto-fix disabled for pattern, skipping");
            return FixOutcome::SkippedDisabled;
        }

        if self.auto_fix.backup_before_fix {
            debug!(pattern = %pattern.id, "backup before fix requested");
        }

        info!(
            pattern = %pattern.id,
            actions = pattern.actions.len(),
            "starting remediation"
        );

        let mut all_succeeded = true;
        for action in &pattern.actions {
            let ok = self.executor.execute(action).await;
            all_succeeded = all_succeeded && ok;
        }

        ctx.cooldowns.record_attempt(&pattern.id, now).await;
        ctx.stats.record_fix(all_succeeded);

        if let Some(history) = &self.history {
            let record = RemediationRecord {
                id: format!("fix-{}", uuid::Uuid::new_v4()),
                pattern_id: pattern.id.clone(),
                log_file: detected.log_file.display().to_string(),
                matched_line: detected.matched_line.clone(),
                detected_at: detected.detected_at.to_rfc3339(),
                attempted_at: now.to_rfc3339(),
                succeeded: all_succeeded,
            };
            if let Err(e) = history.insert_remediation(&record).await {
                warn!(pattern = %pattern.id, error = %e, "failed to record remediation history");
            }
        }

        if all_succeeded {
            info!(pattern = %pattern.id, "remediation succeeded");
            FixOutcome::Succeeded
        } else {
            warn!(pattern = %pattern.id, "remediation failed");
            FixOutcome::Failed
        }
    }
}

/// Validate a `chown` owner: any `user`, `user:group`, `user:` or `:group`
/// form, names or numeric ids.
///
/// Only values `chown` could read as an option or that carry whitespace or
/// control characters are refused.
///
/// # Errors
///
/// Returns an error if the owner is empty, starts with `-`, or contains
/// whitespace or control characters.
pub fn validate_owner(owner: &str) -> anyhow::Result<()> {
    anyhow::ensure!(
        !owner.is_empty()
            && !owner.starts_with('-')
            && !owner.chars().any(|c| c.is_whitespace() || c.is_control()),
        "invalid owner {owner:?}"
    );
    Ok(())
}

/// Validate a `chmod` mode: up to four octal digits, or a comma separated
/// list of symbolic clauses such as `u+rwX` or `g-w,o=`.
///
/// # Errors
///
/// Returns an error if the mode is neither octal nor symbolic.
pub fn validate_mode(mode: &str) -> anyhow::Result<()> {
    let octal = (1..=4).contains(&mode.len()) && mode.chars().all(|c| matches!(c, '0'..='7'));
    anyhow::ensure!(
        octal || mode.split(',').all(is_symbolic_clause),
        "invalid mode {mode:?}"
    );
    Ok(())
}

/// One `[ugoa]*([-+=]([rwxXst]*|[ugo]))+` clause.
fn is_symbolic_clause(clause: &str) -> bool {
    let mut chars = clause
        .trim_start_matches(['u', 'g', 'o', 'a'])
        .chars()
        .peekable();
    let mut has_op = false;

    while let Some(op) = chars.next() {
        if !matches!(op, '+' | '-' | '=') {
            return false;
        }
        has_op = true;
        if chars.next_if(|c| matches!(c, 'u' | 'g' | 'o')).is_some() {
            continue;
        }
        while chars
            .next_if(|c| matches!(c, 'r' | 'w' | 'x' | 'X' | 's' | 't'))
            .is_some()
        {}
    }
    has_op
}

/// Rename each log at or above the threshold to `<stem>.log.old`.
fn rotate_logs(log_files: &[PathBuf]) -> anyhow::Result<()> {
    for path in log_files {
        let Ok(metadata) = std::fs::metadata(path) else {
            continue;
        };
        if !metadata.is_file() || metadata.len() < LOG_ROTATE_THRESHOLD_BYTES {
            continue;
        }

        let target = rotated_path(path);
        std::fs::rename(path, &target).with_context(|| {
            format!("failed to rotate {} to {}", path.display(), target.display())
        })?;
        info!(from = %path.display(), to = %target.display(), "log rotated");
    }
    Ok(())
}

/// Destination of a rotated log: the extension replaced by `log.old`.
pub fn rotated_path(path: &Path) -> PathBuf {
    path.with_extension("log.old")
}

/// Remove and recreate each existing cache directory.
fn clear_caches(directories: &[PathBuf]) -> anyhow::Result<()> {
    for dir in directories {
        if !dir.exists() {
            continue;
        }
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("failed to remove cache directory {}", dir.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to recreate cache directory {}", dir.display()))?;
        info!(path = %dir.display(), "cache cleared");
    }
    Ok(())
}

/// Delete regular files directly inside each existing directory.
fn cleanup_temp_files(directories: &[PathBuf]) -> anyhow::Result<()> {
    for dir in directories {
        if !dir.exists() {
            continue;
        }
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read temp directory {}", dir.display()))?;

        let mut removed: u64 = 0;
        for entry in entries {
            let path = entry
                .with_context(|| format!("failed to read entry in {}", dir.display()))?
                .path();
            if path.is_file() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                removed = removed.saturating_add(1);
            }
        }
        info!(path = %dir.display(), removed, "temp files cleaned");
    }
    Ok(())
}

/// Create each directory and its parents.
fn create_dirs(directories: &[PathBuf]) -> anyhow::Result<()> {
    for dir in directories {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
        info!(path = %dir.display(), "directory ensured");
    }
    Ok(())
}

/// Recursively delete regular files last modified more than `days` ago.
fn cleanup_old_files(directories: &[PathBuf], days: u64) -> anyhow::Result<()> {
    let age = Duration::from_secs(days.saturating_mul(SECS_PER_DAY));
    let cutoff = SystemTime::now()
        .checked_sub(age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    for dir in directories {
        if !dir.exists() {
            continue;
        }

        let mut pending = vec![dir.clone()];
        let mut removed: u64 = 0;
        while let Some(current) = pending.pop() {
            let entries = match std::fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %current.display(), error = %e, "failed to read directory");
                    continue;
                }
            };

            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let is_old = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .is_ok_and(|modified| modified < cutoff);
                if !is_old {
                    continue;
                }

                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(path = %path.display(), "old file removed");
                        removed = removed.saturating_add(1);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old file"),
                }
            }
        }
        info!(path = %dir.display(), removed, days, "old files cleaned");
    }
    Ok(())
}
