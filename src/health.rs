//! Health probes and the rollup into an overall status.
//!
//! Four probes run sequentially: SQLite reachability, HTTP liveness, disk
//! usage and memory usage. A probe never fails: every error becomes that
//! probe's unhealthy result. System metrics are collected best-effort and do
//! not influence the overall status.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, info, warn};

use crate::config::{DatabaseCheck, DiskCheck, HealthConfig, HttpCheck, MemoryCheck};
use crate::host::run_command;

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The probe passed.
    Healthy,
    /// The probe failed or its resource is under pressure.
    Unhealthy,
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    /// Probe outcome.
    pub status: HealthStatus,
    /// Whether a failure of this probe makes the whole service critical.
    /// Comes from the probe definition, not from the outcome.
    pub critical: bool,
    /// Human-readable summary.
    pub message: String,
    /// Probe-specific measurements.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl HealthCheckResult {
    /// A passing result.
    pub fn healthy(critical: bool, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            status: HealthStatus::Healthy,
            critical,
            message: message.into(),
            details,
        }
    }

    /// A failing result.
    pub fn unhealthy(critical: bool, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            critical,
            message: message.into(),
            details,
        }
    }

    /// Whether the probe failed.
    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

/// Aggregate status across all probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Every probe passed.
    Healthy,
    /// Some non-critical probe failed.
    Degraded,
    /// A critical probe failed.
    Critical,
}

/// A probe result labelled with the probe name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedCheck {
    /// Probe name.
    pub name: String,
    /// Probe result.
    pub result: HealthCheckResult,
}

/// CPU utilisation from `top`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CpuMetrics {
    /// Busy percent, one decimal.
    pub usage_percent: f64,
    /// Idle percent, one decimal.
    pub idle_percent: f64,
}

/// Cumulative network counters from `/proc/net/dev`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkMetrics {
    /// Bytes received across all interfaces.
    pub bytes_received: u64,
    /// Bytes sent across all interfaces.
    pub bytes_sent: u64,
}

/// Best-effort host metrics. Absent fields could not be collected.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    /// CPU utilisation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuMetrics>,
    /// Number of running processes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_count: Option<u64>,
    /// Network counters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkMetrics>,
}

/// Full output of one health phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// When the checks started.
    pub timestamp: DateTime<Utc>,
    /// Probe results in execution order.
    pub checks: Vec<NamedCheck>,
    /// Rolled-up status.
    pub overall_status: OverallStatus,
    /// Host metrics.
    pub metrics: SystemMetrics,
}

/// Parsed `df -P` data line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskUsage {
    /// Filesystem device.
    pub filesystem: String,
    /// Size in 1K blocks.
    pub size_kb: u64,
    /// Used 1K blocks.
    pub used_kb: u64,
    /// Available 1K blocks.
    pub available_kb: u64,
    /// Use percent as reported.
    pub use_percent: u32,
    /// Mount point.
    pub mounted_on: String,
}

/// Parsed `free -m` memory line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Total MiB.
    pub total_mb: u32,
    /// Used MiB.
    pub used_mb: u32,
    /// Available MiB.
    pub available_mb: u32,
}

impl MemoryUsage {
    /// Used/total percent, one decimal.
    pub fn usage_percent(&self) -> f64 {
        round_to(f64::from(self.used_mb) / f64::from(self.total_mb) * 100.0, 1)
    }
}

/// Roll probe results up into one status.
///
/// Any unhealthy critical probe makes the whole critical; otherwise any
/// unhealthy probe makes it degraded; otherwise healthy.
pub fn rollup<'a>(results: impl IntoIterator<Item = &'a HealthCheckResult>) -> OverallStatus {
    let mut overall = OverallStatus::Healthy;
    for result in results {
        if result.is_unhealthy() {
            if result.critical {
                return OverallStatus::Critical;
            }
            overall = OverallStatus::Degraded;
        }
    }
    overall
}

/// Probe a SQLite database: open read-only, run `SELECT 1`, count tables.
pub async fn check_database(path: &Path, timeout: Duration, critical: bool) -> HealthCheckResult {
    if !path.exists() {
        return HealthCheckResult::unhealthy(
            critical,
            format!("Database file not found: {}", path.display()),
            serde_json::Value::Null,
        );
    }

    let probe = async {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(timeout);
        let mut conn = SqliteConnection::connect_with(&options).await?;
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&mut conn)
            .await?;
        let table_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type='table'")
                .fetch_one(&mut conn)
                .await?;
        conn.close().await?;
        Ok::<i64, sqlx::Error>(table_count)
    };

    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(table_count)) => {
            let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            #[allow(clippy::cast_precision_loss)]
            let file_size_mb = round_to(size_bytes as f64 / (1024.0 * 1024.0), 2);
            HealthCheckResult::healthy(
                critical,
                format!("Connection successful ({table_count} tables)"),
                json!({
                    "database_path": path.display().to_string(),
                    "table_count": table_count,
                    "file_size_mb": file_size_mb,
                }),
            )
        }
        Ok(Err(e)) => HealthCheckResult::unhealthy(
            critical,
            format!("SQLite error: {e}"),
            serde_json::Value::Null,
        ),
        Err(_) => HealthCheckResult::unhealthy(
            critical,
            format!("Timeout after {}s", timeout.as_secs()),
            serde_json::Value::Null,
        ),
    }
}

/// Probe an HTTP endpoint with a single GET.
///
/// Healthy iff the response has a 2xx status within the timeout.
pub async fn check_http_endpoint(url: &str, timeout: Duration, critical: bool) -> HealthCheckResult {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            return HealthCheckResult::unhealthy(
                critical,
                format!("Request failed: {e}"),
                serde_json::Value::Null,
            )
        }
    };

    let started = Instant::now();
    match client.get(url).send().await {
        Ok(response) => {
            let status = response.status();
            let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let details = json!({
                "status_code": status.as_u16(),
                "response_time_ms": response_time_ms,
            });
            if status.is_success() {
                HealthCheckResult::healthy(
                    critical,
                    format!("HTTP {} OK (response_time: {response_time_ms}ms)", status.as_u16()),
                    details,
                )
            } else {
                HealthCheckResult::unhealthy(critical, format!("HTTP {}", status.as_u16()), details)
            }
        }
        Err(e) if e.is_timeout() => HealthCheckResult::unhealthy(
            critical,
            format!("Timeout after {}s", timeout.as_secs()),
            serde_json::Value::Null,
        ),
        Err(e) if e.is_connect() => HealthCheckResult::unhealthy(
            critical,
            connect_failure_message(&e),
            serde_json::Value::Null,
        ),
        Err(e) => HealthCheckResult::unhealthy(
            critical,
            format!("Request failed: {e}"),
            serde_json::Value::Null,
        ),
    }
}

/// "Connection refused" when the socket was refused, otherwise the innermost
/// cause (DNS, TLS, unreachable network).
fn connect_failure_message(err: &reqwest::Error) -> String {
    let mut root = None;
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let refused = cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::ConnectionRefused);
        if refused {
            return "Connection refused".to_owned();
        }
        root = Some(cause);
        source = cause.source();
    }

    match root {
        Some(cause) => format!("Connection failed: {cause}"),
        None => format!("Connection failed: {err}"),
    }
}

/// Parse the data line of `df -P` output.
pub fn parse_df_output(stdout: &str) -> Option<DiskUsage> {
    let line = stdout.lines().nth(1)?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 6 {
        return None;
    }

    Some(DiskUsage {
        filesystem: parts[0].to_owned(),
        size_kb: parts[1].parse().ok()?,
        used_kb: parts[2].parse().ok()?,
        available_kb: parts[3].parse().ok()?,
        use_percent: parts[4].trim_end_matches('%').parse().ok()?,
        mounted_on: parts[5..].join(" "),
    })
}

/// Build the disk probe result from `df -P` output.
pub fn disk_result_from_output(stdout: &str, threshold: u8, critical: bool) -> HealthCheckResult {
    let Some(usage) = parse_df_output(stdout) else {
        return HealthCheckResult::unhealthy(critical, "Invalid df output", serde_json::Value::Null);
    };

    let details = json!({
        "filesystem": usage.filesystem,
        "size_kb": usage.size_kb,
        "used_kb": usage.used_kb,
        "available_kb": usage.available_kb,
        "use_percent": usage.use_percent,
        "mounted_on": usage.mounted_on,
    });

    if usage.use_percent >= u32::from(threshold) {
        HealthCheckResult::unhealthy(
            critical,
            format!("Disk usage high: {}%", usage.use_percent),
            details,
        )
    } else {
        HealthCheckResult::healthy(
            critical,
            format!("Disk usage normal: {}%", usage.use_percent),
            details,
        )
    }
}

/// Probe filesystem usage of a mount point via `df -P`.
pub async fn check_disk_space(
    mount: &Path,
    threshold: u8,
    critical: bool,
    timeout: Duration,
) -> HealthCheckResult {
    let mount = mount.to_string_lossy();
    match run_command("df", &["-P", &mount], timeout).await {
        Ok(output) if output.success() => {
            disk_result_from_output(&output.stdout, threshold, critical)
        }
        Ok(output) => HealthCheckResult::unhealthy(
            critical,
            format!("Failed to get disk usage: {}", output.stderr.trim()),
            serde_json::Value::Null,
        ),
        Err(e) => HealthCheckResult::unhealthy(
            critical,
            format!("Disk check failed: {e}"),
            serde_json::Value::Null,
        ),
    }
}

/// Parse the `Mem:` line of `free -m` output.
pub fn parse_free_output(stdout: &str) -> Option<MemoryUsage> {
    let line = stdout
        .lines()
        .find(|l| l.trim_start().starts_with("Mem:"))?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 7 {
        return None;
    }

    let total_mb: u32 = parts[1].parse().ok()?;
    if total_mb == 0 {
        return None;
    }

    Some(MemoryUsage {
        total_mb,
        used_mb: parts[2].parse().ok()?,
        available_mb: parts[6].parse().ok()?,
    })
}

/// Build the memory probe result from `free -m` output.
pub fn memory_result_from_output(stdout: &str, threshold: u8, critical: bool) -> HealthCheckResult {
    let Some(usage) = parse_free_output(stdout) else {
        return HealthCheckResult::unhealthy(
            critical,
            "Invalid free output",
            serde_json::Value::Null,
        );
    };

    let percent = usage.usage_percent();
    let details = json!({
        "total_mb": usage.total_mb,
        "used_mb": usage.used_mb,
        "available_mb": usage.available_mb,
        "usage_percent": percent,
    });

    if percent >= f64::from(threshold) {
        HealthCheckResult::unhealthy(critical, format!("Memory usage high: {percent}%"), details)
    } else {
        HealthCheckResult::healthy(critical, format!("Memory usage normal: {percent}%"), details)
    }
}

/// Probe memory pressure via `free -m`.
pub async fn check_memory_usage(threshold: u8, critical: bool, timeout: Duration) -> HealthCheckResult {
    match run_command("free", &["-m"], timeout).await {
        Ok(output) if output.success() => {
            memory_result_from_output(&output.stdout, threshold, critical)
        }
        Ok(output) => HealthCheckResult::unhealthy(
            critical,
            format!("Failed to get memory usage: {}", output.stderr.trim()),
            serde_json::Value::Null,
        ),
        Err(e) => HealthCheckResult::unhealthy(
            critical,
            format!("Memory check failed: {e}"),
            serde_json::Value::Null,
        ),
    }
}

/// Extract CPU idle/usage from the `%Cpu(s)` line of `top -bn1` output.
pub fn parse_top_idle(stdout: &str) -> Option<CpuMetrics> {
    let line = stdout.lines().find(|l| l.contains("%Cpu(s)"))?;
    let summary = line.split_once(':').map_or(line, |(_, rest)| rest);
    let idle: f64 = summary
        .split(',')
        .find(|part| part.trim_end().ends_with("id"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;

    Some(CpuMetrics {
        usage_percent: round_to(100.0 - idle, 1),
        idle_percent: round_to(idle, 1),
    })
}

/// Count processes in `ps aux` output, excluding the header.
pub fn parse_process_count(stdout: &str) -> u64 {
    let lines = stdout.lines().filter(|l| !l.trim().is_empty()).count();
    u64::try_from(lines.saturating_sub(1)).unwrap_or(0)
}

/// Sum receive and transmit byte counters from `/proc/net/dev`.
pub fn parse_net_dev(text: &str) -> Option<NetworkMetrics> {
    let mut metrics = NetworkMetrics {
        bytes_received: 0,
        bytes_sent: 0,
    };
    let mut interfaces = 0usize;

    for line in text.lines().skip(2) {
        let Some((_, counters)) = line.split_once(':') else {
            continue;
        };
        let values: Vec<&str> = counters.split_whitespace().collect();
        if values.len() < 9 {
            continue;
        }
        let (Ok(rx), Ok(tx)) = (values[0].parse::<u64>(), values[8].parse::<u64>()) else {
            continue;
        };
        metrics.bytes_received = metrics.bytes_received.saturating_add(rx);
        metrics.bytes_sent = metrics.bytes_sent.saturating_add(tx);
        interfaces = interfaces.saturating_add(1);
    }

    (interfaces > 0).then_some(metrics)
}

/// Collect host metrics; every source is optional.
pub async fn collect_system_metrics(timeout: Duration) -> SystemMetrics {
    let mut metrics = SystemMetrics::default();

    match run_command("top", &["-bn1"], timeout).await {
        Ok(output) if output.success() => metrics.cpu = parse_top_idle(&output.stdout),
        Ok(output) => debug!(code = ?output.exit_code, "top exited unsuccessfully"),
        Err(e) => debug!(error = %e, "failed to collect cpu metrics"),
    }

    match run_command("ps", &["aux"], timeout).await {
        Ok(output) if output.success() => {
            metrics.process_count = Some(parse_process_count(&output.stdout));
        }
        Ok(output) => debug!(code = ?output.exit_code, "ps exited unsuccessfully"),
        Err(e) => debug!(error = %e, "failed to collect process count"),
    }

    match tokio::fs::read_to_string("/proc/net/dev").await {
        Ok(text) => metrics.network = parse_net_dev(&text),
        Err(e) => debug!(error = %e, "failed to read network counters"),
    }

    metrics
}

/// Runs the configured probe battery.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    command_timeout: Duration,
}

impl HealthMonitor {
    /// Create a monitor from the health settings.
    pub fn new(config: HealthConfig, command_timeout: Duration) -> Self {
        Self {
            config,
            command_timeout,
        }
    }

    /// Whether the health phase is enabled.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Run every probe in order, roll up, and collect metrics.
    pub async fn run_all_checks(&self) -> HealthReport {
        let timestamp = Utc::now();
        let DatabaseCheck {
            path,
            timeout_secs: db_timeout,
            critical: db_critical,
        } = &self.config.database;
        let HttpCheck {
            url,
            timeout_secs: http_timeout,
            critical: http_critical,
        } = &self.config.http;
        let DiskCheck {
            mount,
            threshold_percent: disk_threshold,
            critical: disk_critical,
        } = &self.config.disk;
        let MemoryCheck {
            threshold_percent: memory_threshold,
            critical: memory_critical,
        } = &self.config.memory;

        let checks = vec![
            NamedCheck {
                name: "database".to_owned(),
                result: check_database(path, Duration::from_secs(*db_timeout), *db_critical).await,
            },
            NamedCheck {
                name: "http".to_owned(),
                result: check_http_endpoint(url, Duration::from_secs(*http_timeout), *http_critical)
                    .await,
            },
            NamedCheck {
                name: "disk".to_owned(),
                result: check_disk_space(mount, *disk_threshold, *disk_critical, self.command_timeout)
                    .await,
            },
            NamedCheck {
                name: "memory".to_owned(),
                result: check_memory_usage(*memory_threshold, *memory_critical, self.command_timeout)
                    .await,
            },
        ];

        for check in &checks {
            if check.result.is_unhealthy() {
                warn!(
                    check = %check.name,
                    critical = check.result.critical,
                    message = %check.result.message,
                    "health check failed"
                );
            } else {
                info!(check = %check.name, message = %check.result.message, "health check passed");
            }
        }

        let overall_status = rollup(checks.iter().map(|c| &c.result));
        let metrics = collect_system_metrics(self.command_timeout).await;

        HealthReport {
            timestamp,
            checks,
            overall_status,
            metrics,
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
