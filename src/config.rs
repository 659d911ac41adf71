//! Daemon settings loaded from `mender.toml`.
//!
//! Every section uses `#[serde(default)]`, so a minimal or empty file is
//! valid and a missing file yields the defaults. The error pattern rule set
//! lives in a separate JSON file, see [`crate::rules`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level daemon settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Log files scanned every cycle.
    #[serde(default)]
    pub logs: LogsConfig,

    /// Health probe definitions.
    #[serde(default)]
    pub health: HealthConfig,

    /// Alert sink location.
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// State database for cooldowns and remediation history.
    #[serde(default)]
    pub state: StateConfig,

    /// How host commands are invoked.
    #[serde(default)]
    pub host: HostConfig,

    /// Continuous-run loop timing.
    #[serde(default)]
    pub run: RunConfig,
}

/// Log sources to scan.
#[derive(Debug, Clone, Deserialize)]
pub struct LogsConfig {
    /// Paths of plain-text log files.
    #[serde(default = "default_log_sources")]
    pub sources: Vec<PathBuf>,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            sources: default_log_sources(),
        }
    }
}

/// Health probe battery.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Run the health phase at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SQLite reachability probe.
    #[serde(default)]
    pub database: DatabaseCheck,

    /// HTTP liveness probe.
    #[serde(default)]
    pub http: HttpCheck,

    /// Filesystem usage probe.
    #[serde(default)]
    pub disk: DiskCheck,

    /// Memory pressure probe.
    #[serde(default)]
    pub memory: MemoryCheck,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database: DatabaseCheck::default(),
            http: HttpCheck::default(),
            disk: DiskCheck::default(),
            memory: MemoryCheck::default(),
        }
    }
}

/// SQLite reachability probe definition.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseCheck {
    /// Database file path.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Probe timeout in seconds.
    #[serde(default = "default_database_timeout_secs")]
    pub timeout_secs: u64,

    /// Whether a failure forces the aggregate to critical.
    #[serde(default = "default_true")]
    pub critical: bool,
}

impl Default for DatabaseCheck {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            timeout_secs: default_database_timeout_secs(),
            critical: true,
        }
    }
}

/// HTTP liveness probe definition.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpCheck {
    /// Endpoint queried with a single GET.
    #[serde(default = "default_http_url")]
    pub url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,

    /// Whether a failure forces the aggregate to critical.
    #[serde(default = "default_true")]
    pub critical: bool,
}

impl Default for HttpCheck {
    fn default() -> Self {
        Self {
            url: default_http_url(),
            timeout_secs: default_http_timeout_secs(),
            critical: true,
        }
    }
}

/// Filesystem usage probe definition.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskCheck {
    /// Mount point to inspect.
    #[serde(default = "default_disk_mount")]
    pub mount: PathBuf,

    /// Usage percent at or above which the probe is unhealthy.
    #[serde(default = "default_disk_threshold")]
    pub threshold_percent: u8,

    /// Whether a failure forces the aggregate to critical.
    #[serde(default = "default_true")]
    pub critical: bool,
}

impl Default for DiskCheck {
    fn default() -> Self {
        Self {
            mount: default_disk_mount(),
            threshold_percent: default_disk_threshold(),
            critical: true,
        }
    }
}

/// Memory pressure probe definition.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryCheck {
    /// Used/total percent at or above which the probe is unhealthy.
    #[serde(default = "default_memory_threshold")]
    pub threshold_percent: u8,

    /// Whether a failure forces the aggregate to critical.
    #[serde(default)]
    pub critical: bool,
}

impl Default for MemoryCheck {
    fn default() -> Self {
        Self {
            threshold_percent: default_memory_threshold(),
            critical: false,
        }
    }
}

/// Alert sink location.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    /// Append-only JSONL alert log.
    #[serde(default = "default_alert_log")]
    pub log_path: PathBuf,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            log_path: default_alert_log(),
        }
    }
}

/// State database settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// SQLite file holding cooldowns and remediation history.
    #[serde(default = "default_state_db")]
    pub db_path: PathBuf,

    /// Reload cooldowns after a restart.
    #[serde(default = "default_true")]
    pub persist_cooldowns: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_state_db(),
            persist_cooldowns: true,
        }
    }
}

/// Host command invocation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Prefix privileged commands with `sudo`.
    #[serde(default = "default_true")]
    pub use_sudo: bool,

    /// Timeout for every host command, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            use_sudo: true,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl HostConfig {
    /// Command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Continuous-run loop timing.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Cycles per iteration.
    #[serde(default = "default_loop_count")]
    pub loop_count: u32,

    /// Minutes to wait between iterations.
    #[serde(default = "default_wait_minutes")]
    pub wait_minutes: u64,

    /// Seconds to pause between cycles of one iteration.
    #[serde(default = "default_cycle_pause_secs")]
    pub cycle_pause_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            loop_count: default_loop_count(),
            wait_minutes: default_wait_minutes(),
            cycle_pause_secs: default_cycle_pause_secs(),
        }
    }
}

impl Settings {
    /// Validate that settings values are within sane bounds.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=100).contains(&self.health.disk.threshold_percent),
            "health.disk.threshold_percent must be in [1, 100]"
        );
        anyhow::ensure!(
            (1..=100).contains(&self.health.memory.threshold_percent),
            "health.memory.threshold_percent must be in [1, 100]"
        );
        anyhow::ensure!(
            self.health.database.timeout_secs >= 1,
            "health.database.timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.health.http.timeout_secs >= 1,
            "health.http.timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.health.http.url.starts_with("http://")
                || self.health.http.url.starts_with("https://"),
            "health.http.url must be an http(s) URL"
        );
        anyhow::ensure!(
            self.host.command_timeout_secs >= 1,
            "host.command_timeout_secs must be >= 1"
        );
        anyhow::ensure!(self.run.loop_count >= 1, "run.loop_count must be >= 1");
        Ok(())
    }
}

/// Parse and validate settings from TOML text.
///
/// # Errors
///
/// Returns an error if the text is not valid TOML or fails validation.
pub fn parse_settings(text: &str) -> anyhow::Result<Settings> {
    let settings: Settings = toml::from_str(text).context("failed to parse settings TOML")?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings from a TOML file, using defaults when the file is absent.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, parsed, or fails
/// validation.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::info!(path = %path.display(), "loading settings from file");
            parse_settings(&contents)
                .with_context(|| format!("invalid settings at {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no settings file found, using defaults");
            Ok(Settings::default())
        }
        Err(e) => {
            Err(e).with_context(|| format!("failed to read settings at {}", path.display()))
        }
    }
}

// Default value functions for serde.

fn default_log_sources() -> Vec<PathBuf> {
    vec![
        PathBuf::from("logs/app.log"),
        PathBuf::from("logs/mender.log"),
        PathBuf::from("logs/alerts.log"),
        PathBuf::from("/var/log/syslog"),
    ]
}

fn default_database_path() -> PathBuf {
    PathBuf::from("app.db")
}

fn default_database_timeout_secs() -> u64 {
    5
}

fn default_http_url() -> String {
    "http://localhost:5100/api/health".to_owned()
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_disk_mount() -> PathBuf {
    PathBuf::from("/")
}

fn default_disk_threshold() -> u8 {
    90
}

fn default_memory_threshold() -> u8 {
    85
}

fn default_alert_log() -> PathBuf {
    PathBuf::from("logs/alerts.log")
}

fn default_state_db() -> PathBuf {
    PathBuf::from("mender-state.db")
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_loop_count() -> u32 {
    15
}

fn default_wait_minutes() -> u64 {
    5
}

fn default_cycle_pause_secs() -> u64 {
    2
}

fn default_true() -> bool {
    true
}
