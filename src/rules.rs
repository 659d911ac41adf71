//! Error pattern rule set loaded from `error_patterns.json`.
//!
//! The rule file is read once at startup. Loading never fails: a missing or
//! malformed file degrades to an empty rule set with default auto-fix
//! tunables, and the cause is logged.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, info, warn};

/// Severity attached to an error pattern.
///
/// Unknown severity names deserialize as [`Severity::Info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Severity {
    /// Informational only.
    Info,
    /// Low impact.
    Low,
    /// Worth a look.
    Warning,
    /// May need attention soon.
    Medium,
    /// Needs attention now.
    High,
    /// Service is down or at risk.
    Critical,
}

impl From<String> for Severity {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "warning" => Self::Warning,
            "medium" => Self::Medium,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Info,
        }
    }
}

/// One remediation step of an error pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Free-form description, used in logs and alert records.
    pub description: String,
    /// What to do.
    pub kind: ActionKind,
}

/// Closed set of remediation behaviors.
///
/// Deserialized from the `type` tag of an action object. Tags that name no
/// known behavior become [`ActionKind::Unknown`], and known tags whose
/// parameters do not fit become [`ActionKind::Invalid`]. Both always fail
/// when run without affecting the rest of the rule set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Restart an OS service.
    ServiceRestart {
        /// Service unit name.
        #[serde(default)]
        service: Option<String>,
    },
    /// Rename oversized log files aside.
    LogRotate {
        /// Log files to inspect.
        #[serde(default)]
        log_files: Vec<PathBuf>,
    },
    /// Remove and recreate cache directories.
    CacheClear {
        /// Cache directories.
        #[serde(default)]
        directories: Vec<PathBuf>,
    },
    /// Delete regular files directly under each directory.
    TempFileCleanup {
        /// Temp directories.
        #[serde(default)]
        directories: Vec<PathBuf>,
    },
    /// Create directories (and parents) when absent.
    CreateMissingDirs {
        /// Directories to ensure.
        #[serde(default)]
        directories: Vec<PathBuf>,
    },
    /// Recursively set owner and mode.
    FixPermissions {
        /// Paths to fix.
        #[serde(default)]
        paths: Vec<PathBuf>,
        /// Owner passed to `chown -R`.
        #[serde(default = "default_owner")]
        owner: String,
        /// Mode passed to `chmod -R`.
        #[serde(default = "default_mode")]
        mode: String,
    },
    /// Report whether a TCP port is in use.
    CheckPort {
        /// TCP port.
        #[serde(default, deserialize_with = "lenient_port")]
        port: Option<u16>,
    },
    /// Kill whatever process is bound to a TCP port.
    KillProcessOnPort {
        /// TCP port.
        #[serde(default, deserialize_with = "lenient_port")]
        port: Option<u16>,
    },
    /// Recursively delete files older than `days`.
    OldFileCleanup {
        /// Directories to sweep.
        #[serde(default)]
        directories: Vec<PathBuf>,
        /// Age threshold in days.
        #[serde(default = "default_days", deserialize_with = "lenient_days")]
        days: u64,
    },
    /// Append an alert record to the alert log.
    Alert,
    /// Read-only analysis placeholder.
    LogAnalysis,
    /// Unrecognized `type` tag.
    #[serde(skip_deserializing)]
    Unknown {
        /// The tag as written in the rule file.
        kind: String,
    },
    /// Known tag whose parameters could not be read.
    #[serde(skip_deserializing)]
    Invalid {
        /// The tag as written in the rule file.
        kind: String,
        /// Why the parameters were rejected.
        reason: String,
    },
}

/// Tags accepted by [`ActionKind`]'s derived deserializer.
const KNOWN_ACTION_TAGS: &[&str] = &[
    "service_restart",
    "log_rotate",
    "cache_clear",
    "temp_file_cleanup",
    "create_missing_dirs",
    "fix_permissions",
    "check_port",
    "kill_process_on_port",
    "old_file_cleanup",
    "alert",
    "log_analysis",
];

impl ActionKind {
    /// The `type` tag this action was configured with.
    pub fn tag(&self) -> &str {
        match self {
            Self::ServiceRestart { .. } => "service_restart",
            Self::LogRotate { .. } => "log_rotate",
            Self::CacheClear { .. } => "cache_clear",
            Self::TempFileCleanup { .. } => "temp_file_cleanup",
            Self::CreateMissingDirs { .. } => "create_missing_dirs",
            Self::FixPermissions { .. } => "fix_permissions",
            Self::CheckPort { .. } => "check_port",
            Self::KillProcessOnPort { .. } => "kill_process_on_port",
            Self::OldFileCleanup { .. } => "old_file_cleanup",
            Self::Alert => "alert",
            Self::LogAnalysis => "log_analysis",
            Self::Unknown { kind } | Self::Invalid { kind, .. } => kind,
        }
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;

        let description = value
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let tag = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();

        let kind = if KNOWN_ACTION_TAGS.contains(&tag.as_str()) {
            match serde_json::from_value::<ActionKind>(value) {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(action = %tag, error = %e, "invalid action parameters, action will fail");
                    ActionKind::Invalid {
                        kind: tag,
                        reason: e.to_string(),
                    }
                }
            }
        } else {
            ActionKind::Unknown { kind: tag }
        };

        Ok(Self { description, kind })
    }
}

/// A number, or a string holding one.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText<T> {
    Number(T),
    Text(String),
}

impl<T: std::str::FromStr> NumberOrText<T> {
    fn into_number<E: serde::de::Error>(self, what: &str) -> Result<T, E> {
        match self {
            Self::Number(n) => Ok(n),
            Self::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid {what} {text:?}"))),
        }
    }
}

fn lenient_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    Option::<NumberOrText<u16>>::deserialize(deserializer)?
        .map(|port| port.into_number("port"))
        .transpose()
}

fn lenient_days<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    NumberOrText::<u64>::deserialize(deserializer)?.into_number("days")
}

/// A configured log signature and its remediation recipe.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPattern {
    /// Unique identifier, also the cooldown key.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Case-insensitive regular expression matched against log lines.
    pub pattern: String,
    /// Severity level.
    #[serde(default = "default_severity")]
    pub severity: Severity,
    /// Whether detections may trigger remediation.
    #[serde(default)]
    pub auto_fix: bool,
    /// Remediation steps, run in order.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Optional longer description.
    #[serde(default)]
    pub description: Option<String>,
    /// Per-pattern cooldown override in seconds.
    #[serde(default, alias = "cooldown_seconds")]
    pub cooldown_secs: Option<u64>,
}

/// Auto-fix tunables from the `auto_fix_config` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AutoFixConfig {
    /// Declared but not consulted by remediation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Declared but not consulted by remediation.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Minimum seconds between two remediation attempts for one pattern.
    #[serde(default = "default_cooldown_period")]
    pub cooldown_period: u64,
    /// Whether notifications are wanted.
    #[serde(default = "default_true")]
    pub enable_notifications: bool,
    /// Whether a backup should precede remediation.
    #[serde(default = "default_true")]
    pub backup_before_fix: bool,
}

impl Default for AutoFixConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            cooldown_period: default_cooldown_period(),
            enable_notifications: true,
            backup_before_fix: true,
        }
    }
}

/// Raw document shape of the rule file.
#[derive(Debug, Default, Deserialize)]
struct RuleDocument {
    #[serde(default)]
    error_patterns: Vec<ErrorPattern>,
    #[serde(default)]
    health_checks: Vec<serde_json::Value>,
    #[serde(default)]
    auto_fix_config: AutoFixConfig,
}

/// Causes for falling back to an empty rule set.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The rule file does not exist.
    #[error("rule file not found: {0}")]
    NotFound(PathBuf),
    /// The rule file could not be read.
    #[error("failed to read rule file {path}: {source}")]
    Read {
        /// Rule file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The rule file is not a valid rule document.
    #[error("failed to parse rule file {path}: {source}")]
    Parse {
        /// Rule file path.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// An error pattern with its matcher compiled.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    /// The pattern definition.
    pub def: ErrorPattern,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Regex(Regex),
    /// Lowercased literal text.
    Literal(String),
}

impl CompiledPattern {
    /// Compile a pattern's text rule, case-insensitively.
    ///
    /// A rule that is not a valid regular expression is matched as a literal
    /// substring instead.
    pub fn compile(def: ErrorPattern) -> Self {
        let matcher = match RegexBuilder::new(&def.pattern)
            .case_insensitive(true)
            .build()
        {
            Ok(re) => Matcher::Regex(re),
            Err(e) => {
                warn!(
                    pattern = %def.id,
                    error = %e,
                    "invalid regex, matching as literal text"
                );
                Matcher::Literal(def.pattern.to_lowercase())
            }
        };
        Self { def, matcher }
    }

    /// Whether a log line matches this pattern.
    pub fn is_match(&self, line: &str) -> bool {
        match &self.matcher {
            Matcher::Regex(re) => re.is_match(line),
            Matcher::Literal(text) => line.to_lowercase().contains(text.as_str()),
        }
    }
}

/// The loaded, compiled rule set for one daemon run.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Compiled error patterns, ids unique, in file order.
    pub patterns: Vec<CompiledPattern>,
    /// Reserved per-check overrides; carried but unused.
    pub health_checks: Vec<serde_json::Value>,
    /// Auto-fix tunables.
    pub auto_fix: AutoFixConfig,
}

impl RuleSet {
    /// Look up a pattern by id.
    pub fn pattern(&self, id: &str) -> Option<&CompiledPattern> {
        self.patterns.iter().find(|p| p.def.id == id)
    }

    /// Parse a rule document from JSON text.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the text is not a valid rule document.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let doc: RuleDocument = serde_json::from_str(text)?;
        Ok(Self::from_document(doc))
    }

    fn from_document(doc: RuleDocument) -> Self {
        let mut seen = HashSet::new();
        let mut patterns = Vec::with_capacity(doc.error_patterns.len());

        for def in doc.error_patterns {
            if !seen.insert(def.id.clone()) {
                warn!(pattern = %def.id, "duplicate pattern id, keeping the first definition");
                continue;
            }
            patterns.push(CompiledPattern::compile(def));
        }

        Self {
            patterns,
            health_checks: doc.health_checks,
            auto_fix: doc.auto_fix_config,
        }
    }
}

/// Read and parse a rule file.
///
/// # Errors
///
/// Returns a [`RuleError`] describing why the file could not be used.
pub fn try_load_rules(path: &Path) -> Result<RuleSet, RuleError> {
    let text = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            RuleError::NotFound(path.to_path_buf())
        } else {
            RuleError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    RuleSet::from_json(&text).map_err(|source| RuleError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the rule file, falling back to an empty rule set on any failure.
pub fn load_rules(path: &Path) -> RuleSet {
    match try_load_rules(path) {
        Ok(rules) => {
            info!(
                path = %path.display(),
                patterns = rules.patterns.len(),
                "rule file loaded"
            );
            rules
        }
        Err(e) => {
            error!(error = %e, "using empty rule set");
            RuleSet::default()
        }
    }
}

// Default value functions for serde.

fn default_severity() -> Severity {
    Severity::Info
}

fn default_owner() -> String {
    "www-data".to_owned()
}

fn default_mode() -> String {
    "755".to_owned()
}

fn default_days() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

fn default_cooldown_period() -> u64 {
    300
}

fn default_true() -> bool {
    true
}
