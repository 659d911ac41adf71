//! Append-only JSONL alert sink.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of the alert log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// When the alert was raised (RFC 3339).
    pub timestamp: String,
    /// Action type that raised it.
    pub action: String,
    /// Action description.
    pub description: String,
}

impl AlertRecord {
    /// Build an `alert` action record stamped with `at`.
    pub fn new(description: &str, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: at.to_rfc3339(),
            action: "alert".to_owned(),
            description: description.to_owned(),
        }
    }
}

/// Writes alert records to a JSONL file, creating it on first use.
#[derive(Debug, Clone)]
pub struct AlertSink {
    path: PathBuf,
}

impl AlertSink {
    /// Create a sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the alert log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single JSON line.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// file cannot be opened or written.
    pub fn append(&self, record: &AlertRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create alert log directory {}", parent.display())
                })?;
            }
        }

        let mut line = serde_json::to_string(record).context("failed to serialize alert")?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open alert log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to write alert log {}", self.path.display()))?;

        Ok(())
    }

    /// Read every record currently in the alert log, skipping malformed lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn read_all(&self) -> anyhow::Result<Vec<AlertRecord>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read alert log {}", self.path.display()))
            }
        };

        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
