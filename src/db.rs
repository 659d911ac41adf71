//! Mender state database backed by SQLite.
//!
//! Stores the last remediation attempt per pattern (so cooldowns survive a
//! restart) and a history of remediation attempts. Migration is applied
//! inline via `include_str!` on first open.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::warn;

/// Mender's own SQLite state database.
#[derive(Debug, Clone)]
pub struct StateDb {
    pool: SqlitePool,
}

/// A row from the `remediations` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationRecord {
    /// Unique record identifier (e.g. "fix-550e8400-e29b-...").
    pub id: String,
    /// Pattern whose actions ran.
    pub pattern_id: String,
    /// Log file the triggering line came from.
    pub log_file: String,
    /// The triggering line, trimmed.
    pub matched_line: String,
    /// When the error was detected (RFC 3339).
    pub detected_at: String,
    /// When remediation ran (RFC 3339).
    pub attempted_at: String,
    /// Whether every action succeeded.
    pub succeeded: bool,
}

impl StateDb {
    /// Open (or create) the state database at the given path and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create state db directory {}", parent.display())
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open state db at {}", path.display()))?;

        let migration_sql = include_str!("../migrations/001_mender_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply mender schema migration")?;

        Ok(Self { pool })
    }

    /// Load every persisted cooldown timestamp.
    ///
    /// Rows with unparseable timestamps are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn load_cooldowns(&self) -> anyhow::Result<HashMap<String, DateTime<Utc>>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT pattern_id, last_attempt FROM cooldowns")
                .fetch_all(&self.pool)
                .await
                .context("failed to query cooldowns")?;

        let mut map = HashMap::with_capacity(rows.len());
        for (pattern_id, last_attempt) in rows {
            match DateTime::parse_from_rfc3339(&last_attempt) {
                Ok(ts) => {
                    map.insert(pattern_id, ts.with_timezone(&Utc));
                }
                Err(e) => {
                    warn!(pattern = %pattern_id, error = %e, "skipping malformed cooldown row");
                }
            }
        }

        Ok(map)
    }

    /// Insert or replace the last attempt time for a pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn upsert_cooldown(&self, pattern_id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO cooldowns (pattern_id, last_attempt)
             VALUES (?1, ?2)
             ON CONFLICT(pattern_id) DO UPDATE SET last_attempt = ?2",
        )
        .bind(pattern_id)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to upsert cooldown")?;

        Ok(())
    }

    /// Insert a remediation history record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn insert_remediation(&self, record: &RemediationRecord) -> anyhow::Result<()> {
        let succeeded_int: i64 = if record.succeeded { 1 } else { 0 };

        sqlx::query(
            "INSERT INTO remediations (id, pattern_id, log_file, matched_line, detected_at, attempted_at, succeeded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&record.id)
        .bind(&record.pattern_id)
        .bind(&record.log_file)
        .bind(&record.matched_line)
        .bind(&record.detected_at)
        .bind(&record.attempted_at)
        .bind(succeeded_int)
        .execute(&self.pool)
        .await
        .context("failed to insert remediation record")?;

        Ok(())
    }

    /// Query the most recent remediation records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails.
    pub async fn recent_remediations(&self, limit: i64) -> anyhow::Result<Vec<RemediationRecord>> {
        let rows = sqlx::query_as::<_, RemediationRow>(
            "SELECT id, pattern_id, log_file, matched_line, detected_at, attempted_at, succeeded
             FROM remediations
             ORDER BY attempted_at DESC, rowid DESC
             LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to query recent remediations")?;

        Ok(rows.into_iter().map(remediation_row_into_record).collect())
    }
}

/// Raw row tuple from the `remediations` table.
type RemediationRow = (String, String, String, String, String, String, i64);

/// Convert a raw `remediations` row tuple into a [`RemediationRecord`].
fn remediation_row_into_record(row: RemediationRow) -> RemediationRecord {
    let (id, pattern_id, log_file, matched_line, detected_at, attempted_at, succeeded) = row;
    RemediationRecord {
        id,
        pattern_id,
        log_file,
        matched_line,
        detected_at,
        attempted_at,
        succeeded: succeeded != 0,
    }
}
