//! Per-pattern remediation cooldowns.
//!
//! Keyed by pattern id only: the same pattern firing in two different log
//! files shares one cooldown. Time is always passed in by the caller.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::db::StateDb;

/// Tracks the last remediation attempt per pattern id.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    last_attempt: HashMap<String, DateTime<Utc>>,
    store: Option<StateDb>,
}

impl CooldownTracker {
    /// Create an empty, memory-only tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker backed by the state database, preloading every
    /// persisted record.
    ///
    /// A failed preload is logged and the tracker starts empty.
    pub async fn with_store(store: StateDb) -> Self {
        let last_attempt = match store.load_cooldowns().await {
            Ok(map) => {
                info!(count = map.len(), "loaded persisted cooldowns");
                map
            }
            Err(e) => {
                warn!(error = %e, "failed to load persisted cooldowns, starting empty");
                HashMap::new()
            }
        };

        Self {
            last_attempt,
            store: Some(store),
        }
    }

    /// Whether remediation for `pattern_id` is suppressed at `now`.
    ///
    /// False when no attempt has been recorded; otherwise true iff less than
    /// `period` has elapsed since the last attempt. A last attempt in the
    /// future (clock moved backwards) counts as zero elapsed.
    pub fn is_in_cooldown(&self, pattern_id: &str, period: Duration, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_attempt.get(pattern_id) else {
            return false;
        };

        let elapsed = now
            .signed_duration_since(*last)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed < period
    }

    /// Time of the last recorded attempt for `pattern_id`.
    pub fn last_attempt(&self, pattern_id: &str) -> Option<DateTime<Utc>> {
        self.last_attempt.get(pattern_id).copied()
    }

    /// Record an attempt at `now`, overwriting any previous record.
    ///
    /// With a backing store the record is also persisted; persistence
    /// failures are logged and otherwise ignored.
    pub async fn record_attempt(&mut self, pattern_id: &str, now: DateTime<Utc>) {
        self.last_attempt.insert(pattern_id.to_owned(), now);

        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_cooldown(pattern_id, now).await {
                warn!(pattern = %pattern_id, error = %e, "failed to persist cooldown");
            }
        }
    }

    /// Number of patterns with a recorded attempt.
    pub fn len(&self) -> usize {
        self.last_attempt.len()
    }

    /// Whether no attempt has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.last_attempt.is_empty()
    }
}
