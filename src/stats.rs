//! Run statistics accumulated over the daemon's lifetime.
//!
//! Counters never decrease. An attempt and its outcome are recorded in the
//! same call, so `fixes_attempted == fixes_succeeded + fixes_failed` holds
//! whenever the statistics are observed between cycles.

use serde::Serialize;

/// Lifetime counters for detections and remediation attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    /// Error detections across all cycles.
    pub errors_detected: u64,
    /// Remediation attempts made.
    pub fixes_attempted: u64,
    /// Attempts where every action succeeded.
    pub fixes_succeeded: u64,
    /// Attempts where at least one action failed.
    pub fixes_failed: u64,
}

impl RunStatistics {
    /// Count one error detection.
    pub fn record_detection(&mut self) {
        self.errors_detected = self.errors_detected.saturating_add(1);
    }

    /// Count one remediation attempt together with its outcome.
    pub fn record_fix(&mut self, succeeded: bool) {
        self.fixes_attempted = self.fixes_attempted.saturating_add(1);
        if succeeded {
            self.fixes_succeeded = self.fixes_succeeded.saturating_add(1);
        } else {
            self.fixes_failed = self.fixes_failed.saturating_add(1);
        }
    }

    /// Whether attempts equal successes plus failures.
    pub fn is_consistent(&self) -> bool {
        self.fixes_succeeded.checked_add(self.fixes_failed) == Some(self.fixes_attempted)
    }

    /// Fraction of attempts that succeeded, or `None` before the first attempt.
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        if self.fixes_attempted == 0 {
            return None;
        }
        Some(self.fixes_succeeded as f64 / self.fixes_attempted as f64)
    }

    /// Log a one-line summary of the counters.
    pub fn log_summary(&self) {
        tracing::info!(
            errors_detected = self.errors_detected,
            fixes_attempted = self.fixes_attempted,
            fixes_succeeded = self.fixes_succeeded,
            fixes_failed = self.fixes_failed,
            "run statistics"
        );
    }
}
