//! Tests for per-pattern cooldown tracking.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use mender::cooldown::CooldownTracker;
use mender::db::StateDb;

const PERIOD: Duration = Duration::from_secs(300);

#[test]
fn no_record_means_no_cooldown() {
    let tracker = CooldownTracker::new();
    assert!(!tracker.is_in_cooldown("oom", PERIOD, Utc::now()));
    assert!(tracker.is_empty());
}

#[tokio::test]
async fn cooldown_window_boundaries() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid timestamp");
    let mut tracker = CooldownTracker::new();
    tracker.record_attempt("oom", t0).await;

    assert!(tracker.is_in_cooldown("oom", PERIOD, t0));
    assert!(tracker.is_in_cooldown("oom", PERIOD, t0 + chrono::Duration::seconds(299)));
    assert!(!tracker.is_in_cooldown("oom", PERIOD, t0 + chrono::Duration::seconds(300)));
    assert!(!tracker.is_in_cooldown("oom", PERIOD, t0 + chrono::Duration::seconds(301)));
    assert_eq!(tracker.last_attempt("oom"), Some(t0));
}

#[tokio::test]
async fn cooldowns_are_keyed_by_pattern_id() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid timestamp");
    let mut tracker = CooldownTracker::new();
    tracker.record_attempt("oom", t0).await;

    assert!(tracker.is_in_cooldown("oom", PERIOD, t0));
    assert!(!tracker.is_in_cooldown("disk_full", PERIOD, t0));
    assert_eq!(tracker.len(), 1);
}

#[tokio::test]
async fn new_attempt_overwrites_previous_record() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid timestamp");
    let t1 = t0 + chrono::Duration::seconds(600);
    let mut tracker = CooldownTracker::new();
    tracker.record_attempt("oom", t0).await;
    tracker.record_attempt("oom", t1).await;

    assert_eq!(tracker.last_attempt("oom"), Some(t1));
    assert!(tracker.is_in_cooldown("oom", PERIOD, t1 + chrono::Duration::seconds(10)));
}

#[tokio::test]
async fn clock_moving_backwards_keeps_cooldown_active() {
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid timestamp");
    let mut tracker = CooldownTracker::new();
    tracker.record_attempt("oom", t0).await;

    assert!(tracker.is_in_cooldown("oom", PERIOD, t0 - chrono::Duration::seconds(60)));
}

#[tokio::test]
async fn persisted_cooldowns_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("state.db");
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("valid timestamp");

    {
        let db = StateDb::open(&db_path).await.expect("open db");
        let mut tracker = CooldownTracker::with_store(db).await;
        tracker.record_attempt("oom", t0).await;
    }

    let db = StateDb::open(&db_path).await.expect("reopen db");
    let tracker = CooldownTracker::with_store(db).await;

    assert_eq!(tracker.last_attempt("oom"), Some(t0));
    assert!(tracker.is_in_cooldown("oom", PERIOD, t0 + chrono::Duration::seconds(30)));
}
