//! End-to-end tests for detection cycles and the continuous loop.

mod common;

use std::sync::Arc;
use std::time::Duration;

use mender::alerts::AlertSink;
use mender::config::RunConfig;
use mender::daemon::{Daemon, RunContext, RunSchedule, ScanSummary};
use mender::host::Host;
use mender::rules::RuleSet;
use tokio::sync::watch;

use common::{test_settings, write_file, FakeHost};

const RULES: &str = r#"{
    "error_patterns": [
        {
            "id": "out_of_memory",
            "name": "Out of memory",
            "pattern": "heap out of memory|OutOfMemory",
            "severity": "critical",
            "auto_fix": true,
            "actions": [
                { "type": "service_restart", "description": "Restart app", "service": "app" }
            ]
        },
        {
            "id": "database_lock_error",
            "name": "Database locked",
            "pattern": "database is locked",
            "severity": "high",
            "auto_fix": false,
            "actions": [
                { "type": "alert", "description": "lock contention" }
            ]
        },
        {
            "id": "mystery",
            "name": "Mystery failure",
            "pattern": "mystery failure",
            "severity": "medium",
            "auto_fix": true,
            "actions": [
                { "type": "summon_wizard", "description": "nobody knows" },
                { "type": "alert", "description": "mystery failure seen" }
            ]
        }
    ],
    "auto_fix_config": { "cooldown_period": 300 }
}"#;

fn rules() -> RuleSet {
    RuleSet::from_json(RULES).expect("parse rules")
}

fn daemon_for(dir: &std::path::Path, log_contents: &str) -> (Daemon, Arc<FakeHost>) {
    let log = write_file(dir, "app.log", log_contents);
    let settings = test_settings(dir, vec![log]);
    let host = Arc::new(FakeHost::default());
    let dyn_host: Arc<dyn Host> = host.clone();
    (Daemon::new(&settings, rules(), dyn_host, None), host)
}

#[tokio::test]
async fn detected_error_is_fixed_once_then_cooled_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, host) = daemon_for(
        dir.path(),
        "GET /api 200\nFATAL ERROR: JavaScript heap out of memory\n",
    );
    let mut ctx = RunContext::default();

    let first = daemon
        .run_detection_cycle(&mut ctx, 1)
        .await
        .expect("cycle 1");
    assert_eq!(first.cycle, 1);
    assert_eq!(first.health_status, None);
    assert_eq!(first.detected, 1);
    assert_eq!(first.attempted, 1);
    assert_eq!(first.succeeded, 1);
    assert_eq!(ctx.stats.errors_detected, 1);
    assert_eq!(ctx.stats.fixes_attempted, 1);
    assert_eq!(ctx.stats.fixes_succeeded, 1);

    let second = daemon
        .run_detection_cycle(&mut ctx, 2)
        .await
        .expect("cycle 2");
    assert_eq!(second.detected, 1);
    assert_eq!(second.attempted, 0);
    assert_eq!(second.skipped_cooldown, 1);
    assert_eq!(ctx.stats.errors_detected, 2);
    assert_eq!(ctx.stats.fixes_attempted, 1);
    assert_eq!(ctx.cycles_completed, 2);

    assert_eq!(host.calls(), vec!["restart app"]);
    assert!(ctx.stats.is_consistent());
}

#[tokio::test]
async fn same_pattern_in_two_logs_shares_one_cooldown_slot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = write_file(dir.path(), "app.log", "JavaScript heap out of memory\n");
    let worker = write_file(dir.path(), "worker.log", "java.lang.OutOfMemoryError\n");
    let settings = test_settings(dir.path(), vec![app, worker]);
    let host = Arc::new(FakeHost::default());
    let dyn_host: Arc<dyn Host> = host.clone();
    let daemon = Daemon::new(&settings, rules(), dyn_host, None);
    let mut ctx = RunContext::default();

    let report = daemon
        .run_detection_cycle(&mut ctx, 1)
        .await
        .expect("cycle");

    assert_eq!(report.detected, 2);
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped_cooldown, 1);
    assert_eq!(host.calls(), vec!["restart app"]);
    assert_eq!(ctx.stats.errors_detected, 2);
    assert_eq!(ctx.stats.fixes_attempted, 1);
}

#[tokio::test]
async fn unknown_action_fails_fix_but_later_alert_still_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, _) = daemon_for(dir.path(), "worker crashed: Mystery Failure\n");
    let mut ctx = RunContext::default();

    let report = daemon
        .run_detection_cycle(&mut ctx, 1)
        .await
        .expect("cycle");

    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(ctx.stats.fixes_failed, 1);

    let alerts = AlertSink::new(dir.path().join("alerts.log"))
        .read_all()
        .expect("read alerts");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].description, "mystery failure seen");
}

#[tokio::test]
async fn patterns_without_auto_fix_are_only_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, host) = daemon_for(dir.path(), "SqliteError: database is locked\n");
    let mut ctx = RunContext::default();

    let report = daemon
        .scan_and_remediate(&mut ctx)
        .await
        .expect("scan");

    assert_eq!(report.detected, 1);
    assert_eq!(report.skipped_disabled, 1);
    assert_eq!(report.attempted, 0);
    assert!(host.calls().is_empty());
    assert!(ctx.cooldowns.is_empty());

    let summary = ScanSummary::new(&report, &ctx.stats);
    assert_eq!(summary.errors_detected, 1);
    assert_eq!(summary.fixes_attempted, 0);
    assert_eq!(summary.last_error_id.as_deref(), Some("database_lock_error"));
    assert_eq!(
        summary.last_error_summary.as_deref(),
        Some("Database locked: SqliteError: database is locked")
    );
}

#[tokio::test]
async fn clean_logs_produce_an_empty_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (daemon, host) = daemon_for(dir.path(), "all good\n");
    let mut ctx = RunContext::default();

    let report = daemon
        .run_detection_cycle(&mut ctx, 1)
        .await
        .expect("cycle");

    assert_eq!(report.detected, 0);
    assert_eq!(report.last_error, None);
    assert_eq!(ctx.stats.errors_detected, 0);
    assert!(host.calls().is_empty());
}

#[test]
fn schedule_converts_wait_minutes_to_seconds() {
    let schedule = RunSchedule::from(&RunConfig {
        loop_count: 4,
        wait_minutes: 5,
        cycle_pause_secs: 2,
    });
    assert_eq!(schedule.loop_count, 4);
    assert_eq!(schedule.cycle_pause, Duration::from_secs(2));
    assert_eq!(schedule.iteration_wait, Duration::from_secs(300));
}

fn quiet_daemon(dir: &std::path::Path) -> Daemon {
    let settings = test_settings(dir, Vec::new());
    let host: Arc<dyn Host> = Arc::new(FakeHost::default());
    Daemon::new(&settings, rules(), host, None)
}

#[tokio::test]
async fn shutdown_before_start_runs_no_cycles() {
    let dir = tempfile::tempdir().expect("tempdir");
    let daemon = quiet_daemon(dir.path());
    let mut ctx = RunContext::default();
    let (_tx, rx) = watch::channel(true);

    let schedule = RunSchedule {
        loop_count: 3,
        cycle_pause: Duration::from_secs(1),
        iteration_wait: Duration::from_secs(60),
    };
    daemon
        .run_continuous(&mut ctx, schedule, rx)
        .await
        .expect("run");

    assert_eq!(ctx.cycles_completed, 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_cycle_pause_stops_the_iteration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let daemon = quiet_daemon(dir.path());
    let mut ctx = RunContext::default();
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        let _ = tx.send(true);
    });

    let schedule = RunSchedule {
        loop_count: 3,
        cycle_pause: Duration::from_secs(2),
        iteration_wait: Duration::from_secs(60),
    };
    daemon
        .run_continuous(&mut ctx, schedule, rx)
        .await
        .expect("run");

    // Cycles at t=0 and t=2; shutdown at t=3 interrupts the second pause.
    assert_eq!(ctx.cycles_completed, 2);
}

#[tokio::test(start_paused = true)]
async fn iterations_repeat_after_the_wait() {
    let dir = tempfile::tempdir().expect("tempdir");
    let daemon = quiet_daemon(dir.path());
    let mut ctx = RunContext::default();
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(61_500)).await;
        let _ = tx.send(true);
    });

    let schedule = RunSchedule {
        loop_count: 2,
        cycle_pause: Duration::from_secs(1),
        iteration_wait: Duration::from_secs(60),
    };
    daemon
        .run_continuous(&mut ctx, schedule, rx)
        .await
        .expect("run");

    // Cycles at t=0, t=1, then t=61 after the iteration wait.
    assert_eq!(ctx.cycles_completed, 3);
}
