//! Tests for run statistics counters.

use mender::stats::RunStatistics;

#[test]
fn counters_start_at_zero() {
    let stats = RunStatistics::default();
    assert_eq!(stats.errors_detected, 0);
    assert_eq!(stats.fixes_attempted, 0);
    assert!(stats.is_consistent());
    assert_eq!(stats.success_rate(), None);
}

#[test]
fn fix_outcomes_keep_attempts_consistent() {
    let mut stats = RunStatistics::default();
    stats.record_detection();
    stats.record_detection();
    stats.record_detection();
    stats.record_fix(true);
    stats.record_fix(false);
    stats.record_fix(true);

    assert_eq!(stats.errors_detected, 3);
    assert_eq!(stats.fixes_attempted, 3);
    assert_eq!(stats.fixes_succeeded, 2);
    assert_eq!(stats.fixes_failed, 1);
    assert!(stats.is_consistent());

    let rate = stats.success_rate().expect("rate");
    assert!((rate - 2.0 / 3.0).abs() < 1e-9);
}

#[test]
fn statistics_serialize_with_field_names() {
    let mut stats = RunStatistics::default();
    stats.record_detection();
    stats.record_fix(false);

    let json = serde_json::to_value(stats).expect("serialize");
    assert_eq!(json["errors_detected"], 1);
    assert_eq!(json["fixes_attempted"], 1);
    assert_eq!(json["fixes_succeeded"], 0);
    assert_eq!(json["fixes_failed"], 1);
}
