//! Tests for rule file loading, action parsing and pattern matching.

use std::path::{Path, PathBuf};

use mender::rules::{
    load_rules, try_load_rules, ActionKind, AutoFixConfig, CompiledPattern, ErrorPattern, RuleError,
    RuleSet, Severity,
};

fn sample_rules_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config/error_patterns.json")
}

#[test]
fn sample_rule_file_loads() {
    let rules = try_load_rules(&sample_rules_path()).expect("load sample rules");

    assert_eq!(rules.patterns.len(), 8);
    assert_eq!(rules.auto_fix, AutoFixConfig::default());

    let oom = rules.pattern("out_of_memory").expect("out_of_memory pattern");
    assert_eq!(oom.def.severity, Severity::Critical);
    assert!(oom.def.auto_fix);
    assert_eq!(oom.def.actions.len(), 2);
    assert!(oom.is_match("FATAL ERROR: Reached heap limit, JavaScript heap out of memory"));
}

#[test]
fn missing_file_yields_empty_rule_set_with_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nope.json");

    let err = try_load_rules(&path).expect_err("missing file");
    assert!(matches!(err, RuleError::NotFound(_)));

    let rules = load_rules(&path);
    assert!(rules.patterns.is_empty());
    assert!(rules.health_checks.is_empty());
    assert_eq!(rules.auto_fix.cooldown_period, 300);
    assert_eq!(rules.auto_fix.max_retries, 3);
    assert_eq!(rules.auto_fix.retry_delay, 60);
    assert!(rules.auto_fix.enable_notifications);
    assert!(rules.auto_fix.backup_before_fix);
}

#[test]
fn malformed_file_yields_empty_rule_set() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bad.json");
    std::fs::write(&path, "{ \"error_patterns\": [ {").expect("write");

    let err = try_load_rules(&path).expect_err("malformed file");
    assert!(matches!(err, RuleError::Parse { .. }));

    let rules = load_rules(&path);
    assert!(rules.patterns.is_empty());
    assert_eq!(rules.auto_fix, AutoFixConfig::default());
}

#[test]
fn bad_action_params_only_invalidate_that_action() {
    let json = r#"{
        "error_patterns": [
            {
                "id": "p", "name": "P", "pattern": "x",
                "actions": [
                    { "type": "check_port", "port": "not-a-port" },
                    { "type": "old_file_cleanup", "directories": "/srv", "days": 7 },
                    { "type": "alert", "description": "still here" }
                ]
            },
            { "id": "q", "name": "Q", "pattern": "y" }
        ]
    }"#;
    let rules = RuleSet::from_json(json).expect("parse");
    assert_eq!(rules.patterns.len(), 2);

    let actions = &rules.patterns[0].def.actions;
    assert!(matches!(
        &actions[0].kind,
        ActionKind::Invalid { kind, reason } if kind == "check_port" && reason.contains("not-a-port")
    ));
    assert_eq!(actions[0].kind.tag(), "check_port");
    assert!(matches!(
        &actions[1].kind,
        ActionKind::Invalid { kind, .. } if kind == "old_file_cleanup"
    ));
    assert_eq!(actions[2].kind, ActionKind::Alert);
}

#[test]
fn numeric_strings_are_accepted_for_port_and_days() {
    let json = r#"{
        "error_patterns": [{
            "id": "p", "name": "P", "pattern": "x",
            "actions": [
                { "type": "check_port", "port": "8080" },
                { "type": "kill_process_on_port", "port": " 5100 " },
                { "type": "old_file_cleanup", "directories": ["/srv"], "days": "7" },
                { "type": "check_port", "port": null }
            ]
        }]
    }"#;
    let rules = RuleSet::from_json(json).expect("parse");
    let actions = &rules.patterns[0].def.actions;

    assert_eq!(actions[0].kind, ActionKind::CheckPort { port: Some(8080) });
    assert_eq!(
        actions[1].kind,
        ActionKind::KillProcessOnPort { port: Some(5100) }
    );
    assert_eq!(
        actions[2].kind,
        ActionKind::OldFileCleanup {
            directories: vec![PathBuf::from("/srv")],
            days: 7,
        }
    );
    assert_eq!(actions[3].kind, ActionKind::CheckPort { port: None });
}

#[test]
fn unknown_severity_maps_to_info() {
    let json = r#"{
        "error_patterns": [
            { "id": "a", "name": "A", "pattern": "a", "severity": "catastrophic" },
            { "id": "b", "name": "B", "pattern": "b", "severity": "HIGH" },
            { "id": "c", "name": "C", "pattern": "c" }
        ]
    }"#;
    let rules = RuleSet::from_json(json).expect("parse");

    assert_eq!(rules.patterns[0].def.severity, Severity::Info);
    assert_eq!(rules.patterns[1].def.severity, Severity::High);
    assert_eq!(rules.patterns[2].def.severity, Severity::Info);
}

#[test]
fn action_parameters_and_defaults() {
    let json = r#"{
        "error_patterns": [{
            "id": "p", "name": "P", "pattern": "x", "auto_fix": true,
            "actions": [
                { "type": "service_restart", "description": "restart", "service": "app" },
                { "type": "fix_permissions", "paths": ["/srv/data"] },
                { "type": "old_file_cleanup", "directories": ["/srv/backups"] },
                { "type": "log_rotate", "log_files": ["a.log", "b.log"] },
                { "type": "kill_process_on_port", "port": 8080 },
                { "type": "alert", "description": "heads up" },
                { "type": "reboot_universe", "description": "no such thing" }
            ]
        }]
    }"#;
    let rules = RuleSet::from_json(json).expect("parse");
    let actions = &rules.patterns[0].def.actions;

    assert_eq!(actions[0].description, "restart");
    assert_eq!(
        actions[0].kind,
        ActionKind::ServiceRestart {
            service: Some("app".to_owned())
        }
    );
    assert_eq!(
        actions[1].kind,
        ActionKind::FixPermissions {
            paths: vec![PathBuf::from("/srv/data")],
            owner: "www-data".to_owned(),
            mode: "755".to_owned(),
        }
    );
    assert_eq!(
        actions[2].kind,
        ActionKind::OldFileCleanup {
            directories: vec![PathBuf::from("/srv/backups")],
            days: 30,
        }
    );
    assert_eq!(
        actions[3].kind,
        ActionKind::LogRotate {
            log_files: vec![PathBuf::from("a.log"), PathBuf::from("b.log")]
        }
    );
    assert_eq!(
        actions[4].kind,
        ActionKind::KillProcessOnPort { port: Some(8080) }
    );
    assert_eq!(actions[5].kind, ActionKind::Alert);
    assert_eq!(actions[5].description, "heads up");
    assert_eq!(
        actions[6].kind,
        ActionKind::Unknown {
            kind: "reboot_universe".to_owned()
        }
    );
    assert_eq!(actions[6].kind.tag(), "reboot_universe");
}

#[test]
fn missing_action_params_use_empty_defaults() {
    let json = r#"{
        "error_patterns": [{
            "id": "p", "name": "P", "pattern": "x",
            "actions": [
                { "type": "service_restart" },
                { "type": "cache_clear" },
                { "type": "check_port" }
            ]
        }]
    }"#;
    let rules = RuleSet::from_json(json).expect("parse");
    let actions = &rules.patterns[0].def.actions;

    assert_eq!(actions[0].kind, ActionKind::ServiceRestart { service: None });
    assert_eq!(
        actions[1].kind,
        ActionKind::CacheClear {
            directories: Vec::new()
        }
    );
    assert_eq!(actions[2].kind, ActionKind::CheckPort { port: None });
    assert!(actions[0].description.is_empty());
}

#[test]
fn duplicate_pattern_ids_keep_first_definition() {
    let json = r#"{
        "error_patterns": [
            { "id": "dup", "name": "First", "pattern": "first" },
            { "id": "other", "name": "Other", "pattern": "other" },
            { "id": "dup", "name": "Second", "pattern": "second" }
        ]
    }"#;
    let rules = RuleSet::from_json(json).expect("parse");

    assert_eq!(rules.patterns.len(), 2);
    assert_eq!(rules.pattern("dup").expect("dup").def.name, "First");
}

#[test]
fn cooldown_override_accepts_both_spellings() {
    let json = r#"{
        "error_patterns": [
            { "id": "a", "name": "A", "pattern": "a", "cooldown_secs": 60 },
            { "id": "b", "name": "B", "pattern": "b", "cooldown_seconds": 90 },
            { "id": "c", "name": "C", "pattern": "c" }
        ],
        "auto_fix_config": { "cooldown_period": 120 }
    }"#;
    let rules = RuleSet::from_json(json).expect("parse");

    assert_eq!(rules.patterns[0].def.cooldown_secs, Some(60));
    assert_eq!(rules.patterns[1].def.cooldown_secs, Some(90));
    assert_eq!(rules.patterns[2].def.cooldown_secs, None);
    assert_eq!(rules.auto_fix.cooldown_period, 120);
    assert_eq!(rules.auto_fix.max_retries, 3);
}

fn pattern(text: &str) -> CompiledPattern {
    CompiledPattern::compile(ErrorPattern {
        id: "t".to_owned(),
        name: "T".to_owned(),
        pattern: text.to_owned(),
        severity: Severity::Warning,
        auto_fix: false,
        actions: Vec::new(),
        description: None,
        cooldown_secs: None,
    })
}

#[test]
fn matching_is_case_insensitive() {
    let p = pattern(r"database\s+is\s+locked");
    assert!(p.is_match("ERROR: Database IS Locked (SQLITE_BUSY)"));
    assert!(!p.is_match("database unlocked"));
}

#[test]
fn invalid_regex_falls_back_to_literal_text() {
    let p = pattern("worker [crashed");
    assert!(p.is_match("2024-01-01 WORKER [CRASHED] pid=7"));
    assert!(!p.is_match("worker crashed"));
}
