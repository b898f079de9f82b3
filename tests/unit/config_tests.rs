use deliberd::config::EngineConfig;

#[test]
fn minimal_config_parses_with_defaults() {
    let config = EngineConfig::from_toml_str(r#"db_path = "/tmp/deliberd.db""#).expect("parse");

    assert_eq!(config.round.persona_timeout_seconds, 120);
    assert_eq!(config.round.round_timeout_seconds, 600);
    assert_eq!(config.round.persona_retry_limit, 2);
    assert_eq!(config.round.max_rounds, 4);
    assert_eq!(config.round.quorum_of_three, 2);
    assert_eq!(config.round.quorum_of_five, 3);
    assert_eq!(config.recovery.scan_interval_seconds, 60);
    assert_eq!(config.recovery.max_resume_attempts, 3);
    assert_eq!(config.recovery.retention_days, 30);
    assert!(config.budget.max_session_cost.is_none());
    assert!(config.budget.max_session_duration_seconds.is_none());
}

#[test]
fn full_config_parses() {
    let toml = r#"
db_path = "/var/lib/deliberd/sessions.db"
audit_log_dir = "/var/log/deliberd"

[round]
persona_timeout_seconds = 30
round_timeout_seconds = 120
persona_retry_limit = 1
retry_backoff_ms = 100
max_rounds = 3
quorum_of_three = 3
quorum_of_five = 4

[budget]
max_session_cost = 25.0
max_session_duration_seconds = 7200

[recovery]
scan_interval_seconds = 15
max_resume_attempts = 5
retention_days = 7
"#;
    let config = EngineConfig::from_toml_str(toml).expect("parse");

    assert_eq!(config.round.quorum_of_five, 4);
    assert_eq!(config.budget.max_session_cost, Some(25.0));
    assert_eq!(config.budget.max_session_duration_seconds, Some(7200));
    assert_eq!(config.recovery.retention_days, 7);
}

#[test]
fn missing_db_path_is_rejected() {
    assert!(EngineConfig::from_toml_str("").is_err());
}

#[test]
fn zero_quorum_is_rejected() {
    let toml = r#"
db_path = "/tmp/deliberd.db"

[round]
quorum_of_three = 0
"#;
    assert!(EngineConfig::from_toml_str(toml).is_err());
}

#[test]
fn oversized_quorum_is_rejected() {
    let toml = r#"
db_path = "/tmp/deliberd.db"

[round]
quorum_of_five = 6
"#;
    assert!(EngineConfig::from_toml_str(toml).is_err());
}

#[test]
fn zero_max_rounds_is_rejected() {
    let toml = r#"
db_path = "/tmp/deliberd.db"

[round]
max_rounds = 0
"#;
    assert!(EngineConfig::from_toml_str(toml).is_err());
}

#[test]
fn round_timeout_shorter_than_persona_timeout_is_rejected() {
    let toml = r#"
db_path = "/tmp/deliberd.db"

[round]
persona_timeout_seconds = 120
round_timeout_seconds = 60
"#;
    assert!(EngineConfig::from_toml_str(toml).is_err());
}

#[test]
fn non_positive_cost_budget_is_rejected() {
    let toml = r#"
db_path = "/tmp/deliberd.db"

[budget]
max_session_cost = 0.0
"#;
    assert!(EngineConfig::from_toml_str(toml).is_err());
}

#[test]
fn quorum_for_picks_panel_threshold() {
    let config = EngineConfig::from_toml_str(r#"db_path = "/tmp/deliberd.db""#).expect("parse");
    assert_eq!(config.quorum_for(3), 2);
    assert_eq!(config.quorum_for(5), 3);
}
