use tw_domain::config::{Config, ConfigSeverity};

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
}

#[test]
fn explicit_zero_host_parses() {
    let toml_str = r#"
[server]
host = "0.0.0.0"
port = 3210
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
}

#[test]
fn buffering_is_enabled_by_default() {
    let config = Config::default();
    assert!(!config.buffering.disabled);
    assert_eq!(config.buffering.max_window_ms, 10_000);
    assert_eq!(config.buffering.typing_extension_ms, 2_000);
    assert_eq!(config.buffering.max_batch_messages, 50);
    assert_eq!(config.buffering.short_burst_chars, 20);
    assert!(config.buffering.collapse_repeats);
}

#[test]
fn zero_batch_cap_is_an_error() {
    let toml_str = r#"
[buffering]
max_batch_messages = 0
short_burst_chars = 0
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.buffering.short_burst_chars, 0);
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|i| i.field == "buffering.max_batch_messages" && i.severity == ConfigSeverity::Error));
}

#[test]
fn lock_and_cache_defaults() {
    let config = Config::default();
    assert_eq!(config.locks.timeout_ms, 15_000);
    assert_eq!(config.echo.max_entries, 500);
    assert_eq!(config.echo.image_ttl_secs, 600);
    assert_eq!(config.echo.message_ttl_secs, 3_600);
    assert_eq!(config.echo.content_ttl_secs, 300);
    assert!(!config.echo.forward_operator_messages);
}

#[test]
fn typing_defaults_match_scoring_policy() {
    let config = Config::default();
    assert_eq!(config.typing.confidence_threshold, 70);
    assert_eq!(config.typing.event_boost, 20);
    assert_eq!(config.typing.silence_penalty, 10);
    assert_eq!(config.typing.max_silent_messages, 5);
}

#[test]
fn default_config_has_only_backend_warning() {
    let issues = Config::default().validate();
    assert!(issues.iter().all(|i| i.severity == ConfigSeverity::Warning));
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].field, "backend.turn_url");
}

#[test]
fn zero_lock_timeout_is_an_error() {
    let toml_str = r#"
[locks]
timeout_ms = 0

[backend]
turn_url = "http://localhost:9000/turn"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let issues = config.validate();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, ConfigSeverity::Error);
    assert_eq!(issues[0].field, "locks.timeout_ms");
}

#[test]
fn negative_governor_ceiling_is_a_warning() {
    let toml_str = r#"
[governor]
max_cost_usd = -1.0

[backend]
turn_url = "http://localhost:9000/turn"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let issues = config.validate();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, ConfigSeverity::Warning);
    assert_eq!(issues[0].field, "governor.max_cost_usd");
    assert!((config.governor.resolved().max_cost_usd - 1.0).abs() < f64::EPSILON);
}

#[test]
fn threads_default_to_json_file() {
    let config = Config::default();
    assert!(config.threads.state_path.is_some());
    assert!(config.threads.identity_links.is_empty());
}
