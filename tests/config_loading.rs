use std::io::Write;
use std::time::Duration;

use braid_core::config::AppConfig;
use braid_core::error::BraidError;
use braid_test_utils::write_config;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[run]
max_concurrent_blocks = 4
default_block_timeout_ms = 2000
max_loop_iterations = 10
event_queue_capacity = 64
cancel_grace_ms = 500
delivery_retries = 2

[store]
path = "/tmp/braid-test/braid.db"

[log]
enabled = false
log_dir = "/tmp/braid-test/logs"
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.run.max_concurrent_blocks, 4);
    assert_eq!(config.run.default_block_timeout(), Duration::from_secs(2));
    assert_eq!(config.run.max_loop_iterations, 10);
    assert_eq!(config.run.event_queue_capacity, 64);
    assert_eq!(config.run.cancel_grace(), Duration::from_millis(500));
    assert_eq!(config.run.delivery_retries, 2);

    let store = config.store.expect("store present");
    assert_eq!(
        store.resolved_path().to_str(),
        Some("/tmp/braid-test/braid.db")
    );

    let log = config.log.expect("log present");
    assert!(!log.enabled);
    assert_eq!(log.level, 3);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("BRAID_TEST_LOG_DIR", "/var/tmp/braid-logs");

    let toml_content = r#"
[log]
log_dir = "${BRAID_TEST_LOG_DIR}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    let log = config.log.expect("log present");
    assert_eq!(log.log_dir, "/var/tmp/braid-logs");
    assert!(log.enabled);
    assert_eq!(log.level, 2);

    std::env::remove_var("BRAID_TEST_LOG_DIR");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[run]\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.run.max_concurrent_blocks, 8);
    assert_eq!(config.run.max_loop_iterations, 100);
    assert_eq!(config.run.event_queue_capacity, 256);
    assert_eq!(config.run.delivery_retries, 5);
    assert!(config.store.is_none());
    assert!(config.log.is_none());
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");

    assert!(matches!(
        AppConfig::load(&path),
        Err(BraidError::ConfigNotFound(_))
    ));
    let config = AppConfig::load_or_default(&path).expect("defaults");
    assert_eq!(config.run.max_concurrent_blocks, 8);
}

#[test]
fn test_invalid_values_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[run]\nevent_queue_capacity = 0\n")
        .expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(BraidError::Config(_))
    ));

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[run]\nmax_concurrent_blocks = \"many\"\n")
        .expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(BraidError::Config(_))
    ));
}

#[test]
fn test_home_relative_paths() {
    let (_dir, path) = write_config(
        r#"
[store]
path = "~/braid-data/runs.db"

[log]
log_dir = "relative/logs"
"#,
    );

    let config = AppConfig::load(&path).expect("load config");
    let db = config.store.expect("store present").resolved_path();
    assert!(db.ends_with("braid-data/runs.db"));
    if let Ok(home) = std::env::var("HOME") {
        assert!(db.starts_with(home));
    }
    let logs = config.log.expect("log present").resolved_dir();
    assert_eq!(logs.to_str(), Some("relative/logs"));
}
