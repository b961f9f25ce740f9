//! Tests for configuration validation and loading

use prometheus_promise::config::{
    PromiseWorkerConfig, CONFIG_FILE_NAME, DEFAULT_WAIT_TIMEOUT_MS, MAX_WORKER_LENGTH, MIN_WORKER_LENGTH,
};
use prometheus_promise::core::PromiseError;
use std::path::PathBuf;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("prometheus-promise-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_default_config_is_valid() {
    let cfg = PromiseWorkerConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.worker_length, None);
    assert_eq!(cfg.wait_timeout_ms, DEFAULT_WAIT_TIMEOUT_MS);
}

#[test]
fn test_invalid_wait_timeout() {
    let cfg = PromiseWorkerConfig::new().with_wait_timeout_ms(0);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_invalid_thread_name_prefix() {
    let cfg = PromiseWorkerConfig::new().with_thread_name_prefix("  ");
    assert!(cfg.validate().is_err());
}

#[test]
fn test_invalid_stack_size() {
    let cfg = PromiseWorkerConfig::new().with_thread_stack_size(1024);
    assert!(cfg.validate().is_err());
}

#[test]
fn test_json_accepts_camel_case_worker_length() {
    let cfg = PromiseWorkerConfig::from_json_str(r#"{ "workerLength": 64 }"#).unwrap();
    assert_eq!(cfg.worker_length, Some(64));
    assert_eq!(cfg.resolve_worker_length(), 64);
}

#[test]
fn test_json_rejects_invalid_values() {
    let err = PromiseWorkerConfig::from_json_str(r#"{ "wait_timeout_ms": 0 }"#).unwrap_err();
    assert!(matches!(err, PromiseError::InvalidConfig(_)));
    let err = PromiseWorkerConfig::from_json_str("not json").unwrap_err();
    assert!(matches!(err, PromiseError::InvalidConfig(_)));
}

#[test]
fn test_worker_length_clamped() {
    assert_eq!(
        PromiseWorkerConfig::new().with_worker_length(1).resolve_worker_length(),
        MIN_WORKER_LENGTH
    );
    assert_eq!(
        PromiseWorkerConfig::new().with_worker_length(usize::MAX).resolve_worker_length(),
        MAX_WORKER_LENGTH
    );
}

#[test]
fn test_load_missing_file() {
    let dir = scratch_dir("missing");
    assert_eq!(PromiseWorkerConfig::load(&dir).unwrap(), None);
}

#[test]
fn test_load_invalid_file_is_an_error() {
    let dir = scratch_dir("invalid");
    std::fs::write(dir.join(CONFIG_FILE_NAME), r#"{ "wait_timeout_ms": 0 }"#).unwrap();
    assert!(matches!(PromiseWorkerConfig::load(&dir), Err(PromiseError::InvalidConfig(_))));

    std::fs::write(dir.join(CONFIG_FILE_NAME), "not json").unwrap();
    assert!(matches!(PromiseWorkerConfig::load(&dir), Err(PromiseError::InvalidConfig(_))));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_discover_prefers_file() {
    let dir = scratch_dir("discover");
    std::fs::write(dir.join(CONFIG_FILE_NAME), r#"{ "worker_length": 12, "wait_timeout_ms": 250 }"#).unwrap();

    let cfg = PromiseWorkerConfig::discover(Some(dir.as_path()));
    assert_eq!(cfg.worker_length, Some(12));
    assert_eq!(cfg.wait_timeout_ms, 250);

    std::fs::remove_dir_all(&dir).unwrap();
}
