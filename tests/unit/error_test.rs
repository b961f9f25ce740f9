//! Tests for error types

use anyhow::anyhow;
use prometheus_promise::core::{PromiseError, PromiseFailure};

#[test]
fn test_already_started_error() {
    let err = PromiseError::AlreadyStarted;
    assert_eq!(format!("{}", err), "promise has already started");
}

#[test]
fn test_not_started_error() {
    let err = PromiseError::NotStarted;
    assert_eq!(format!("{}", err), "promise has not started");
}

#[test]
fn test_invalid_config_error() {
    let err = PromiseError::InvalidConfig("wait_timeout_ms must be greater than 0".to_string());
    assert_eq!(
        format!("{}", err),
        "invalid configuration: wait_timeout_ms must be greater than 0"
    );
}

#[test]
fn test_rejected_error_names_index() {
    let err = PromiseError::Rejected { index: 3 };
    assert_eq!(format!("{}", err), "promise #3 in all() was rejected");
}

#[test]
fn test_failure_keeps_message_and_clones_cheaply() {
    let failure = PromiseFailure::new(anyhow!("disk full"));
    let copy = failure.clone();
    assert_eq!(copy.to_string(), "disk full");
    assert!(std::ptr::eq(failure.error(), copy.error()));
}

#[test]
fn test_failure_from_std_error() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing promise.json");
    let failure = PromiseFailure::new(io);
    assert_eq!(
        failure.downcast_ref::<std::io::Error>().map(std::io::Error::kind),
        Some(std::io::ErrorKind::NotFound)
    );
}

#[test]
fn test_failure_from_promise_error() {
    let failure: PromiseFailure = PromiseError::PoolShutdown.into();
    assert_eq!(failure.to_string(), "worker pool has been stopped");
    assert_eq!(failure.downcast_ref::<PromiseError>(), Some(&PromiseError::PoolShutdown));
}
