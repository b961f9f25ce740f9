//! Tests for chain values and status

use prometheus_promise::core::{PromiseStatus, PromiseValue};

#[test]
fn test_status_serializes_snake_case() {
    assert_eq!(serde_json::to_string(&PromiseStatus::Fulfilled).unwrap(), "\"fulfilled\"");
    let parsed: PromiseStatus = serde_json::from_str("\"rejected\"").unwrap();
    assert_eq!(parsed, PromiseStatus::Rejected);
}

#[test]
fn test_settled_value_tags_track() {
    let value = PromiseValue::Settled {
        status: PromiseStatus::Rejected,
        value: Box::new(PromiseValue::<u8>::error(std::fmt::Error)),
    };
    assert_eq!(value.settled_status(), Some(PromiseStatus::Rejected));
    assert!(value.failure().is_some());
    assert!(!value.is_error_like());
    assert!(value.untagged().is_error_like());
}

#[test]
fn test_plain_value_conversion() {
    let value: PromiseValue<&str> = "ok".into();
    assert_eq!(value.as_value(), Some(&"ok"));
    assert!(PromiseValue::<&str>::default().is_empty());
}
