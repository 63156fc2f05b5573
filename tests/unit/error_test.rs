//! Tests for error types

use prometheus_deferred::core::{CancelOutcome, EngineError};

#[test]
fn test_queue_full_error() {
    let err = EngineError::QueueFull("io".to_string());
    assert_eq!(format!("{err}"), "queue full: io");
}

#[test]
fn test_invalid_state_error() {
    let err = EngineError::InvalidState("tasklet is killed".to_string());
    assert_eq!(format!("{err}"), "invalid state: tasklet is killed");
}

#[test]
fn test_invalid_config_error() {
    let err = EngineError::InvalidConfig("fast_threads must be greater than 0".to_string());
    assert_eq!(
        format!("{err}"),
        "invalid configuration: fast_threads must be greater than 0"
    );
}

#[test]
fn test_cancel_outcome_serializes_snake_case() {
    let json = serde_json::to_string(&CancelOutcome::WasPending).unwrap();
    assert_eq!(json, "\"was_pending\"");
}
