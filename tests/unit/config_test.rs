//! Tests for configuration validation

use std::collections::HashMap;

use prometheus_deferred::config::engine::{
    ENV_FAST_THREADS, ENV_MAX_RESCHEDULE_DEPTH, ENV_PRIORITY_ENABLED, ENV_QUEUE_MODE,
};
use prometheus_deferred::config::{EngineConfig, QueueMode, WorkQueueConfig};

#[test]
fn test_engine_config_validation() {
    let valid = EngineConfig::default().with_fast_threads(2);
    assert!(valid.validate().is_ok());
}

#[test]
fn test_engine_config_invalid_fast_threads() {
    assert!(EngineConfig::default().with_fast_threads(0).validate().is_err());
}

#[test]
fn test_engine_config_invalid_pool_capacity() {
    assert!(EngineConfig::default().with_pool_capacity(0).validate().is_err());
}

#[test]
fn test_worker_count_only_checked_in_dedicated_mode() {
    let cfg = EngineConfig::default().with_worker_count(0);
    assert!(cfg.validate().is_err());
    assert!(cfg.with_queue_mode(QueueMode::Shared).validate().is_ok());
}

#[test]
fn test_engine_config_from_json() {
    let json = r#"{
        "fast_threads": 4,
        "pool_capacity": 128,
        "queue_mode": "shared",
        "max_reschedule_depth": 10
    }"#;

    let config = EngineConfig::from_json_str(json).unwrap();
    assert_eq!(config.fast_threads, 4);
    assert_eq!(config.pool_capacity, 128);
    assert_eq!(config.queue_mode, QueueMode::Shared);
    assert_eq!(config.max_reschedule_depth, Some(10));
    assert!(config.priority_enabled);
}

#[test]
fn test_engine_config_from_json_rejects_invalid() {
    assert!(EngineConfig::from_json_str(r#"{"shared_workers": 0}"#).is_err());
    assert!(EngineConfig::from_json_str("not json").is_err());
}

#[test]
fn test_engine_config_from_lookup() {
    let vars: HashMap<&str, &str> = [
        (ENV_FAST_THREADS, "3"),
        (ENV_QUEUE_MODE, " Shared "),
        (ENV_PRIORITY_ENABLED, "off"),
        (ENV_MAX_RESCHEDULE_DEPTH, "5"),
    ]
    .into_iter()
    .collect();

    let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
    assert_eq!(config.fast_threads, 3);
    assert_eq!(config.queue_mode, QueueMode::Shared);
    assert!(!config.priority_enabled);
    assert_eq!(config.max_reschedule_depth, Some(5));
}

#[test]
fn test_engine_config_from_lookup_bad_value() {
    let err = EngineConfig::from_lookup(|k| (k == ENV_FAST_THREADS).then(|| "many".to_string()))
        .unwrap_err();
    assert!(err.contains(ENV_FAST_THREADS));
}

#[test]
fn test_queue_config_follows_engine_mode() {
    let dedicated = EngineConfig::default()
        .with_worker_count(3)
        .with_queue_capacity(16)
        .queue_config("io");
    assert_eq!(dedicated.worker_count, 3);
    assert_eq!(dedicated.capacity, Some(16));
    assert!(!dedicated.is_shared());

    let shared = EngineConfig::default()
        .with_queue_mode(QueueMode::Shared)
        .queue_config("io");
    assert!(shared.is_shared());
    assert_eq!(shared.capacity, None);
}

#[test]
fn test_work_queue_config_validation() {
    assert!(WorkQueueConfig::dedicated("io", 2).validate().is_ok());
    assert!(WorkQueueConfig::dedicated("", 2).validate().is_err());
    assert!(WorkQueueConfig::shared("io").with_capacity(0).validate().is_err());
}
