//! Tests for builder modules

use prometheus_deferred::builders::{build_engine, build_engine_from_json, build_queues};
use prometheus_deferred::config::{EngineConfig, WorkQueueConfig};
use prometheus_deferred::core::{AuditAction, EngineError, InMemoryAuditSink};

fn small() -> EngineConfig {
    EngineConfig::default()
        .with_fast_threads(1)
        .with_shared_workers(1)
}

#[test]
fn test_build_engine_rejects_invalid_config() {
    let res = build_engine(small().with_pool_capacity(0), None);
    assert!(matches!(res, Err(EngineError::InvalidConfig(_))));
}

#[test]
fn test_build_engine_with_boxed_sink() {
    let sink = InMemoryAuditSink::new(16);
    let reader = sink.reader();
    let engine = build_engine(small(), Some(Box::new(sink))).unwrap();
    engine.teardown().unwrap();
    assert_eq!(reader.count(AuditAction::Teardown), 1);
}

#[test]
fn test_build_engine_from_json_parse_error() {
    let res = build_engine_from_json("{");
    assert!(matches!(res, Err(EngineError::InvalidConfig(_))));
}

#[test]
fn test_build_queues_keyed_by_name() {
    let engine = build_engine(small(), None).unwrap();
    let queues = build_queues(
        &engine,
        &[
            WorkQueueConfig::dedicated("disk", 1),
            WorkQueueConfig::shared("net").with_capacity(8),
        ],
    )
    .unwrap();
    assert_eq!(queues.len(), 2);
    assert_eq!(queues["disk"].name(), "disk");
    assert_eq!(engine.report().queues.len(), 2);
    engine.teardown().unwrap();
}

#[test]
fn test_build_queues_rejects_duplicates() {
    let engine = build_engine(small(), None).unwrap();
    let res = build_queues(
        &engine,
        &[
            WorkQueueConfig::dedicated("disk", 1),
            WorkQueueConfig::shared("disk"),
        ],
    );
    assert!(matches!(res, Err(EngineError::InvalidConfig(_))));
    engine.teardown().unwrap();
}
