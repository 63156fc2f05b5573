//! Tests for audit sink

use prometheus_deferred::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink};

#[test]
fn test_in_memory_audit_sink() {
    let mut sink = InMemoryAuditSink::new(10);

    let event = build_audit_event("io", AuditAction::Destroy, Some("dropped=2".to_string()));
    sink.record(event);
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0].subject, "io");
    assert_eq!(events[0].action, AuditAction::Destroy);
    assert_eq!(events[0].detail.as_deref(), Some("dropped=2"));
}

#[test]
fn test_audit_sink_overflow() {
    let mut sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event("a", AuditAction::Create, None));
    sink.record(build_audit_event("b", AuditAction::Execute, None));
    sink.record(build_audit_event("c", AuditAction::Retire, None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].subject, "b"); // First one popped
    assert_eq!(events[1].subject, "c");
}

#[test]
fn test_reader_sees_events_after_boxing() {
    let sink = InMemoryAuditSink::new(8);
    let reader = sink.reader();
    let mut boxed: Box<dyn AuditSink> = Box::new(sink);
    boxed.record(build_audit_event("t", AuditAction::Kill, None));
    boxed.record(build_audit_event("t", AuditAction::Kill, None));
    assert_eq!(reader.count(AuditAction::Kill), 2);
    assert_eq!(reader.count(AuditAction::Fail), 0);
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event("registry", AuditAction::Teardown, None);

    assert_eq!(event.subject, "registry");
    assert_eq!(event.action, AuditAction::Teardown);
    assert!(event.detail.is_none());
    assert!(event.created_at_ms > 0);
    assert_eq!(event.event_id.len(), 36);
    assert_ne!(
        event.event_id,
        build_audit_event("registry", AuditAction::Teardown, None).event_id
    );
}
