//! Audit sink implementations.
//!
//! Lifecycle events (handler failures, kills, cancellations, teardown) are
//! recorded to an optional sink shared by every component of an engine.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::clock::now_ms;

/// Lifecycle action recorded by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A handler returned an error or panicked.
    Fail,
    /// A tasklet was killed.
    Kill,
    /// A work item, tasklet or delayed work was cancelled while pending.
    Cancel,
    /// A work queue was destroyed.
    Destroy,
    /// A tracked registry entry was created.
    Create,
    /// A tracked registry entry finished executing.
    Execute,
    /// A tracked registry entry was unlinked and its slot freed.
    Retire,
    /// An engine or registry was torn down.
    Teardown,
}

/// Audit event structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Name of the tasklet, item, queue or registry involved.
    pub subject: String,
    /// Action taken.
    pub action: AuditAction,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context (error text, counts).
    pub detail: Option<String>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// Audit sink shared between engine components.
pub type SharedAudit = Arc<Mutex<Box<dyn AuditSink>>>;

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Handle that keeps reading events after the sink is boxed into an engine.
    #[must_use]
    pub fn reader(&self) -> AuditReader {
        AuditReader {
            events: Arc::clone(&self.events),
        }
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Read side of an [`InMemoryAuditSink`].
#[derive(Clone)]
pub struct AuditReader {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
}

impl AuditReader {
    /// Snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Number of stored events with the given action.
    #[must_use]
    pub fn count(&self, action: AuditAction) -> usize {
        self.events.lock().iter().filter(|e| e.action == action).count()
    }
}

/// Helper to build an audit event from context.
pub fn build_audit_event(
    subject: impl Into<String>,
    action: AuditAction,
    detail: Option<String>,
) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        subject: subject.into(),
        action,
        created_at_ms: now_ms(),
        detail,
    }
}

/// Record an event if a sink is attached.
pub(crate) fn record(
    audit: Option<&SharedAudit>,
    subject: &str,
    action: AuditAction,
    detail: Option<String>,
) {
    if let Some(sink) = audit {
        sink.lock().record(build_audit_event(subject, action, detail));
    }
}
