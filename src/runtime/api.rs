//! Observer-facing models built from an engine report.

use serde::{Deserialize, Serialize};

use crate::core::{Engine, EngineReport};

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Engine accepts new work.
    pub ok: bool,
    /// Tasklets waiting on either tier.
    pub queued_tasklets: usize,
    /// Items waiting on every queue, system queue included.
    pub queued_items: usize,
    /// Registry entries still pending by the counter.
    pub pending_entries: i64,
}

/// Queue listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Queue name.
    pub name: String,
    /// Dedicated workers, 0 for shared mode.
    pub worker_count: usize,
    /// Items waiting.
    pub queued: usize,
    /// Handlers running.
    pub active: usize,
}

/// Summarize an engine report.
#[must_use]
pub fn health_from_report(report: &EngineReport) -> Health {
    Health {
        ok: report.live,
        queued_tasklets: report.run_queue.queued_hi + report.run_queue.queued_normal,
        queued_items: report.system_queue.queued
            + report.queues.iter().map(|q| q.queued).sum::<usize>(),
        pending_entries: report.registries.iter().map(|r| r.pending_counter).sum(),
    }
}

/// Return a health payload for `engine`.
#[must_use]
pub fn health(engine: &Engine) -> Health {
    health_from_report(&engine.report())
}

/// List the system queue followed by engine-created queues.
#[must_use]
pub fn list_queues(report: &EngineReport) -> Vec<QueueSnapshot> {
    std::iter::once(&report.system_queue)
        .chain(report.queues.iter())
        .map(|q| QueueSnapshot {
            name: q.name.clone(),
            worker_count: q.worker_count,
            queued: q.queued,
            active: q.active,
        })
        .collect()
}

/// Serialize the engine report as JSON.
pub fn report_json(engine: &Engine) -> Result<String, String> {
    serde_json::to_string(&engine.report()).map_err(|e| format!("serialize error: {e}"))
}
