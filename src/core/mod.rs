//! Deferred execution primitives and the engine that owns them.

pub mod audit;
pub mod delayed;
pub mod engine;
pub mod error;
mod executor;
pub mod registry;
pub mod tasklet;
pub mod timer;
pub mod work_queue;
pub mod worker_pool;

pub use audit::{
    build_audit_event, AuditAction, AuditEvent, AuditReader, AuditSink, InMemoryAuditSink,
    SharedAudit,
};
pub use delayed::{DelayOutcome, DelayTarget, DelayedWork};
pub use engine::{Engine, EngineReport, SYSTEM_QUEUE_NAME};
pub use error::{AppResult, CancelOutcome, EngineError};
pub use registry::{EntryId, RegistryStats, TaskRegistry};
pub use tasklet::{
    RunQueue, RunQueueStats, ScheduleOutcome, Tasklet, TaskletId, TaskletPhase, TaskletStats, Tier,
};
pub use timer::{TimerId, TimerService, TimerStats};
pub use work_queue::{QueueStats, SubmitOutcome, WorkItem, WorkItemId, WorkItemStats, WorkQueue};
pub use worker_pool::{PoolStats, SharedWorkerPool};
