//! Error types for engine operations.

use thiserror::Error;

/// Errors produced by engine components.
///
/// Idempotent no-ops (scheduling an already pending tasklet, submitting an
/// already queued item) are reported through outcome enums, not errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A fixed-capacity pool is exhausted or a thread could not be spawned.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),
    /// Operation on a killed tasklet, a destroyed queue, or a torn-down engine.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A bounded work queue is at capacity.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// A delayed work item re-armed itself more times than allowed.
    #[error("reschedule depth limit {0} reached")]
    RescheduleLimit(u32),
}

impl EngineError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Result type returned by task handlers. Handler errors are caught at the
/// execution boundary and recorded per task.
pub type AppResult<T> = Result<T, anyhow::Error>;

/// Outcome of a synchronous cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The target was queued, armed, or running; it is now idle.
    WasPending,
    /// The target had already completed or was never submitted.
    NotPending,
}

impl CancelOutcome {
    /// Whether the target was pending when the cancel started.
    #[must_use]
    pub const fn was_pending(self) -> bool {
        matches!(self, Self::WasPending)
    }
}
