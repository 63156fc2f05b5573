//! Tokio bridge: runs the engine's blocking waits on Tokio's blocking pool.
//!
//! `cancel_sync`, `kill`, `disable_sync`, `flush` and `teardown` park the
//! calling thread. Async callers go through [`TokioBridge`] so those waits
//! never stall a runtime worker.

use std::sync::Arc;

use crate::core::{
    CancelOutcome, DelayedWork, Engine, EngineError, Tasklet, WorkItem, WorkQueue,
};

/// Handle-bound bridge from async code to the engine's blocking operations.
#[derive(Clone)]
pub struct TokioBridge {
    handle: Arc<tokio::runtime::Handle>,
}

impl TokioBridge {
    /// Bridge onto the given runtime.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Bridge onto the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    async fn blocking<T, F>(&self, op: &'static str, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.handle
            .spawn_blocking(f)
            .await
            .map_err(|e| EngineError::invalid_state(format!("{op} did not complete: {e}")))
    }

    /// [`WorkItem::cancel_sync`] off the async worker.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the blocking task was aborted.
    pub async fn cancel_work(&self, item: WorkItem) -> Result<CancelOutcome, EngineError> {
        self.blocking("cancel_work", move || item.cancel_sync()).await
    }

    /// [`DelayedWork::cancel_sync`] off the async worker.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the blocking task was aborted.
    pub async fn cancel_delayed(&self, work: DelayedWork) -> Result<CancelOutcome, EngineError> {
        self.blocking("cancel_delayed", move || work.cancel_sync()).await
    }

    /// [`Tasklet::kill`] off the async worker.
    ///
    /// # Errors
    ///
    /// As [`Tasklet::kill`].
    pub async fn kill(&self, tasklet: Tasklet) -> Result<(), EngineError> {
        self.blocking("kill", move || tasklet.kill()).await?
    }

    /// [`Tasklet::disable_sync`] off the async worker.
    ///
    /// # Errors
    ///
    /// As [`Tasklet::disable_sync`].
    pub async fn disable_sync(&self, tasklet: Tasklet) -> Result<(), EngineError> {
        self.blocking("disable_sync", move || tasklet.disable_sync()).await?
    }

    /// [`WorkQueue::flush`] off the async worker.
    ///
    /// # Errors
    ///
    /// As [`WorkQueue::flush`].
    pub async fn flush(&self, queue: WorkQueue) -> Result<(), EngineError> {
        self.blocking("flush", move || queue.flush()).await?
    }

    /// [`Engine::teardown`] off the async worker.
    ///
    /// # Errors
    ///
    /// As [`Engine::teardown`].
    pub async fn teardown(&self, engine: Arc<Engine>) -> Result<(), EngineError> {
        self.blocking("teardown", move || engine.teardown()).await?
    }
}
