//! Engine: owns the run queue, shared pool, system queue and timer service,
//! and hands out tasklets, queues, delayed work and registries bound to them.
//!
//! # Teardown order
//!
//! `timers → registries → engine-created queues → system queue → shared
//! pool → run queue`. Timers go first so nothing is scheduled into a
//! component that is already stopping; the run queue goes last because
//! registry teardown kills tasklets on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::audit::{self, AuditAction, AuditSink, SharedAudit};
use super::delayed::DelayedWork;
use super::registry::{EntryId, ManagedRegistry, RegistryStats, TaskRegistry};
use super::tasklet::{RunQueue, RunQueueStats, Tasklet};
use super::timer::{TimerService, TimerStats};
use super::work_queue::{QueueStats, WorkQueue};
use super::worker_pool::{PoolStats, SharedWorkerPool};
use super::{AppResult, EngineError};
use crate::config::{EngineConfig, WorkQueueConfig};

/// Name of the engine's shared-mode system queue.
pub const SYSTEM_QUEUE_NAME: &str = "events";

/// Read-only view of every component, for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReport {
    /// False once teardown has started.
    pub live: bool,
    /// Tasklet run queue counters.
    pub run_queue: RunQueueStats,
    /// Shared worker pool counters.
    pub shared_pool: PoolStats,
    /// Timer service counters.
    pub timers: TimerStats,
    /// System queue counters.
    pub system_queue: QueueStats,
    /// Counters of queues created through the engine.
    pub queues: Vec<QueueStats>,
    /// Snapshots of registries created through the engine.
    pub registries: Vec<RegistryStats>,
}

/// Deferred-task engine.
pub struct Engine {
    config: EngineConfig,
    run_queue: RunQueue,
    shared_pool: Arc<SharedWorkerPool>,
    system_queue: WorkQueue,
    timers: TimerService,
    audit: Option<SharedAudit>,
    queues: Mutex<Vec<WorkQueue>>,
    registries: Mutex<Vec<Arc<dyn ManagedRegistry>>>,
    torn_down: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("torn_down", &self.torn_down.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start an engine without an audit sink.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if validation fails; `AllocationFailure` if a thread
    /// cannot be spawned.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::start(config, None)
    }

    /// Start an engine recording lifecycle events to `sink`.
    ///
    /// # Errors
    ///
    /// As [`Engine::new`].
    pub fn with_audit(config: EngineConfig, sink: impl AuditSink + 'static) -> Result<Self, EngineError> {
        let audit: SharedAudit = Arc::new(Mutex::new(Box::new(sink)));
        Self::start(config, Some(audit))
    }

    fn start(config: EngineConfig, audit: Option<SharedAudit>) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;

        let run_queue = RunQueue::start(config.fast_threads, audit.clone())?;
        let shared_pool = match SharedWorkerPool::start(config.shared_workers) {
            Ok(pool) => pool,
            Err(e) => {
                run_queue.shutdown();
                return Err(e);
            }
        };
        let system_queue = match WorkQueue::create(
            WorkQueueConfig::shared(SYSTEM_QUEUE_NAME),
            Some(&shared_pool),
            audit.clone(),
        ) {
            Ok(queue) => queue,
            Err(e) => {
                shared_pool.shutdown();
                run_queue.shutdown();
                return Err(e);
            }
        };
        let timers = match TimerService::start() {
            Ok(timers) => timers,
            Err(e) => {
                let _ = system_queue.destroy();
                shared_pool.shutdown();
                run_queue.shutdown();
                return Err(e);
            }
        };

        info!(
            fast_threads = config.fast_threads,
            shared_workers = config.shared_workers,
            queue_mode = ?config.queue_mode,
            "deferred engine started"
        );
        Ok(Self {
            config,
            run_queue,
            shared_pool,
            system_queue,
            timers,
            audit,
            queues: Mutex::new(Vec::new()),
            registries: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.torn_down.load(Ordering::Acquire) {
            Err(EngineError::invalid_state("engine is torn down"))
        } else {
            Ok(())
        }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The tasklet run queue.
    #[must_use]
    pub const fn run_queue(&self) -> &RunQueue {
        &self.run_queue
    }

    /// The timer service.
    #[must_use]
    pub const fn timers(&self) -> &TimerService {
        &self.timers
    }

    /// The shared worker pool.
    #[must_use]
    pub fn shared_pool(&self) -> &SharedWorkerPool {
        &self.shared_pool
    }

    /// The shared-mode system queue.
    #[must_use]
    pub const fn system_queue(&self) -> &WorkQueue {
        &self.system_queue
    }

    /// Create an enabled tasklet on the engine's run queue.
    ///
    /// # Errors
    ///
    /// `InvalidState` after teardown.
    pub fn tasklet<F>(&self, name: impl Into<String>, handler: F) -> Result<Tasklet, EngineError>
    where
        F: Fn(&Tasklet) -> AppResult<()> + Send + Sync + 'static,
    {
        self.ensure_live()?;
        Ok(Tasklet::new(&self.run_queue, name, handler))
    }

    /// Create a tasklet with a disable count of one.
    ///
    /// # Errors
    ///
    /// `InvalidState` after teardown.
    pub fn tasklet_disabled<F>(
        &self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<Tasklet, EngineError>
    where
        F: Fn(&Tasklet) -> AppResult<()> + Send + Sync + 'static,
    {
        self.ensure_live()?;
        Ok(Tasklet::new_disabled(&self.run_queue, name, handler))
    }

    /// Create a queue using the configured mode, worker count and capacity.
    ///
    /// # Errors
    ///
    /// As [`Engine::create_queue_with`].
    pub fn create_queue(&self, name: impl Into<String>) -> Result<WorkQueue, EngineError> {
        self.create_queue_with(self.config.queue_config(name))
    }

    /// Create a queue from an explicit configuration. The engine destroys it
    /// at teardown unless it was destroyed earlier.
    ///
    /// # Errors
    ///
    /// `InvalidState` after teardown; otherwise as [`WorkQueue::create`].
    pub fn create_queue_with(&self, config: WorkQueueConfig) -> Result<WorkQueue, EngineError> {
        self.ensure_live()?;
        let queue = WorkQueue::create(config, Some(&self.shared_pool), self.audit.clone())?;
        self.queues.lock().push(queue.clone());
        Ok(queue)
    }

    /// Delayed work submitted to `queue` on expiry.
    ///
    /// # Errors
    ///
    /// `InvalidState` after teardown.
    pub fn delayed_work<F>(
        &self,
        name: impl Into<String>,
        queue: &WorkQueue,
        handler: F,
    ) -> Result<DelayedWork, EngineError>
    where
        F: Fn(&DelayedWork) -> AppResult<()> + Send + Sync + 'static,
    {
        self.ensure_live()?;
        Ok(DelayedWork::for_queue(
            &self.timers,
            queue,
            name,
            self.config.max_reschedule_depth,
            handler,
        ))
    }

    /// Delayed tasklet scheduled on the engine's run queue on expiry.
    ///
    /// # Errors
    ///
    /// `InvalidState` after teardown.
    pub fn delayed_tasklet<F>(
        &self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<DelayedWork, EngineError>
    where
        F: Fn(&DelayedWork) -> AppResult<()> + Send + Sync + 'static,
    {
        self.ensure_live()?;
        Ok(DelayedWork::for_tasklet(
            &self.timers,
            &self.run_queue,
            name,
            self.config.max_reschedule_depth,
            handler,
        ))
    }

    /// Create a registry with the configured capacity and priority routing.
    ///
    /// # Errors
    ///
    /// `InvalidState` after teardown.
    pub fn create_registry<P, F>(
        &self,
        name: impl Into<String>,
        handler: F,
    ) -> Result<TaskRegistry<P>, EngineError>
    where
        P: Send + Sync + 'static,
        F: Fn(EntryId, &P) -> AppResult<()> + Send + Sync + 'static,
    {
        self.ensure_live()?;
        let registry = TaskRegistry::new(
            name,
            &self.run_queue,
            self.config.pool_capacity,
            self.config.priority_enabled,
            handler,
        );
        self.registries.lock().push(Arc::new(registry.clone()));
        Ok(registry)
    }

    /// Whether [`teardown`](Self::teardown) has been called.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Snapshot of every component.
    #[must_use]
    pub fn report(&self) -> EngineReport {
        let queues = self.queues.lock().iter().map(WorkQueue::stats).collect();
        let registries = self.registries.lock().iter().map(|r| r.snapshot()).collect();
        EngineReport {
            live: !self.is_torn_down(),
            run_queue: self.run_queue.stats(),
            shared_pool: self.shared_pool.stats(),
            timers: self.timers.stats(),
            system_queue: self.system_queue.stats(),
            queues,
            registries,
        }
    }

    /// Stop every component in dependency order. Must not be called from a
    /// handler running on the engine.
    ///
    /// # Errors
    ///
    /// `InvalidState` on a second teardown.
    pub fn teardown(&self) -> Result<(), EngineError> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Err(EngineError::invalid_state("engine already torn down"));
        }
        info!("tearing down deferred engine");

        self.timers.shutdown();

        let registries: Vec<_> = self.registries.lock().drain(..).collect();
        for registry in registries.iter().filter(|r| !r.is_torn_down()) {
            if let Err(e) = registry.teardown() {
                warn!(error = %e, "registry teardown failed");
            }
        }

        let queues: Vec<_> = self.queues.lock().drain(..).collect();
        for queue in queues.iter().filter(|q| !q.is_destroyed()) {
            if let Err(e) = queue.destroy() {
                warn!(queue = %queue.name(), error = %e, "queue destroy failed");
            }
        }
        if let Err(e) = self.system_queue.destroy() {
            warn!(error = %e, "system queue destroy failed");
        }

        self.shared_pool.shutdown();
        self.run_queue.shutdown();

        audit::record(
            self.audit.as_ref(),
            "engine",
            AuditAction::Teardown,
            Some(format!("registries={} queues={}", registries.len(), queues.len())),
        );
        info!("deferred engine torn down");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.is_torn_down() {
            warn!("engine dropped without teardown; tearing down now");
            let _ = self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::InMemoryAuditSink;

    fn small_config() -> EngineConfig {
        EngineConfig::default()
            .with_fast_threads(1)
            .with_shared_workers(1)
            .with_pool_capacity(4)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let res = Engine::new(small_config().with_fast_threads(0));
        assert!(matches!(res, Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_double_teardown_rejected() {
        let engine = Engine::new(small_config()).unwrap();
        engine.teardown().unwrap();
        assert!(matches!(engine.teardown(), Err(EngineError::InvalidState(_))));
        assert!(matches!(
            engine.tasklet("late", |_| Ok(())),
            Err(EngineError::InvalidState(_))
        ));
        assert!(!engine.report().live);
    }

    #[test]
    fn test_teardown_is_audited() {
        let sink = InMemoryAuditSink::new(32);
        let reader = sink.reader();
        let engine = Engine::with_audit(small_config(), sink).unwrap();
        let _queue = engine.create_queue("io").unwrap();
        engine.teardown().unwrap();
        assert_eq!(reader.count(AuditAction::Teardown), 1);
        assert_eq!(reader.count(AuditAction::Destroy), 2);
    }
}
