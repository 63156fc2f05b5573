//! Work queues: FIFO queues of work items drained by blocking-capable workers.
//!
//! A [`WorkQueue`] either owns dedicated worker threads or borrows the
//! engine's [`SharedWorkerPool`]. Items are [`WorkItem`] handles; the handle
//! identity is what makes submission idempotent.
//!
//! # Caller protocol
//!
//! [`WorkQueue::destroy`] waits for running handlers and joins workers but
//! does not drain the queue. Cancel or flush outstanding items first; items
//! still queued at destroy time are dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! let wq = WorkQueue::create(WorkQueueConfig::dedicated("io", 1), None, None)?;
//! let item = WorkItem::new("sync-disk", |_item| Ok(()));
//! wq.submit(&item)?;
//! item.cancel_sync();
//! wq.destroy()?;
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::audit::{self, AuditAction, SharedAudit};
use super::executor::execute_guarded;
use super::worker_pool::{PoolMessage, SharedWorkerPool};
use super::{AppResult, CancelOutcome, EngineError};
use crate::config::WorkQueueConfig;

/// Unique work item identifier.
pub type WorkItemId = u64;

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// Result of [`WorkQueue::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Appended to the tail of the queue (or re-queued once its current run
    /// returns).
    Submitted,
    /// The item is already pending on a queue; nothing changed.
    AlreadyQueued,
    /// A `cancel_sync` on the item is in progress; the submission was refused.
    Cancelling,
}

/// Per-item execution counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemStats {
    /// Completed handler invocations, successful or not.
    pub runs: u64,
    /// Invocations that returned an error or panicked.
    pub failures: u64,
    /// Cancellations that found the item pending.
    pub cancellations: u64,
    /// Description of the most recent failure.
    pub last_error: Option<String>,
}

type WorkHandler = Box<dyn Fn(&WorkItem) -> AppResult<()> + Send + Sync>;

struct ItemState {
    queued_on: Option<Arc<QueueShared>>,
    /// Submitted while running; pushed onto `queued_on` when the run returns.
    deferred: bool,
    running_on: Option<ThreadId>,
    cancelling: u32,
    stats: WorkItemStats,
}

struct WorkItemInner {
    id: WorkItemId,
    name: String,
    handler: WorkHandler,
    state: Mutex<ItemState>,
    /// Signalled whenever a run finishes.
    done: Condvar,
}

/// Handle to a unit of blocking-capable work.
#[derive(Clone)]
pub struct WorkItem {
    inner: Arc<WorkItemInner>,
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl WorkItem {
    /// Create a work item. The payload is whatever the handler captures.
    pub fn new<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Self) -> AppResult<()> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(WorkItemInner {
                id: NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                handler: Box::new(handler),
                state: Mutex::new(ItemState {
                    queued_on: None,
                    deferred: false,
                    running_on: None,
                    cancelling: 0,
                    stats: WorkItemStats::default(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Item identifier.
    #[must_use]
    pub fn id(&self) -> WorkItemId {
        self.inner.id
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the item is queued on some work queue.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().queued_on.is_some()
    }

    /// Whether a handler invocation is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running_on.is_some()
    }

    /// Execution counters.
    #[must_use]
    pub fn stats(&self) -> WorkItemStats {
        self.inner.state.lock().stats.clone()
    }

    /// Whether two handles refer to the same item.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn is_current_runner(&self) -> bool {
        self.inner.state.lock().running_on == Some(thread::current().id())
    }

    /// Remove the item from its queue, or wait for its in-flight run.
    ///
    /// Returns [`CancelOutcome::WasPending`] if the item was queued (it will
    /// not run) or running (the run has finished by the time this returns).
    /// Re-submissions attempted while the cancel is in progress are refused.
    /// Called from the item's own handler it does not wait.
    pub fn cancel_sync(&self) -> CancelOutcome {
        let current = thread::current().id();
        self.inner.state.lock().cancelling += 1;

        let mut was_pending = false;
        let mut removed_from: Option<Arc<QueueShared>> = None;
        loop {
            let target = self.inner.state.lock().queued_on.clone();
            let Some(queue) = target else { break };

            let mut qs = queue.state.lock();
            let mut st = self.inner.state.lock();
            let still_there = st
                .queued_on
                .as_ref()
                .is_some_and(|q| Arc::ptr_eq(q, &queue));
            if !still_there {
                continue;
            }
            qs.items.retain(|i| !i.ptr_eq(self));
            st.queued_on = None;
            st.deferred = false;
            was_pending = true;
            drop(st);
            drop(qs);
            queue.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            queue.idle.notify_all();
            removed_from = Some(queue);
            break;
        }

        let mut st = self.inner.state.lock();
        if st.running_on.is_some() {
            was_pending = true;
            if st.running_on != Some(current) {
                while st.running_on.is_some() {
                    self.inner.done.wait(&mut st);
                }
            }
        }
        st.cancelling -= 1;
        if was_pending {
            st.stats.cancellations += 1;
        }
        drop(st);

        if was_pending {
            debug!(item = %self.inner.name, "work item cancelled");
            let audit = removed_from.as_ref().and_then(|q| q.audit.as_ref());
            audit::record(audit, &self.inner.name, AuditAction::Cancel, None);
            CancelOutcome::WasPending
        } else {
            CancelOutcome::NotPending
        }
    }
}

/// Statistics about one work queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Queue name.
    pub name: String,
    /// Dedicated worker threads (0 in shared mode).
    pub worker_count: usize,
    /// Items waiting in the queue.
    pub queued: usize,
    /// Handlers currently executing.
    pub active: usize,
    /// Accepted submissions.
    pub submitted: u64,
    /// Handler invocations completed.
    pub completed: u64,
    /// Handler invocations that failed.
    pub failed: u64,
    /// Items removed by `cancel_sync` before running.
    pub cancelled: u64,
    /// Items dropped because the queue was destroyed.
    pub dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    dropped: AtomicU64,
}

pub(crate) struct QueueState {
    items: VecDeque<WorkItem>,
    active: usize,
    /// Threads currently running one of this queue's handlers.
    runners: Vec<ThreadId>,
    shutdown: bool,
}

/// State shared between a queue handle and whatever drains it.
pub(crate) struct QueueShared {
    name: String,
    capacity: Option<usize>,
    state: Mutex<QueueState>,
    /// Signalled on submission (dedicated workers wait here).
    not_empty: Condvar,
    /// Signalled when a handler finishes or items are removed.
    idle: Condvar,
    /// Wake-token sender in shared mode.
    waker: Option<Sender<PoolMessage>>,
    counters: QueueCounters,
    audit: Option<SharedAudit>,
}

impl QueueShared {
    fn wake(self: &Arc<Self>) {
        match &self.waker {
            Some(tx) => {
                if tx.send(PoolMessage::Run(Arc::clone(self))).is_err() {
                    warn!(queue = %self.name, "shared pool gone; item will not run");
                }
            }
            None => {
                self.not_empty.notify_one();
            }
        }
    }

    /// Pop the head item and mark it running on the calling thread.
    fn begin_next(&self, qs: &mut QueueState) -> Option<WorkItem> {
        let item = qs.items.pop_front()?;
        let current = thread::current().id();
        {
            let mut st = item.inner.state.lock();
            st.queued_on = None;
            st.running_on = Some(current);
        }
        qs.active += 1;
        qs.runners.push(current);
        Some(item)
    }

    /// Shared-pool entry point. Returns false if there was nothing to run.
    pub(crate) fn run_one(self: &Arc<Self>) -> bool {
        let item = {
            let mut qs = self.state.lock();
            if qs.shutdown {
                return false;
            }
            match self.begin_next(&mut qs) {
                Some(item) => item,
                None => return false,
            }
        };
        self.execute(&item);
        true
    }

    fn execute(self: &Arc<Self>, item: &WorkItem) {
        debug!(queue = %self.name, item = %item.inner.name, "work item running");
        let outcome = execute_guarded(|| (item.inner.handler)(item));
        let current = thread::current().id();

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        if let Err(ref msg) = outcome {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(queue = %self.name, item = %item.inner.name, error = %msg, "work handler failed");
            audit::record(
                self.audit.as_ref(),
                &item.inner.name,
                AuditAction::Fail,
                Some(msg.clone()),
            );
        }

        let requeue_on = {
            let mut st = item.inner.state.lock();
            st.running_on = None;
            st.stats.runs += 1;
            if let Err(msg) = outcome {
                st.stats.failures += 1;
                st.stats.last_error = Some(msg);
            }
            item.inner.done.notify_all();
            if st.deferred {
                st.queued_on.clone()
            } else {
                None
            }
        };

        // Resubmitted to this queue: push while its lock is held so flush()
        // never observes an empty queue with the item still owed a run.
        let requeued_here = {
            let mut qs = self.state.lock();
            qs.active -= 1;
            if let Some(pos) = qs.runners.iter().position(|t| *t == current) {
                qs.runners.swap_remove(pos);
            }
            match &requeue_on {
                Some(target) if Arc::ptr_eq(target, self) => self.push_deferred(&mut qs, item),
                _ => false,
            }
        };
        if let Some(target) = requeue_on.filter(|t| !Arc::ptr_eq(t, self)) {
            let pushed = {
                let mut other = target.state.lock();
                target.push_deferred(&mut other, item)
            };
            if pushed {
                target.wake();
            }
        }
        self.idle.notify_all();
        if requeued_here {
            self.wake();
        }
    }

    /// Push an item that was submitted while running. Returns whether it was
    /// pushed; a destroyed queue drops it instead.
    fn push_deferred(&self, qs: &mut QueueState, item: &WorkItem) -> bool {
        let mut st = item.inner.state.lock();
        let ours = st
            .queued_on
            .as_ref()
            .is_some_and(|q| std::ptr::eq(Arc::as_ptr(q), self));
        if !st.deferred || !ours {
            return false;
        }
        st.deferred = false;
        if qs.shutdown {
            st.queued_on = None;
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        qs.items.push_back(item.clone());
        true
    }
}

struct WorkQueueInner {
    shared: Arc<QueueShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl Drop for WorkQueueInner {
    fn drop(&mut self) {
        // Signal shutdown but don't join; explicit destroy() is required for
        // an orderly stop.
        let mut qs = self.shared.state.lock();
        if !qs.shutdown {
            qs.shutdown = true;
            drop(qs);
            self.shared.not_empty.notify_all();
            debug!(queue = %self.shared.name, "work queue dropped without destroy");
        }
    }
}

/// Handle to a FIFO work queue. Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<WorkQueueInner>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.shared.name)
            .field("worker_count", &self.inner.worker_count)
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    /// Create a queue. `config.worker_count == 0` attaches it to `shared_pool`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration is invalid or shared mode is
    /// requested without a pool; `AllocationFailure` if a worker thread cannot
    /// be spawned.
    pub fn create(
        config: WorkQueueConfig,
        shared_pool: Option<&SharedWorkerPool>,
        audit: Option<SharedAudit>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;

        let waker = if config.worker_count == 0 {
            let pool = shared_pool.ok_or_else(|| {
                EngineError::InvalidConfig(format!(
                    "queue `{}` has no workers and no shared pool",
                    config.name
                ))
            })?;
            if pool.is_shut_down() {
                return Err(EngineError::invalid_state("shared worker pool is shut down"));
            }
            Some(pool.sender())
        } else {
            None
        };

        let shared = Arc::new(QueueShared {
            name: config.name.clone(),
            capacity: config.capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                active: 0,
                runners: Vec::new(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            idle: Condvar::new(),
            waker,
            counters: QueueCounters::default(),
            audit,
        });

        let queue = Self {
            inner: Arc::new(WorkQueueInner {
                shared: Arc::clone(&shared),
                workers: Mutex::new(Vec::with_capacity(config.worker_count)),
                worker_count: config.worker_count,
            }),
        };

        for worker_id in 0..config.worker_count {
            match spawn_worker(worker_id, Arc::clone(&shared)) {
                Ok(handle) => queue.inner.workers.lock().push(handle),
                Err(e) => {
                    // Drop of the handle signals shutdown to the workers spawned so far.
                    return Err(EngineError::AllocationFailure(format!(
                        "queue `{}`: failed to spawn worker {worker_id}: {e}",
                        config.name
                    )));
                }
            }
        }

        info!(
            queue = %config.name,
            worker_count = config.worker_count,
            capacity = ?config.capacity,
            "work queue created"
        );
        Ok(queue)
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    /// Append `item` to the tail of the queue.
    ///
    /// # Errors
    ///
    /// `InvalidState` after destroy, `QueueFull` when a bounded queue is at
    /// capacity.
    pub fn submit(&self, item: &WorkItem) -> Result<SubmitOutcome, EngineError> {
        let shared = &self.inner.shared;
        let mut qs = shared.state.lock();
        if qs.shutdown {
            return Err(EngineError::invalid_state(format!(
                "work queue `{}` is destroyed",
                shared.name
            )));
        }
        let mut st = item.inner.state.lock();
        if st.queued_on.is_some() {
            return Ok(SubmitOutcome::AlreadyQueued);
        }
        if st.cancelling > 0 {
            return Ok(SubmitOutcome::Cancelling);
        }
        if let Some(cap) = shared.capacity {
            if qs.items.len() >= cap {
                warn!(queue = %shared.name, capacity = cap, "work queue is full");
                return Err(EngineError::QueueFull(shared.name.clone()));
            }
        }
        st.queued_on = Some(Arc::clone(shared));
        let deferred = st.running_on.is_some();
        if deferred {
            st.deferred = true;
        } else {
            qs.items.push_back(item.clone());
        }
        drop(st);
        drop(qs);

        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if !deferred {
            shared.wake();
        }
        debug!(queue = %shared.name, item = %item.inner.name, deferred, "work item submitted");
        Ok(SubmitOutcome::Submitted)
    }

    /// Cancel `item` wherever it is queued; see [`WorkItem::cancel_sync`].
    pub fn cancel_sync(&self, item: &WorkItem) -> CancelOutcome {
        item.cancel_sync()
    }

    /// Block until the queue is empty and none of its handlers is running.
    ///
    /// # Errors
    ///
    /// `InvalidState` when called from one of the queue's own handlers.
    pub fn flush(&self) -> Result<(), EngineError> {
        let shared = &self.inner.shared;
        let mut qs = shared.state.lock();
        if qs.runners.contains(&thread::current().id()) {
            return Err(EngineError::invalid_state(format!(
                "flush of `{}` from its own handler",
                shared.name
            )));
        }
        while !(qs.items.is_empty() && qs.active == 0) {
            shared.idle.wait(&mut qs);
        }
        Ok(())
    }

    /// Stop the queue: wait for running handlers, join dedicated workers and
    /// drop any items still queued.
    ///
    /// # Errors
    ///
    /// `InvalidState` if already destroyed or called from one of the queue's
    /// own handlers.
    pub fn destroy(&self) -> Result<(), EngineError> {
        let shared = &self.inner.shared;
        let dropped = {
            let mut qs = shared.state.lock();
            if qs.shutdown {
                return Err(EngineError::invalid_state(format!(
                    "work queue `{}` already destroyed",
                    shared.name
                )));
            }
            if qs.runners.contains(&thread::current().id()) {
                return Err(EngineError::invalid_state(format!(
                    "destroy of `{}` from its own handler",
                    shared.name
                )));
            }
            qs.shutdown = true;
            let dropped: Vec<WorkItem> = qs.items.drain(..).collect();
            for item in &dropped {
                let mut st = item.inner.state.lock();
                st.queued_on = None;
                st.deferred = false;
            }
            shared.not_empty.notify_all();
            while qs.active > 0 {
                shared.idle.wait(&mut qs);
            }
            dropped.len()
        };

        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for (idx, handle) in workers.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!(queue = %shared.name, worker_id = idx, "worker panicked");
            }
        }

        if dropped > 0 {
            shared
                .counters
                .dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(queue = %shared.name, dropped, "work queue destroyed with undrained items");
        }
        shared.idle.notify_all();
        audit::record(
            shared.audit.as_ref(),
            &shared.name,
            AuditAction::Destroy,
            Some(format!("dropped={dropped}")),
        );
        info!(queue = %shared.name, "work queue destroyed");
        Ok(())
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.shared.state.lock().shutdown
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let shared = &self.inner.shared;
        let (queued, active) = {
            let qs = shared.state.lock();
            (qs.items.len(), qs.active)
        };
        QueueStats {
            name: shared.name.clone(),
            worker_count: self.inner.worker_count,
            queued,
            active,
            submitted: shared.counters.submitted.load(Ordering::Relaxed),
            completed: shared.counters.completed.load(Ordering::Relaxed),
            failed: shared.counters.failed.load(Ordering::Relaxed),
            cancelled: shared.counters.cancelled.load(Ordering::Relaxed),
            dropped: shared.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Spawn a dedicated worker thread.
fn spawn_worker(worker_id: usize, shared: Arc<QueueShared>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{}-{worker_id}", shared.name))
        .spawn(move || {
            debug!(queue = %shared.name, worker_id, "worker started");
            loop {
                let item = {
                    let mut qs = shared.state.lock();
                    loop {
                        if qs.shutdown {
                            debug!(queue = %shared.name, worker_id, "worker exiting");
                            return;
                        }
                        if let Some(item) = shared.begin_next(&mut qs) {
                            break item;
                        }
                        shared.not_empty.wait(&mut qs);
                    }
                };
                shared.execute(&item);
            }
        })
}
