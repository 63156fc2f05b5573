//! Tasklets: single-shot deferred callbacks gated by a nestable disable count.
//!
//! A [`Tasklet`] is scheduled onto a [`RunQueue`], whose dispatcher threads
//! form the fast execution tier. Handlers must not block for long; blocking
//! work belongs on a [`WorkQueue`](crate::core::WorkQueue).
//!
//! # Guarantees
//!
//! - Runs of the same tasklet never overlap. Scheduling a running tasklet only
//!   marks it pending; it is re-queued when the current run returns.
//! - The `hi` tier is drained completely before the `normal` tier.
//! - After [`Tasklet::kill`] returns the tasklet never runs again.
//!
//! # Example
//!
//! ```rust,ignore
//! let rq = RunQueue::start(2, None)?;
//! let t = Tasklet::new(&rq, "rx-complete", |_t| Ok(()));
//! t.schedule()?;
//! t.kill()?;
//! rq.shutdown();
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::audit::{self, AuditAction, SharedAudit};
use super::executor::execute_guarded;
use super::{AppResult, CancelOutcome, EngineError};

/// Unique tasklet identifier.
pub type TaskletId = u64;

static NEXT_TASKLET_ID: AtomicU64 = AtomicU64::new(1);

/// Run queue tier a tasklet is scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Normal tier.
    Normal,
    /// Expedited tier, always drained ahead of the normal tier.
    High,
}

/// Observable tasklet state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskletPhase {
    /// Not pending and not running.
    Idle,
    /// Pending; either queued or held back by the disable count.
    Scheduled,
    /// A handler invocation is in flight.
    Running,
    /// Terminal.
    Killed,
}

/// Result of [`Tasklet::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Marked pending and handed to the run queue (or will be, once the
    /// current run returns).
    Queued,
    /// Marked pending but disabled; runs after the matching `enable`.
    Deferred,
    /// Already pending and not yet run; nothing changed.
    AlreadyPending,
}

/// Per-tasklet execution counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskletStats {
    /// Completed handler invocations, successful or not.
    pub runs: u64,
    /// Invocations that returned an error or panicked.
    pub failures: u64,
    /// Description of the most recent failure.
    pub last_error: Option<String>,
}

type TaskletHandler = Box<dyn Fn(&Tasklet) -> AppResult<()> + Send + Sync>;

struct TaskletState {
    disable_count: u32,
    pending: bool,
    /// Ticket of the run queue entry that may start the next run. Entries
    /// popped with any other ticket are stale and ignored.
    queued: Option<u64>,
    next_ticket: u64,
    running_on: Option<ThreadId>,
    /// Kill requested; no further runs are admitted.
    killed: bool,
    /// Kill finished.
    dead: bool,
    tier: Tier,
    stats: TaskletStats,
}

struct TaskletInner {
    id: TaskletId,
    name: String,
    handler: TaskletHandler,
    state: Mutex<TaskletState>,
    /// Signalled whenever a run finishes.
    idle: Condvar,
    run_queue: RunQueue,
}

/// Handle to a deferred unit. Cloning yields another handle to the same unit.
#[derive(Clone)]
pub struct Tasklet {
    inner: Arc<TaskletInner>,
}

impl std::fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tasklet")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Tasklet {
    /// Create an enabled tasklet bound to `run_queue`.
    pub fn new<F>(run_queue: &RunQueue, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Self) -> AppResult<()> + Send + Sync + 'static,
    {
        Self::with_disable_count(run_queue, name.into(), 0, Box::new(handler))
    }

    /// Create a tasklet that starts with a disable count of one; schedules are
    /// held until the first [`enable`](Self::enable).
    pub fn new_disabled<F>(run_queue: &RunQueue, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Self) -> AppResult<()> + Send + Sync + 'static,
    {
        Self::with_disable_count(run_queue, name.into(), 1, Box::new(handler))
    }

    fn with_disable_count(
        run_queue: &RunQueue,
        name: String,
        disable_count: u32,
        handler: TaskletHandler,
    ) -> Self {
        Self {
            inner: Arc::new(TaskletInner {
                id: NEXT_TASKLET_ID.fetch_add(1, Ordering::Relaxed),
                name,
                handler,
                state: Mutex::new(TaskletState {
                    disable_count,
                    pending: false,
                    queued: None,
                    next_ticket: 0,
                    running_on: None,
                    killed: false,
                    dead: false,
                    tier: Tier::Normal,
                    stats: TaskletStats::default(),
                }),
                idle: Condvar::new(),
                run_queue: run_queue.clone(),
            }),
        }
    }

    /// Tasklet identifier.
    #[must_use]
    pub fn id(&self) -> TaskletId {
        self.inner.id
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schedule on the normal tier.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the tasklet was killed or the run queue is shut down.
    pub fn schedule(&self) -> Result<ScheduleOutcome, EngineError> {
        self.schedule_on(Tier::Normal)
    }

    /// Schedule on the expedited tier.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the tasklet was killed or the run queue is shut down.
    pub fn schedule_hi(&self) -> Result<ScheduleOutcome, EngineError> {
        self.schedule_on(Tier::High)
    }

    /// Schedule on the given tier.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the tasklet was killed or the run queue is shut down.
    pub fn schedule_on(&self, tier: Tier) -> Result<ScheduleOutcome, EngineError> {
        let mut st = self.inner.state.lock();
        if st.killed {
            warn!(tasklet = %self.inner.name, "schedule on killed tasklet ignored");
            return Err(EngineError::invalid_state(format!(
                "tasklet `{}` is killed",
                self.inner.name
            )));
        }
        if st.pending {
            return Ok(ScheduleOutcome::AlreadyPending);
        }
        st.pending = true;
        st.tier = tier;
        if st.disable_count > 0 {
            return Ok(ScheduleOutcome::Deferred);
        }
        if st.running_on.is_none() && st.queued.is_none() {
            if let Err(e) = self.enqueue_locked(&mut st) {
                st.pending = false;
                return Err(e);
            }
        }
        Ok(ScheduleOutcome::Queued)
    }

    /// Decrement the disable count; at zero a pending tasklet is queued.
    ///
    /// # Errors
    ///
    /// `InvalidState` on an unbalanced enable, a killed tasklet, or a shut
    /// down run queue.
    pub fn enable(&self) -> Result<(), EngineError> {
        let mut st = self.inner.state.lock();
        if st.killed {
            return Err(EngineError::invalid_state(format!(
                "tasklet `{}` is killed",
                self.inner.name
            )));
        }
        if st.disable_count == 0 {
            return Err(EngineError::invalid_state(format!(
                "unbalanced enable on tasklet `{}`",
                self.inner.name
            )));
        }
        st.disable_count -= 1;
        if st.disable_count == 0
            && st.pending
            && st.queued.is_none()
            && st.running_on.is_none()
        {
            self.enqueue_locked(&mut st)?;
        }
        Ok(())
    }

    /// Increment the disable count and wait for an in-flight run to finish.
    ///
    /// When this returns, no handler invocation is in progress and all side
    /// effects of earlier runs are visible to the caller. Called from the
    /// tasklet's own handler it does not wait.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the tasklet was killed.
    pub fn disable_sync(&self) -> Result<(), EngineError> {
        let mut st = self.disable_locked()?;
        if st.running_on != Some(thread::current().id()) {
            while st.running_on.is_some() {
                self.inner.idle.wait(&mut st);
            }
        }
        Ok(())
    }

    /// Increment the disable count without waiting for an in-flight run.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the tasklet was killed.
    pub fn disable_nosync(&self) -> Result<(), EngineError> {
        self.disable_locked().map(drop)
    }

    fn disable_locked(&self) -> Result<parking_lot::MutexGuard<'_, TaskletState>, EngineError> {
        let mut st = self.inner.state.lock();
        if st.killed {
            return Err(EngineError::invalid_state(format!(
                "tasklet `{}` is killed",
                self.inner.name
            )));
        }
        st.disable_count += 1;
        Ok(st)
    }

    /// Remove the tasklet from the run queue, wait for an in-flight run and
    /// make it terminal.
    ///
    /// # Errors
    ///
    /// `InvalidState` if already killed, or if called from the tasklet's own
    /// handler (the wait could never finish).
    pub fn kill(&self) -> Result<(), EngineError> {
        let mut st = self.inner.state.lock();
        if st.killed {
            return Err(EngineError::invalid_state(format!(
                "tasklet `{}` already killed",
                self.inner.name
            )));
        }
        if st.running_on == Some(thread::current().id()) {
            return Err(EngineError::invalid_state(format!(
                "tasklet `{}` cannot kill itself from its handler",
                self.inner.name
            )));
        }
        st.killed = true;
        st.pending = false;
        if st.queued.take().is_some() {
            self.inner.run_queue.remove(&self.inner);
        }
        while st.running_on.is_some() {
            self.inner.idle.wait(&mut st);
        }
        st.dead = true;
        drop(st);

        debug!(tasklet = %self.inner.name, id = self.inner.id, "tasklet killed");
        audit::record(
            self.inner.run_queue.shared.audit.as_ref(),
            &self.inner.name,
            AuditAction::Kill,
            None,
        );
        Ok(())
    }

    /// Clear a pending schedule and wait for an in-flight run, without making
    /// the tasklet terminal. Self-reschedules issued by the in-flight run are
    /// discarded as well.
    ///
    /// # Errors
    ///
    /// `InvalidState` if the tasklet was killed.
    pub fn cancel_sync(&self) -> Result<CancelOutcome, EngineError> {
        let mut st = self.inner.state.lock();
        if st.killed {
            return Err(EngineError::invalid_state(format!(
                "tasklet `{}` is killed",
                self.inner.name
            )));
        }
        let was_pending = st.pending || st.running_on.is_some();
        let current = thread::current().id();
        loop {
            st.pending = false;
            if st.queued.take().is_some() {
                self.inner.run_queue.remove(&self.inner);
            }
            if st.running_on.is_none() || st.running_on == Some(current) {
                break;
            }
            self.inner.idle.wait(&mut st);
        }
        drop(st);

        if was_pending {
            audit::record(
                self.inner.run_queue.shared.audit.as_ref(),
                &self.inner.name,
                AuditAction::Cancel,
                None,
            );
            Ok(CancelOutcome::WasPending)
        } else {
            Ok(CancelOutcome::NotPending)
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> TaskletPhase {
        let st = self.inner.state.lock();
        if st.dead {
            TaskletPhase::Killed
        } else if st.running_on.is_some() {
            TaskletPhase::Running
        } else if st.pending {
            TaskletPhase::Scheduled
        } else {
            TaskletPhase::Idle
        }
    }

    /// Whether a schedule is outstanding (queued or held by the disable count).
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending
    }

    /// Current disable count.
    #[must_use]
    pub fn disable_count(&self) -> u32 {
        self.inner.state.lock().disable_count
    }

    /// Execution counters.
    #[must_use]
    pub fn stats(&self) -> TaskletStats {
        self.inner.state.lock().stats.clone()
    }

    /// Whether the calling thread is currently running this tasklet's handler.
    pub(crate) fn is_current_runner(&self) -> bool {
        self.inner.state.lock().running_on == Some(thread::current().id())
    }

    fn enqueue_locked(&self, st: &mut TaskletState) -> Result<(), EngineError> {
        let ticket = st.next_ticket;
        self.inner
            .run_queue
            .push(Arc::clone(&self.inner), ticket, st.tier)?;
        st.next_ticket = ticket.wrapping_add(1);
        st.queued = Some(ticket);
        Ok(())
    }

    /// Dispatcher entry point: run the handler once if still admissible.
    fn run(&self, ticket: u64) {
        let name = &self.inner.name;
        {
            let mut st = self.inner.state.lock();
            // A cancel or kill raced the pop and a later push owns the slot.
            if st.queued != Some(ticket) {
                return;
            }
            st.queued = None;
            // Disabled tasklets stay pending; `enable` re-queues them.
            if st.killed || !st.pending || st.disable_count > 0 {
                return;
            }
            // Still pending, so the in-flight run re-queues it on completion.
            if st.running_on.is_some() {
                return;
            }
            st.pending = false;
            st.running_on = Some(thread::current().id());
        }

        debug!(tasklet = %name, id = self.inner.id, "tasklet running");
        let outcome = execute_guarded(|| (self.inner.handler)(self));

        let shared = &self.inner.run_queue.shared;
        let mut st = self.inner.state.lock();
        st.running_on = None;
        st.stats.runs += 1;
        shared.executed.fetch_add(1, Ordering::Relaxed);
        if let Err(ref msg) = outcome {
            st.stats.failures += 1;
            st.stats.last_error = Some(msg.clone());
            shared.failed.fetch_add(1, Ordering::Relaxed);
        }
        if !st.killed && st.pending && st.disable_count == 0 && st.queued.is_none() {
            if let Err(e) = self.enqueue_locked(&mut st) {
                debug!(tasklet = %name, error = %e, "self-reschedule dropped");
                st.pending = false;
            }
        }
        self.inner.idle.notify_all();
        drop(st);

        if let Err(msg) = outcome {
            error!(tasklet = %name, id = self.inner.id, error = %msg, "tasklet handler failed");
            audit::record(shared.audit.as_ref(), name, AuditAction::Fail, Some(msg));
        }
    }
}

/// Aggregate counters of a run queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunQueueStats {
    /// Dispatcher thread count.
    pub dispatchers: usize,
    /// Tasklets currently queued on the hi tier.
    pub queued_hi: usize,
    /// Tasklets currently queued on the normal tier.
    pub queued_normal: usize,
    /// Handler invocations completed.
    pub executed: u64,
    /// Handler invocations that failed.
    pub failed: u64,
}

struct RunQueueState {
    hi: VecDeque<(Arc<TaskletInner>, u64)>,
    normal: VecDeque<(Arc<TaskletInner>, u64)>,
    shutdown: bool,
}

struct RunQueueShared {
    state: Mutex<RunQueueState>,
    available: Condvar,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    executed: AtomicU64,
    failed: AtomicU64,
    audit: Option<SharedAudit>,
}

/// Two-tier run queue drained by dispatcher threads (the fast tier).
///
/// Dispatchers are only joined by [`RunQueue::shutdown`]; the owner is
/// expected to call it.
#[derive(Clone)]
pub struct RunQueue {
    shared: Arc<RunQueueShared>,
}

impl RunQueue {
    /// Start `dispatchers` dispatcher threads.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for zero dispatchers, `AllocationFailure` if a thread
    /// cannot be spawned.
    pub fn start(dispatchers: usize, audit: Option<SharedAudit>) -> Result<Self, EngineError> {
        if dispatchers == 0 {
            return Err(EngineError::InvalidConfig(
                "run queue needs at least one dispatcher".into(),
            ));
        }
        let rq = Self {
            shared: Arc::new(RunQueueShared {
                state: Mutex::new(RunQueueState {
                    hi: VecDeque::new(),
                    normal: VecDeque::new(),
                    shutdown: false,
                }),
                available: Condvar::new(),
                dispatchers: Mutex::new(Vec::with_capacity(dispatchers)),
                executed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                audit,
            }),
        };

        for idx in 0..dispatchers {
            let shared = Arc::clone(&rq.shared);
            let spawned = thread::Builder::new()
                .name(format!("tasklet-{idx}"))
                .spawn(move || dispatch_loop(idx, &shared));
            match spawned {
                Ok(handle) => rq.shared.dispatchers.lock().push(handle),
                Err(e) => {
                    rq.shutdown();
                    return Err(EngineError::AllocationFailure(format!(
                        "failed to spawn tasklet dispatcher {idx}: {e}"
                    )));
                }
            }
        }

        info!(dispatchers, "tasklet run queue started");
        Ok(rq)
    }

    fn push(
        &self,
        tasklet: Arc<TaskletInner>,
        ticket: u64,
        tier: Tier,
    ) -> Result<(), EngineError> {
        let mut st = self.shared.state.lock();
        if st.shutdown {
            return Err(EngineError::invalid_state("tasklet run queue is shut down"));
        }
        match tier {
            Tier::High => st.hi.push_back((tasklet, ticket)),
            Tier::Normal => st.normal.push_back((tasklet, ticket)),
        }
        drop(st);
        self.shared.available.notify_one();
        Ok(())
    }

    fn remove(&self, tasklet: &Arc<TaskletInner>) {
        let mut st = self.shared.state.lock();
        st.hi.retain(|(t, _)| !Arc::ptr_eq(t, tasklet));
        st.normal.retain(|(t, _)| !Arc::ptr_eq(t, tasklet));
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    pub(crate) fn audit(&self) -> Option<&SharedAudit> {
        self.shared.audit.as_ref()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> RunQueueStats {
        let st = self.shared.state.lock();
        RunQueueStats {
            dispatchers: self.shared.dispatchers.lock().len(),
            queued_hi: st.hi.len(),
            queued_normal: st.normal.len(),
            executed: self.shared.executed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop dispatchers after their current run and drop queued tasklets.
    /// Idempotent; must not be called from a tasklet handler.
    pub fn shutdown(&self) {
        let dropped = {
            let mut st = self.shared.state.lock();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
            let dropped = st.hi.len() + st.normal.len();
            st.hi.clear();
            st.normal.clear();
            dropped
        };
        self.shared.available.notify_all();
        if dropped > 0 {
            warn!(dropped, "run queue shut down with queued tasklets");
        }

        let workers: Vec<_> = self.shared.dispatchers.lock().drain(..).collect();
        for (idx, handle) in workers.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!(dispatcher = idx, "tasklet dispatcher panicked");
            }
        }
        info!("tasklet run queue shut down");
    }
}

fn dispatch_loop(idx: usize, shared: &Arc<RunQueueShared>) {
    debug!(dispatcher = idx, "tasklet dispatcher started");
    loop {
        let (next, ticket) = {
            let mut st = shared.state.lock();
            loop {
                if st.shutdown {
                    debug!(dispatcher = idx, "tasklet dispatcher exiting");
                    return;
                }
                if let Some(t) = st.hi.pop_front() {
                    break t;
                }
                if let Some(t) = st.normal.pop_front() {
                    break t;
                }
                shared.available.wait(&mut st);
            }
        };
        Tasklet { inner: next }.run(ticket);
    }
}
