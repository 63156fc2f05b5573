//! Delayed work: a tasklet or work item scheduled after a minimum delay.
//!
//! On expiry the timer thread performs the target's normal scheduling
//! operation, so everything the target guarantees (non-reentrancy, FIFO,
//! cancellation) carries over. A handler may re-arm its own delayed work;
//! an optional depth guard bounds consecutive self re-arms.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::tasklet::{RunQueue, Tasklet};
use super::timer::{TimerId, TimerService};
use super::work_queue::{WorkItem, WorkQueue};
use super::{AppResult, CancelOutcome, EngineError};

/// What a delayed work item schedules when its timer expires.
#[derive(Debug, Clone)]
pub enum DelayTarget {
    /// Schedule a tasklet on the normal tier.
    Tasklet(Tasklet),
    /// Submit a work item to a queue.
    Queue {
        /// Queue the item is submitted to.
        queue: WorkQueue,
        /// The item.
        item: WorkItem,
    },
}

impl DelayTarget {
    fn fire(&self) -> Result<(), EngineError> {
        match self {
            Self::Tasklet(t) => t.schedule().map(drop),
            Self::Queue { queue, item } => queue.submit(item).map(drop),
        }
    }

    fn cancel_sync(&self) -> CancelOutcome {
        match self {
            Self::Tasklet(t) => t.cancel_sync().unwrap_or_else(|e| {
                debug!(tasklet = %t.name(), error = %e, "delayed target not cancellable");
                CancelOutcome::NotPending
            }),
            Self::Queue { item, .. } => item.cancel_sync(),
        }
    }

    fn is_pending(&self) -> bool {
        match self {
            Self::Tasklet(t) => t.is_pending(),
            Self::Queue { item, .. } => item.is_pending(),
        }
    }

    fn is_current_runner(&self) -> bool {
        match self {
            Self::Tasklet(t) => t.is_current_runner(),
            Self::Queue { item, .. } => item.is_current_runner(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Tasklet(t) => t.name(),
            Self::Queue { item, .. } => item.name(),
        }
    }
}

/// Result of [`DelayedWork::schedule_after`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    /// The timer was armed.
    Armed,
    /// A timer is already armed; the original deadline stands.
    AlreadyArmed,
    /// A `cancel_sync` is in progress; nothing was armed.
    Cancelling,
}

struct DelayedState {
    armed: Option<TimerId>,
    cancelling: u32,
    /// Consecutive re-arms issued from the target's own handler.
    depth: u32,
    fire_count: u64,
}

struct DelayedInner {
    target: DelayTarget,
    timers: TimerService,
    max_depth: Option<u32>,
    state: Mutex<DelayedState>,
}

/// Handle to a delayed work item. Cloning yields another handle to the same item.
#[derive(Clone)]
pub struct DelayedWork {
    inner: Arc<DelayedInner>,
}

impl std::fmt::Debug for DelayedWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedWork")
            .field("target", &self.inner.target.name())
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

impl DelayedWork {
    /// Wrap an existing target. `max_depth` bounds consecutive re-arms made
    /// from the target's own handler; `None` disables the guard.
    #[must_use]
    pub fn new(timers: &TimerService, target: DelayTarget, max_depth: Option<u32>) -> Self {
        Self {
            inner: Arc::new(Self::inner(timers, target, max_depth)),
        }
    }

    /// Delayed work submitted to `queue`; the handler receives this delayed
    /// work so it can re-arm itself.
    #[must_use]
    pub fn for_queue<F>(
        timers: &TimerService,
        queue: &WorkQueue,
        name: impl Into<String>,
        max_depth: Option<u32>,
        handler: F,
    ) -> Self
    where
        F: Fn(&Self) -> AppResult<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let inner = Arc::new_cyclic(|weak: &Weak<DelayedInner>| {
            let weak = weak.clone();
            let item = WorkItem::new(name, move |_| match weak.upgrade() {
                Some(inner) => handler(&Self { inner }),
                None => Ok(()),
            });
            let target = DelayTarget::Queue {
                queue: queue.clone(),
                item,
            };
            Self::inner(timers, target, max_depth)
        });
        Self { inner }
    }

    /// Delayed tasklet on `run_queue`; the handler receives this delayed work.
    #[must_use]
    pub fn for_tasklet<F>(
        timers: &TimerService,
        run_queue: &RunQueue,
        name: impl Into<String>,
        max_depth: Option<u32>,
        handler: F,
    ) -> Self
    where
        F: Fn(&Self) -> AppResult<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let inner = Arc::new_cyclic(|weak: &Weak<DelayedInner>| {
            let weak = weak.clone();
            let tasklet = Tasklet::new(run_queue, name, move |_| match weak.upgrade() {
                Some(inner) => handler(&Self { inner }),
                None => Ok(()),
            });
            Self::inner(timers, DelayTarget::Tasklet(tasklet), max_depth)
        });
        Self { inner }
    }

    fn inner(timers: &TimerService, target: DelayTarget, max_depth: Option<u32>) -> DelayedInner {
        DelayedInner {
            target,
            timers: timers.clone(),
            max_depth,
            state: Mutex::new(DelayedState {
                armed: None,
                cancelling: 0,
                depth: 0,
                fire_count: 0,
            }),
        }
    }

    /// The scheduled target.
    #[must_use]
    pub fn target(&self) -> &DelayTarget {
        &self.inner.target
    }

    /// Arm the timer; on expiry the target is scheduled.
    ///
    /// # Errors
    ///
    /// `InvalidState` after the timer service is shut down;
    /// `RescheduleLimit` when the re-arm depth guard trips.
    pub fn schedule_after(&self, delay: Duration) -> Result<DelayOutcome, EngineError> {
        let mut st = self.inner.state.lock();
        if st.cancelling > 0 {
            return Ok(DelayOutcome::Cancelling);
        }
        if st.armed.is_some() {
            return Ok(DelayOutcome::AlreadyArmed);
        }

        if self.inner.target.is_current_runner() {
            if let Some(max) = self.inner.max_depth {
                if st.depth >= max {
                    warn!(
                        target_name = %self.inner.target.name(),
                        max_depth = max,
                        "delayed work re-arm limit reached"
                    );
                    return Err(EngineError::RescheduleLimit(max));
                }
            }
            st.depth += 1;
        } else {
            st.depth = 0;
        }

        let weak = Arc::downgrade(&self.inner);
        let id = self.inner.timers.arm(delay, move |id| {
            if let Some(inner) = weak.upgrade() {
                Self::fire(&inner, id);
            }
        })?;
        st.armed = Some(id);
        drop(st);

        debug!(
            target_name = %self.inner.target.name(),
            delay_ms = delay.as_millis() as u64,
            "delayed work armed"
        );
        Ok(DelayOutcome::Armed)
    }

    /// Timer thread entry point.
    fn fire(inner: &DelayedInner, id: TimerId) {
        // Held across the submission so a concurrent cancel either disarms
        // first or sees the target pending.
        let mut st = inner.state.lock();
        if st.armed != Some(id) {
            return;
        }
        st.armed = None;
        st.fire_count += 1;
        if let Err(e) = inner.target.fire() {
            warn!(target_name = %inner.target.name(), error = %e, "delayed work expiry dropped");
        }
    }

    /// Disarm the timer and synchronously cancel the target.
    ///
    /// Returns [`CancelOutcome::WasPending`] if the timer was armed or the
    /// target was pending or running. Re-arms attempted meanwhile are refused.
    pub fn cancel_sync(&self) -> CancelOutcome {
        let disarmed = {
            let mut st = self.inner.state.lock();
            st.cancelling += 1;
            st.armed.take().is_some_and(|id| {
                self.inner.timers.disarm(id);
                true
            })
        };

        let target = self.inner.target.cancel_sync();

        let mut st = self.inner.state.lock();
        st.cancelling -= 1;
        st.depth = 0;
        drop(st);

        if disarmed || target.was_pending() {
            debug!(target_name = %self.inner.target.name(), disarmed, "delayed work cancelled");
            CancelOutcome::WasPending
        } else {
            CancelOutcome::NotPending
        }
    }

    /// Whether the timer is armed or the target is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().armed.is_some() || self.inner.target.is_pending()
    }

    /// Number of expiries that reached the target.
    #[must_use]
    pub fn fire_count(&self) -> u64 {
        self.inner.state.lock().fire_count
    }
}
