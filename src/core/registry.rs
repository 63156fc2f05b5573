//! Task registry: a bounded arena of tracked tasklets with live statistics.
//!
//! Each tracked entry owns a payload and a tasklet that runs the registry's
//! handler on that payload. Entries stay linked after they run, so the
//! registry can report both a running `pending` counter and a pending count
//! derived by scanning the live entries.
//!
//! # Design Principles
//!
//! - **Fixed capacity**: slots are preallocated; exhaustion is an error, never growth
//! - **Generational ids**: a stale [`EntryId`] never aliases a reused slot
//! - **Short critical sections**: the list lock is never held across a
//!   handler or a blocking kill
//! - **Dual accounting**: counter and scan are reported side by side, not reconciled

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::audit::{self, AuditAction, SharedAudit};
use super::executor::execute_guarded;
use super::tasklet::{RunQueue, Tasklet, Tier};
use super::{AppResult, EngineError};

/// Generational handle to a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    /// Slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at the time the entry was created.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Registry statistics, as exposed to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Registry name.
    pub name: String,
    /// Entries created.
    pub created: u64,
    /// Entries scheduled.
    pub scheduled: u64,
    /// Handler completions.
    pub executed: u64,
    /// Entries created with the priority flag.
    pub high_priority: u64,
    /// Running counter: incremented on schedule, decremented on completion.
    pub pending_counter: i64,
    /// Live entries not yet executed whose tasklet is still pending.
    pub pending_by_scan: u64,
    /// Linked entries.
    pub live: usize,
    /// Slot capacity.
    pub capacity: usize,
}

type EntryHandler<P> = dyn Fn(EntryId, &P) -> AppResult<()> + Send + Sync;

struct RegistryEntry<P> {
    payload: Arc<P>,
    priority: bool,
    executed: bool,
    tasklet: Tasklet,
}

enum Slot<P> {
    Vacant { generation: u32 },
    Live { generation: u32, entry: RegistryEntry<P> },
    /// Unlinked; its tasklet is being killed outside the list lock.
    Draining { generation: u32 },
}

impl<P> Slot<P> {
    const fn generation(&self) -> u32 {
        match self {
            Self::Vacant { generation }
            | Self::Live { generation, .. }
            | Self::Draining { generation } => *generation,
        }
    }
}

/// Fixed-capacity slot arena with a free-index stack.
struct Arena<P> {
    slots: Vec<Slot<P>>,
    free: Vec<usize>,
    live: usize,
}

impl<P> Arena<P> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Vacant { generation: 0 }).collect(),
            // Reversed so the lowest index is handed out first.
            free: (0..capacity).rev().collect(),
            live: 0,
        }
    }

    fn get(&self, id: EntryId) -> Option<&RegistryEntry<P>> {
        match self.slots.get(id.index as usize)? {
            Slot::Live { generation, entry } if *generation == id.generation => Some(entry),
            _ => None,
        }
    }

    fn get_mut(&mut self, id: EntryId) -> Option<&mut RegistryEntry<P>> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Live { generation, entry } if *generation == id.generation => Some(entry),
            _ => None,
        }
    }

    /// Move a live entry out, leaving the slot draining.
    fn unlink(&mut self, index: usize) -> Option<RegistryEntry<P>> {
        let slot = self.slots.get_mut(index)?;
        let generation = slot.generation();
        match std::mem::replace(slot, Slot::Draining { generation }) {
            Slot::Live { entry, .. } => {
                self.live -= 1;
                Some(entry)
            }
            other => {
                *slot = other;
                None
            }
        }
    }

    fn has_draining(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| matches!(slot, Slot::Draining { .. }))
    }

    /// Return a draining slot to the free stack with a bumped generation.
    fn release(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            if let Slot::Draining { generation } = *slot {
                *slot = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                };
                self.free.push(index);
            }
        }
    }
}

struct RegistryList<P> {
    arena: Arena<P>,
    torn_down: bool,
}

#[derive(Debug, Default)]
struct RegistryCounters {
    created: AtomicU64,
    scheduled: AtomicU64,
    executed: AtomicU64,
    high_priority: AtomicU64,
    pending: AtomicI64,
}

struct RegistryInner<P> {
    name: String,
    run_queue: RunQueue,
    capacity: usize,
    priority_enabled: bool,
    handler: Box<EntryHandler<P>>,
    list: Mutex<RegistryList<P>>,
    /// Signalled whenever a draining slot is released.
    drained: Condvar,
    counters: RegistryCounters,
}

impl<P> RegistryInner<P> {
    fn audit(&self) -> Option<&SharedAudit> {
        self.run_queue.audit()
    }

    /// Tasklet body of entry `id`. Completion is counted even when the
    /// handler fails or panics; the failure is handed back to the tasklet.
    fn execute(&self, id: EntryId, payload: &P) -> AppResult<()> {
        let outcome = execute_guarded(|| (self.handler)(id, payload));

        self.counters.executed.fetch_add(1, Ordering::Relaxed);
        self.counters.pending.fetch_sub(1, Ordering::Relaxed);
        if let Some(entry) = self.list.lock().arena.get_mut(id) {
            entry.executed = true;
        }
        debug!(registry = %self.name, entry = %id, "tracked entry executed");
        audit::record(self.audit(), &self.name, AuditAction::Execute, Some(id.to_string()));
        outcome.map_err(anyhow::Error::msg)
    }
}

/// Bounded registry of tracked tasklets sharing one handler.
pub struct TaskRegistry<P> {
    inner: Arc<RegistryInner<P>>,
}

impl<P> Clone for TaskRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> std::fmt::Debug for TaskRegistry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

impl<P: Send + Sync + 'static> TaskRegistry<P> {
    /// Create a registry with `capacity` preallocated slots. Entries created
    /// with the priority flag use the hi tier when `priority_enabled`.
    pub fn new<F>(
        name: impl Into<String>,
        run_queue: &RunQueue,
        capacity: usize,
        priority_enabled: bool,
        handler: F,
    ) -> Self
    where
        F: Fn(EntryId, &P) -> AppResult<()> + Send + Sync + 'static,
    {
        let name = name.into();
        info!(registry = %name, capacity, priority_enabled, "task registry created");
        Self {
            inner: Arc::new(RegistryInner {
                name,
                run_queue: run_queue.clone(),
                capacity,
                priority_enabled,
                handler: Box::new(handler),
                list: Mutex::new(RegistryList {
                    arena: Arena::new(capacity),
                    torn_down: false,
                }),
                drained: Condvar::new(),
                counters: RegistryCounters::default(),
            }),
        }
    }

    /// Registry name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Allocate an entry for `payload`, link it and schedule its tasklet.
    ///
    /// # Errors
    ///
    /// `AllocationFailure` when every slot is in use; `InvalidState` after
    /// teardown or once the run queue is shut down.
    pub fn create_tracked(&self, payload: P, priority: bool) -> Result<EntryId, EngineError> {
        let inner = &self.inner;
        let mut list = inner.list.lock();
        if list.torn_down {
            return Err(EngineError::invalid_state(format!(
                "registry `{}` is torn down",
                inner.name
            )));
        }
        if inner.run_queue.is_shut_down() {
            return Err(EngineError::invalid_state("tasklet run queue is shut down"));
        }
        let Some(index) = list.arena.free.pop() else {
            warn!(registry = %inner.name, capacity = inner.capacity, "registry pool exhausted");
            return Err(EngineError::AllocationFailure(format!(
                "registry `{}` has no free slots (capacity {})",
                inner.name, inner.capacity
            )));
        };
        let id = EntryId {
            index: u32::try_from(index).unwrap_or(u32::MAX),
            generation: list.arena.slots[index].generation(),
        };

        let payload = Arc::new(payload);
        let weak: Weak<RegistryInner<P>> = Arc::downgrade(inner);
        let body = Arc::clone(&payload);
        let tasklet = Tasklet::new(&inner.run_queue, format!("{}#{id}", inner.name), move |_| {
            weak.upgrade().map_or(Ok(()), |reg| reg.execute(id, &body))
        });

        list.arena.slots[index] = Slot::Live {
            generation: id.generation,
            entry: RegistryEntry {
                payload,
                priority,
                executed: false,
                tasklet: tasklet.clone(),
            },
        };
        list.arena.live += 1;

        let counters = &inner.counters;
        counters.created.fetch_add(1, Ordering::Relaxed);
        if priority {
            counters.high_priority.fetch_add(1, Ordering::Relaxed);
        }
        counters.scheduled.fetch_add(1, Ordering::Relaxed);
        counters.pending.fetch_add(1, Ordering::Relaxed);

        let tier = if priority && inner.priority_enabled {
            Tier::High
        } else {
            Tier::Normal
        };
        if let Err(e) = tasklet.schedule_on(tier) {
            // Lost a race with run queue shutdown; unwind the accounting.
            counters.scheduled.fetch_sub(1, Ordering::Relaxed);
            counters.pending.fetch_sub(1, Ordering::Relaxed);
            let _ = list.arena.unlink(index);
            list.arena.release(index);
            return Err(e);
        }
        drop(list);

        debug!(registry = %inner.name, entry = %id, priority, ?tier, "tracked entry created");
        audit::record(inner.audit(), &inner.name, AuditAction::Create, Some(id.to_string()));
        Ok(id)
    }

    /// Payload of a live entry.
    #[must_use]
    pub fn payload(&self, id: EntryId) -> Option<Arc<P>> {
        let list = self.inner.list.lock();
        list.arena.get(id).map(|e| Arc::clone(&e.payload))
    }

    /// Whether a live entry has executed. `None` if the id is stale.
    #[must_use]
    pub fn is_executed(&self, id: EntryId) -> Option<bool> {
        self.inner.list.lock().arena.get(id).map(|e| e.executed)
    }

    /// Whether a live entry was created with the priority flag.
    #[must_use]
    pub fn is_priority(&self, id: EntryId) -> Option<bool> {
        self.inner.list.lock().arena.get(id).map(|e| e.priority)
    }

    /// Consistent view of the counters and a scan of the live entries.
    #[must_use]
    pub fn snapshot(&self) -> RegistryStats {
        let inner = &self.inner;
        let list = inner.list.lock();
        let pending_by_scan = list
            .arena
            .slots
            .iter()
            .filter(|slot| match slot {
                Slot::Live { entry, .. } => !entry.executed && entry.tasklet.is_pending(),
                _ => false,
            })
            .count() as u64;
        let counters = &inner.counters;
        RegistryStats {
            name: inner.name.clone(),
            created: counters.created.load(Ordering::Relaxed),
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            executed: counters.executed.load(Ordering::Relaxed),
            high_priority: counters.high_priority.load(Ordering::Relaxed),
            pending_counter: counters.pending.load(Ordering::Relaxed),
            pending_by_scan,
            live: list.arena.live,
            capacity: inner.capacity,
        }
    }

    /// Unlink one entry, kill its tasklet and return its slot to the pool.
    ///
    /// # Errors
    ///
    /// `InvalidState` for a stale id, after teardown, or when called from the
    /// entry's own handler.
    pub fn retire(&self, id: EntryId) -> Result<(), EngineError> {
        let inner = &self.inner;
        let entry = {
            let mut list = inner.list.lock();
            if list.torn_down {
                return Err(EngineError::invalid_state(format!(
                    "registry `{}` is torn down",
                    inner.name
                )));
            }
            let Some(entry) = list.arena.get(id) else {
                return Err(EngineError::invalid_state(format!(
                    "registry `{}` has no live entry {id}",
                    inner.name
                )));
            };
            if entry.tasklet.is_current_runner() {
                return Err(EngineError::invalid_state(format!(
                    "entry {id} cannot retire itself from its handler"
                )));
            }
            list.arena.unlink(id.index as usize)
        };

        if let Some(entry) = entry {
            if let Err(e) = entry.tasklet.kill() {
                warn!(registry = %inner.name, entry = %id, error = %e, "retire kill failed");
            }
        }
        inner.list.lock().arena.release(id.index as usize);
        inner.drained.notify_all();

        debug!(registry = %inner.name, entry = %id, "tracked entry retired");
        audit::record(inner.audit(), &inner.name, AuditAction::Retire, Some(id.to_string()));
        Ok(())
    }

    /// Kill every live entry's tasklet and release the pool.
    ///
    /// Slots still draining under a concurrent [`retire`](Self::retire) are
    /// waited for before the pool is released.
    ///
    /// # Errors
    ///
    /// `InvalidState` on a second teardown or when called from one of the
    /// registry's own handlers.
    pub fn teardown(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let indices: Vec<usize> = {
            let mut list = inner.list.lock();
            if list.torn_down {
                return Err(EngineError::invalid_state(format!(
                    "registry `{}` already torn down",
                    inner.name
                )));
            }
            let self_call = list.arena.slots.iter().any(|slot| {
                matches!(slot, Slot::Live { entry, .. } if entry.tasklet.is_current_runner())
            });
            if self_call {
                return Err(EngineError::invalid_state(format!(
                    "registry `{}` cannot be torn down from its own handler",
                    inner.name
                )));
            }
            list.torn_down = true;
            list.arena
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| matches!(slot, Slot::Live { .. }))
                .map(|(index, _)| index)
                .collect()
        };

        let mut killed = 0_usize;
        for index in indices {
            // None means a concurrent retire owns the slot and releases it.
            let Some(entry) = inner.list.lock().arena.unlink(index) else {
                continue;
            };
            if let Err(e) = entry.tasklet.kill() {
                warn!(registry = %inner.name, error = %e, "teardown kill failed");
            }
            killed += 1;
            inner.list.lock().arena.release(index);
        }

        {
            let mut list = inner.list.lock();
            while list.arena.has_draining() {
                inner.drained.wait(&mut list);
            }
            list.arena.slots = Vec::new();
            list.arena.free = Vec::new();
        }

        info!(registry = %inner.name, killed, "task registry torn down");
        audit::record(
            inner.audit(),
            &inner.name,
            AuditAction::Teardown,
            Some(format!("killed={killed}")),
        );
        Ok(())
    }

    /// Whether [`teardown`](Self::teardown) has been called.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.inner.list.lock().torn_down
    }
}

/// Type-erased registry view used by the engine for reporting and teardown.
pub(crate) trait ManagedRegistry: Send + Sync {
    fn snapshot(&self) -> RegistryStats;
    fn teardown(&self) -> Result<(), EngineError>;
    fn is_torn_down(&self) -> bool;
}

impl<P: Send + Sync + 'static> ManagedRegistry for TaskRegistry<P> {
    fn snapshot(&self) -> RegistryStats {
        Self::snapshot(self)
    }

    fn teardown(&self) -> Result<(), EngineError> {
        Self::teardown(self)
    }

    fn is_torn_down(&self) -> bool {
        Self::is_torn_down(self)
    }
}
