//! Timer service: one thread firing one-shot callbacks at their deadlines.
//!
//! Entries live in a `BinaryHeap` ordered as a min-heap on `(deadline, seq)`.
//! Disarming removes the callback; the heap entry goes stale and is skipped
//! when it surfaces. Once stale entries outnumber armed ones the heap is
//! rebuilt, so it holds at most `2 * armed + COMPACT_FLOOR` entries.
//! Callbacks run on the timer thread without the timer lock held and must
//! not block.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::executor::execute_guarded;
use super::EngineError;

/// Identifier of an armed timer.
pub type TimerId = u64;

type TimerCallback = Box<dyn FnOnce(TimerId) + Send>;

/// Stale entries tolerated before a disarm compacts the heap.
const COMPACT_FLOOR: usize = 64;

/// A scheduled expiry in the timer heap.
struct TimerEntry {
    deadline: Instant,
    seq: TimerId,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Ord for TimerEntry {
    /// Reversed so the heap pops the earliest deadline first; ties fire in
    /// arming order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Timer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerStats {
    /// Timers currently armed.
    pub armed: usize,
    /// Callbacks fired since start.
    pub fired: u64,
    /// Timers disarmed before expiry.
    pub disarmed: u64,
    /// Heap entries, stale ones included.
    pub heap_entries: usize,
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    armed: HashMap<TimerId, TimerCallback>,
    next_seq: TimerId,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    changed: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    fired: AtomicU64,
    disarmed: AtomicU64,
}

/// Handle to the timer thread. Cloning yields another handle to the same service.
#[derive(Clone)]
pub struct TimerService {
    shared: Arc<TimerShared>,
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("stats", &self.stats())
            .finish()
    }
}

impl TimerService {
    /// Start the timer thread.
    ///
    /// # Errors
    ///
    /// `AllocationFailure` if the thread cannot be spawned.
    pub fn start() -> Result<Self, EngineError> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                armed: HashMap::new(),
                next_seq: 1,
                shutdown: false,
            }),
            changed: Condvar::new(),
            thread: Mutex::new(None),
            fired: AtomicU64::new(0),
            disarmed: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("deferred-timer".into())
            .spawn(move || timer_loop(&worker))
            .map_err(|e| EngineError::AllocationFailure(format!("failed to spawn timer thread: {e}")))?;
        *shared.thread.lock() = Some(handle);

        info!("timer service started");
        Ok(Self { shared })
    }

    /// Arm a one-shot timer that calls `callback` with its id once `delay`
    /// has elapsed.
    ///
    /// # Errors
    ///
    /// `InvalidState` after [`shutdown`](Self::shutdown).
    pub fn arm<F>(&self, delay: Duration, callback: F) -> Result<TimerId, EngineError>
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        let mut st = self.shared.state.lock();
        if st.shutdown {
            return Err(EngineError::invalid_state("timer service is shut down"));
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        let deadline = Instant::now() + delay;
        let earliest = st.heap.peek().map_or(true, |head| deadline < head.deadline);
        st.heap.push(TimerEntry { deadline, seq });
        st.armed.insert(seq, Box::new(callback));
        drop(st);

        if earliest {
            self.shared.changed.notify_one();
        }
        debug!(timer = seq, delay_ms = delay.as_millis() as u64, "timer armed");
        Ok(seq)
    }

    /// Disarm a timer. Returns false if it already fired or was disarmed.
    pub fn disarm(&self, id: TimerId) -> bool {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        if st.armed.remove(&id).is_none() {
            return false;
        }
        let stale = st.heap.len().saturating_sub(st.armed.len());
        if stale > st.armed.len() + COMPACT_FLOOR {
            st.heap.retain(|entry| st.armed.contains_key(&entry.seq));
            debug!(stale, remaining = st.heap.len(), "timer heap compacted");
        }
        drop(guard);
        self.shared.disarmed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> TimerStats {
        let st = self.shared.state.lock();
        TimerStats {
            armed: st.armed.len(),
            fired: self.shared.fired.load(Ordering::Relaxed),
            disarmed: self.shared.disarmed.load(Ordering::Relaxed),
            heap_entries: st.heap.len(),
        }
    }

    /// Disarm every timer and join the timer thread. Idempotent.
    pub fn shutdown(&self) {
        let dropped = {
            let mut st = self.shared.state.lock();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
            st.heap.clear();
            let dropped = st.armed.len();
            st.armed.clear();
            dropped
        };
        self.shared.changed.notify_all();

        if dropped > 0 {
            warn!(dropped, "timer service shut down with armed timers");
        }
        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
        info!("timer service shut down");
    }
}

fn timer_loop(shared: &Arc<TimerShared>) {
    debug!("timer thread started");
    loop {
        let (seq, callback) = {
            let mut st = shared.state.lock();
            loop {
                if st.shutdown {
                    debug!("timer thread exiting");
                    return;
                }
                let Some(head) = st.heap.peek() else {
                    shared.changed.wait(&mut st);
                    continue;
                };
                let deadline = head.deadline;
                if deadline > Instant::now() {
                    let _ = shared.changed.wait_until(&mut st, deadline);
                    continue;
                }
                let Some(entry) = st.heap.pop() else { continue };
                // Stale: disarmed after being pushed.
                if let Some(cb) = st.armed.remove(&entry.seq) {
                    break (entry.seq, cb);
                }
            }
        };

        shared.fired.fetch_add(1, Ordering::Relaxed);
        if let Err(msg) = execute_guarded(|| {
            callback(seq);
            Ok(())
        }) {
            error!(timer = seq, error = %msg, "timer callback failed");
        }
    }
}
