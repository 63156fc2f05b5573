//! Shared worker pool draining work queues created without dedicated workers.
//!
//! Every submission to a shared-mode [`WorkQueue`](crate::core::WorkQueue)
//! sends one wake token over a `crossbeam-channel`. A pool thread receiving
//! the token pops the head of that queue and runs it, so dequeue order stays
//! FIFO per queue while any number of queues share the same threads.
//!
//! # Design Principles
//!
//! - **No polling**: workers block on channel `recv`
//! - **Clean shutdown**: one `Stop` message per worker, then join
//! - **Lock-free counters**: atomics for statistics

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::work_queue::QueueShared;
use super::EngineError;

/// Statistics about shared pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,

    /// Handlers currently executing on pool threads.
    pub active_tasks: u64,

    /// Handlers completed on pool threads.
    pub completed_tasks: u64,

    /// Wake tokens received.
    pub wakeups: u64,

    /// Wake tokens that found nothing to run (item cancelled or queue gone).
    pub empty_wakeups: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub wakeups: AtomicU64,
    pub empty_wakeups: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            empty_wakeups: self.empty_wakeups.load(Ordering::Relaxed),
        }
    }
}

/// Message delivered to pool workers.
pub(crate) enum PoolMessage {
    /// Run the head item of this queue, if any.
    Run(Arc<QueueShared>),
    /// Exit the worker loop.
    Stop,
}

/// Process-wide pool of blocking-capable worker threads.
pub struct SharedWorkerPool {
    tx: Sender<PoolMessage>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    counters: Arc<PoolCounters>,
    shutdown: AtomicBool,
}

impl SharedWorkerPool {
    /// Spawn `worker_count` pool threads.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for zero workers, `AllocationFailure` if a thread
    /// cannot be spawned.
    pub fn start(worker_count: usize) -> Result<Arc<Self>, EngineError> {
        if worker_count == 0 {
            return Err(EngineError::InvalidConfig(
                "shared pool needs at least one worker".into(),
            ));
        }
        let (tx, rx) = unbounded::<PoolMessage>();
        let counters = Arc::new(PoolCounters::default());
        let pool = Arc::new(Self {
            tx,
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            worker_count,
            counters: Arc::clone(&counters),
            shutdown: AtomicBool::new(false),
        });

        for worker_id in 0..worker_count {
            match spawn_worker(worker_id, rx.clone(), Arc::clone(&counters)) {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(EngineError::AllocationFailure(format!(
                        "failed to spawn shared worker {worker_id}: {e}"
                    )));
                }
            }
        }

        info!(worker_count, "shared worker pool initialized");
        Ok(pool)
    }

    /// Sender used by shared-mode queues to deliver wake tokens.
    pub(crate) fn sender(&self) -> Sender<PoolMessage> {
        self.tx.clone()
    }

    /// Number of pool threads.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.worker_count)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop every worker after the tokens already sent and join them.
    /// Idempotent; must not be called from a pool thread.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down shared worker pool");

        let mut workers = self.workers.lock();
        for _ in 0..workers.len() {
            let _ = self.tx.send(PoolMessage::Stop);
        }
        for (idx, worker) in workers.drain(..).enumerate() {
            if worker.join().is_err() {
                warn!(worker_id = idx, "shared worker panicked");
            } else {
                debug!(worker_id = idx, "shared worker joined");
            }
        }
        info!(worker_count = self.worker_count, "shared worker pool shut down");
    }
}

/// Spawn a pool worker thread.
fn spawn_worker(
    worker_id: usize,
    rx: Receiver<PoolMessage>,
    counters: Arc<PoolCounters>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("events-{worker_id}"))
        .spawn(move || {
            debug!(worker_id, "shared worker started");
            // Blocking recv; exits on Stop or when every sender is gone.
            while let Ok(PoolMessage::Run(queue)) = rx.recv() {
                counters.wakeups.fetch_add(1, Ordering::Relaxed);
                counters.active_tasks.fetch_add(1, Ordering::Relaxed);
                let ran = queue.run_one();
                counters.active_tasks.fetch_sub(1, Ordering::Relaxed);
                if ran {
                    counters.completed_tasks.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.empty_wakeups.fetch_add(1, Ordering::Relaxed);
                }
            }
            debug!(worker_id, "shared worker exiting");
        })
}
