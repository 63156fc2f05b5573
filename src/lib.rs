//! # Prometheus Deferred
//!
//! A deferred-task execution engine: short callbacks, blocking-capable work
//! queues, timer-driven delayed work and a bounded registry of tracked tasks.
//!
//! ## Execution tiers
//!
//! - **Tasklets** run on the fast tier: a two-level run queue (`hi` ahead of
//!   `normal`) drained by dispatcher threads. Handlers must not block.
//!   A nestable disable count holds schedules back; `kill` is terminal.
//! - **Work queues** run on the slow tier: FIFO queues drained either by
//!   dedicated worker threads or by the engine's shared pool. Handlers may
//!   block. `cancel_sync` guarantees the item is neither queued nor running
//!   when it returns.
//! - **Delayed work** arms a timer; on expiry the timer thread schedules the
//!   target tasklet or submits the target work item.
//! - **Task registries** allocate tracked tasklets from a fixed pool and keep
//!   counters plus a scanned pending count for observers.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prometheus_deferred::config::EngineConfig;
//! use prometheus_deferred::core::{Engine, WorkItem};
//! use std::time::Duration;
//!
//! let engine = Engine::new(EngineConfig::default().with_fast_threads(2))?;
//!
//! let rx = engine.tasklet("rx-complete", |_t| Ok(()))?;
//! rx.schedule()?;
//!
//! let io = engine.create_queue("io")?;
//! let item = WorkItem::new("sync-disk", |_item| Ok(()));
//! io.submit(&item)?;
//!
//! let poll = engine.delayed_work("poll", &io, |dw| {
//!     dw.schedule_after(Duration::from_millis(100))?;
//!     Ok(())
//! })?;
//! poll.schedule_after(Duration::from_millis(100))?;
//!
//! poll.cancel_sync();
//! item.cancel_sync();
//! rx.kill()?;
//! engine.teardown()?;
//! ```
//!
//! ## Caller protocol
//!
//! Destroying a queue does not drain it and tearing down the engine does not
//! wait for pending work. Cancel delayed work before its target, cancel items
//! before their queue, and kill tasklets before the run queue stops.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Configuration models for the engine and its queues.
pub mod config;
/// Deferred execution primitives and the engine.
pub mod core;
/// Builders to construct engines and queue sets from configuration.
pub mod builders;
/// Observer API surface and runtime adapters.
pub mod runtime;
/// Shared utilities.
pub mod util;
