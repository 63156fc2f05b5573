//! Configuration models for the engine and its work queues.

pub mod engine;

pub use engine::{EngineConfig, QueueMode, WorkQueueConfig};
