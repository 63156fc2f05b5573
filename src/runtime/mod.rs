//! Observer API surface and the optional Tokio bridge.

pub mod api;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_bridge;

pub use api::{health, health_from_report, list_queues, report_json, Health, QueueSnapshot};
#[cfg(feature = "tokio-runtime")]
pub use tokio_bridge::TokioBridge;
