//! Builders to construct engines and queue sets from configuration.

pub mod engine_builder;

pub use engine_builder::{build_engine, build_engine_from_json, build_queues};
