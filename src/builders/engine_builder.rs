//! Builders to construct an engine and its queues from configuration.

use std::collections::HashMap;

use crate::config::{EngineConfig, WorkQueueConfig};
use crate::core::{AuditSink, Engine, EngineError, WorkQueue};

/// Start an engine, optionally recording to `audit`.
pub fn build_engine(
    cfg: EngineConfig,
    audit: Option<Box<dyn AuditSink>>,
) -> Result<Engine, EngineError> {
    cfg.validate()
        .map_err(|e| EngineError::InvalidConfig(format!("config invalid: {e}")))?;
    match audit {
        Some(sink) => Engine::with_audit(cfg, BoxedSink(sink)),
        None => Engine::new(cfg),
    }
}

/// Parse a JSON configuration and start an engine without an audit sink.
pub fn build_engine_from_json(input: &str) -> Result<Engine, EngineError> {
    let cfg = EngineConfig::from_json_str(input).map_err(EngineError::InvalidConfig)?;
    Engine::new(cfg)
}

/// Create one engine-owned queue per configuration, keyed by name.
///
/// Names must be unique. On error, queues created so far stay owned by the
/// engine and are destroyed at its teardown.
pub fn build_queues(
    engine: &Engine,
    configs: &[WorkQueueConfig],
) -> Result<HashMap<String, WorkQueue>, EngineError> {
    let mut queues = HashMap::with_capacity(configs.len());
    for cfg in configs {
        if queues.contains_key(&cfg.name) {
            return Err(EngineError::InvalidConfig(format!(
                "duplicate queue name `{}`",
                cfg.name
            )));
        }
        let queue = engine.create_queue_with(cfg.clone())?;
        queues.insert(cfg.name.clone(), queue);
    }
    Ok(queues)
}

/// Adapter so a boxed sink can be handed to [`Engine::with_audit`].
struct BoxedSink(Box<dyn AuditSink>);

impl AuditSink for BoxedSink {
    fn record(&mut self, event: crate::core::AuditEvent) {
        self.0.record(event);
    }
}
