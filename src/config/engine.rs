//! Engine and work queue configuration.
//!
//! Configuration is resolved in this order, highest priority first:
//!
//! 1. **Programmatic**: `with_*` builder methods
//! 2. **Environment**: `DEFERRED_*` variables (a `.env` file is loaded first)
//! 3. **Defaults**: [`EngineConfig::default()`], thread counts from `num_cpus`
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `DEFERRED_FAST_THREADS` | `usize` | `fast_threads` |
//! | `DEFERRED_SHARED_WORKERS` | `usize` | `shared_workers` |
//! | `DEFERRED_WORKER_COUNT` | `usize` | `worker_count` |
//! | `DEFERRED_POOL_CAPACITY` | `usize` | `pool_capacity` |
//! | `DEFERRED_QUEUE_MODE` | `shared`/`dedicated` | `queue_mode` |
//! | `DEFERRED_PRIORITY_ENABLED` | `bool` | `priority_enabled` |
//! | `DEFERRED_QUEUE_CAPACITY` | `usize` | `queue_capacity` |
//! | `DEFERRED_MAX_RESCHEDULE_DEPTH` | `u32` | `max_reschedule_depth` |

use serde::{Deserialize, Serialize};

/// Environment variable for the tasklet dispatcher count.
pub const ENV_FAST_THREADS: &str = "DEFERRED_FAST_THREADS";
/// Environment variable for the shared worker pool size.
pub const ENV_SHARED_WORKERS: &str = "DEFERRED_SHARED_WORKERS";
/// Environment variable for dedicated workers per queue.
pub const ENV_WORKER_COUNT: &str = "DEFERRED_WORKER_COUNT";
/// Environment variable for registry slot capacity.
pub const ENV_POOL_CAPACITY: &str = "DEFERRED_POOL_CAPACITY";
/// Environment variable for the default queue mode.
pub const ENV_QUEUE_MODE: &str = "DEFERRED_QUEUE_MODE";
/// Environment variable toggling the hi tier for priority registry entries.
pub const ENV_PRIORITY_ENABLED: &str = "DEFERRED_PRIORITY_ENABLED";
/// Environment variable bounding queue length.
pub const ENV_QUEUE_CAPACITY: &str = "DEFERRED_QUEUE_CAPACITY";
/// Environment variable bounding consecutive self re-arms of delayed work.
pub const ENV_MAX_RESCHEDULE_DEPTH: &str = "DEFERRED_MAX_RESCHEDULE_DEPTH";

/// How engine-created work queues obtain their workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Drained by the engine's shared worker pool.
    Shared,
    /// Each queue owns `worker_count` threads.
    Dedicated,
}

impl std::str::FromStr for QueueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "dedicated" => Ok(Self::Dedicated),
            other => Err(format!("unknown queue mode `{other}`")),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tasklet dispatcher threads (the fast tier).
    pub fast_threads: usize,
    /// Threads of the shared worker pool.
    pub shared_workers: usize,
    /// Workers per dedicated queue created with [`QueueMode::Dedicated`].
    pub worker_count: usize,
    /// Slot capacity of each task registry.
    pub pool_capacity: usize,
    /// Mode of queues created through `Engine::create_queue`.
    pub queue_mode: QueueMode,
    /// Route priority registry entries to the hi tier.
    pub priority_enabled: bool,
    /// Bound on queued items per engine-created queue; `None` is unbounded.
    pub queue_capacity: Option<usize>,
    /// Bound on consecutive self re-arms of delayed work; `None` disables it.
    pub max_reschedule_depth: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            fast_threads: cpus,
            shared_workers: cpus,
            worker_count: 1,
            pool_capacity: 64,
            queue_mode: QueueMode::Dedicated,
            priority_enabled: true,
            queue_capacity: None,
            max_reschedule_depth: None,
        }
    }
}

impl EngineConfig {
    /// Configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tasklet dispatcher count.
    #[must_use]
    pub const fn with_fast_threads(mut self, n: usize) -> Self {
        self.fast_threads = n;
        self
    }

    /// Set the shared pool size.
    #[must_use]
    pub const fn with_shared_workers(mut self, n: usize) -> Self {
        self.shared_workers = n;
        self
    }

    /// Set workers per dedicated queue.
    #[must_use]
    pub const fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    /// Set registry slot capacity.
    #[must_use]
    pub const fn with_pool_capacity(mut self, n: usize) -> Self {
        self.pool_capacity = n;
        self
    }

    /// Set the default queue mode.
    #[must_use]
    pub const fn with_queue_mode(mut self, mode: QueueMode) -> Self {
        self.queue_mode = mode;
        self
    }

    /// Enable or disable hi-tier routing of priority registry entries.
    #[must_use]
    pub const fn with_priority_enabled(mut self, enabled: bool) -> Self {
        self.priority_enabled = enabled;
        self
    }

    /// Bound engine-created queues.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Bound consecutive self re-arms of delayed work.
    #[must_use]
    pub const fn with_max_reschedule_depth(mut self, depth: u32) -> Self {
        self.max_reschedule_depth = Some(depth);
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.fast_threads == 0 {
            return Err("fast_threads must be greater than 0".into());
        }
        if self.shared_workers == 0 {
            return Err("shared_workers must be greater than 0".into());
        }
        if self.pool_capacity == 0 {
            return Err("pool_capacity must be greater than 0".into());
        }
        if self.queue_mode == QueueMode::Dedicated && self.worker_count == 0 {
            return Err("worker_count must be greater than 0 in dedicated mode".into());
        }
        if self.queue_capacity == Some(0) {
            return Err("queue_capacity must be greater than 0 when set".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate. Missing fields
    /// take their defaults.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `DEFERRED_*` variables, after loading a `.env`
    /// file from the working directory if one exists.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        cfg.apply_overrides(lookup)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_FAST_THREADS) {
            self.fast_threads = parse_num(ENV_FAST_THREADS, &val)?;
        }
        if let Some(val) = lookup(ENV_SHARED_WORKERS) {
            self.shared_workers = parse_num(ENV_SHARED_WORKERS, &val)?;
        }
        if let Some(val) = lookup(ENV_WORKER_COUNT) {
            self.worker_count = parse_num(ENV_WORKER_COUNT, &val)?;
        }
        if let Some(val) = lookup(ENV_POOL_CAPACITY) {
            self.pool_capacity = parse_num(ENV_POOL_CAPACITY, &val)?;
        }
        if let Some(val) = lookup(ENV_QUEUE_MODE) {
            self.queue_mode = val
                .parse()
                .map_err(|e| format!("invalid value for {ENV_QUEUE_MODE}: {e}"))?;
        }
        if let Some(val) = lookup(ENV_PRIORITY_ENABLED) {
            self.priority_enabled = parse_bool(ENV_PRIORITY_ENABLED, &val)?;
        }
        if let Some(val) = lookup(ENV_QUEUE_CAPACITY) {
            self.queue_capacity = Some(parse_num(ENV_QUEUE_CAPACITY, &val)?);
        }
        if let Some(val) = lookup(ENV_MAX_RESCHEDULE_DEPTH) {
            self.max_reschedule_depth = Some(parse_num(ENV_MAX_RESCHEDULE_DEPTH, &val)?);
        }
        Ok(())
    }

    /// Queue configuration used by `Engine::create_queue`.
    #[must_use]
    pub fn queue_config(&self, name: impl Into<String>) -> WorkQueueConfig {
        let base = match self.queue_mode {
            QueueMode::Shared => WorkQueueConfig::shared(name),
            QueueMode::Dedicated => WorkQueueConfig::dedicated(name, self.worker_count),
        };
        WorkQueueConfig {
            capacity: self.queue_capacity,
            ..base
        }
    }
}

fn parse_num<T>(var_name: &str, val: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    val.trim().parse::<T>().map_err(|e| {
        format!("invalid value for {var_name}: expected unsigned integer, got {val:?} ({e})")
    })
}

fn parse_bool(var_name: &str, val: &str) -> Result<bool, String> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(format!(
            "invalid value for {var_name}: expected bool (true/false/1/0/yes/no), got {val:?}"
        )),
    }
}

/// Configuration of a single work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueConfig {
    /// Queue name; also the worker thread name prefix.
    pub name: String,
    /// Dedicated worker threads; 0 attaches the queue to the shared pool.
    pub worker_count: usize,
    /// Maximum queued items; `None` is unbounded.
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl WorkQueueConfig {
    /// Queue with `worker_count` dedicated threads.
    #[must_use]
    pub fn dedicated(name: impl Into<String>, worker_count: usize) -> Self {
        Self {
            name: name.into(),
            worker_count,
            capacity: None,
        }
    }

    /// Queue drained by the shared worker pool.
    #[must_use]
    pub fn shared(name: impl Into<String>) -> Self {
        Self::dedicated(name, 0)
    }

    /// Bound the queue length.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Whether the queue is drained by the shared pool.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.worker_count == 0
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("queue name must not be empty".into());
        }
        if self.capacity == Some(0) {
            return Err(format!("queue `{}`: capacity must be greater than 0", self.name));
        }
        Ok(())
    }
}
