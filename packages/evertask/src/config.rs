//! Runtime configuration.
//!
//! Global defaults plus optional per-queue overrides. Effective values are
//! resolved handler override > queue override > global default.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::model::{AuditLevel, LogLevel};
use crate::retry::{LinearRetryPolicy, RetryPolicy};

/// Behaviour of an enqueue against a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullMode {
    /// Producer waits until a consumer frees a slot.
    #[default]
    Wait,
    /// The write is logged and dropped.
    DropWrite,
    /// The oldest queued item is removed to make room.
    DropOldest,
    /// The write spills to the default queue, waiting there if needed.
    FallbackToDefault,
}

/// Persistent handler-log capture options.
#[derive(Debug, Clone)]
pub struct PersistentLoggerConfig {
    /// Persist captured handler logs to storage after each run.
    pub enabled: bool,
    /// Minimum level captured into the buffer.
    pub minimum_level: LogLevel,
    /// Cap per execution; oldest lines are dropped beyond it.
    pub max_logs_per_task: usize,
}

impl Default for PersistentLoggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            minimum_level: LogLevel::Information,
            max_logs_per_task: 500,
        }
    }
}

/// Overrides for one named queue. Unset fields inherit the global defaults.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    pub capacity: Option<usize>,
    pub full_mode: Option<FullMode>,
    pub max_degree_of_parallelism: Option<usize>,
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub timeout: Option<Duration>,
    pub audit_level: Option<AuditLevel>,
}

impl QueueConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_full_mode(mut self, mode: FullMode) -> Self {
        self.full_mode = Some(mode);
        self
    }

    pub fn with_max_degree_of_parallelism(mut self, parallelism: usize) -> Self {
        self.max_degree_of_parallelism = Some(parallelism);
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_audit_level(mut self, level: AuditLevel) -> Self {
        self.audit_level = Some(level);
        self
    }
}

/// Global runtime configuration.
#[derive(Debug, Clone)]
pub struct EverTaskConfig {
    /// Bound of the default queue.
    pub channel_capacity: usize,
    /// Full-queue behaviour of the default queue.
    pub channel_full_mode: FullMode,
    /// Worker concurrency per queue.
    pub max_degree_of_parallelism: usize,
    /// Fallback retry policy when neither handler nor queue overrides one.
    pub default_retry_policy: Arc<dyn RetryPolicy>,
    /// Fallback per-attempt timeout; `None` means no timeout.
    pub default_timeout: Option<Duration>,
    /// Propagate persistence failures to the dispatching caller.
    pub throw_if_unable_to_persist: bool,
    /// Fallback audit level.
    pub default_audit_level: AuditLevel,
    /// Persistent handler-log capture.
    pub persistent_logger: PersistentLoggerConfig,
    /// Named queues with per-queue overrides.
    pub queues: HashMap<String, QueueConfig>,
    /// How long shutdown waits for in-flight tasks before detaching them.
    pub shutdown_grace: Duration,
}

impl Default for EverTaskConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            channel_capacity: (cpus * 500).max(1000),
            channel_full_mode: FullMode::Wait,
            max_degree_of_parallelism: cpus.max(4),
            default_retry_policy: Arc::new(LinearRetryPolicy::default()),
            default_timeout: None,
            throw_if_unable_to_persist: true,
            default_audit_level: AuditLevel::Full,
            persistent_logger: PersistentLoggerConfig::default(),
            queues: HashMap::new(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl EverTaskConfig {
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_channel_full_mode(mut self, mode: FullMode) -> Self {
        self.channel_full_mode = mode;
        self
    }

    pub fn with_max_degree_of_parallelism(mut self, parallelism: usize) -> Self {
        self.max_degree_of_parallelism = parallelism.max(1);
        self
    }

    pub fn with_default_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.default_retry_policy = policy;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_throw_if_unable_to_persist(mut self, throw: bool) -> Self {
        self.throw_if_unable_to_persist = throw;
        self
    }

    pub fn with_default_audit_level(mut self, level: AuditLevel) -> Self {
        self.default_audit_level = level;
        self
    }

    pub fn with_persistent_logger(mut self, config: PersistentLoggerConfig) -> Self {
        self.persistent_logger = config;
        self
    }

    /// Register or replace a named queue.
    pub fn with_queue(mut self, name: impl Into<String>, config: QueueConfig) -> Self {
        self.queues.insert(name.into(), config);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
