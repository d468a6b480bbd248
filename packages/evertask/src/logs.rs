//! Per-execution log capture.
//!
//! [`TaskLogger`] fans every line out to the process `tracing` subscriber
//! and, when persistent logging is enabled, into a bounded in-memory buffer
//! that the worker bulk-persists after the run. Sequence numbers are
//! monotonically increasing within one execution; when the buffer exceeds
//! its cap the oldest lines are dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::clock::Clock;
use crate::config::PersistentLoggerConfig;
use crate::error::render_error_chain;
use crate::model::{LogLevel, TaskExecutionLog};

/// Logger handed to a handler for the duration of one execution.
#[derive(Clone)]
pub struct TaskLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    task_id: Uuid,
    config: PersistentLoggerConfig,
    clock: Arc<dyn Clock>,
    next_sequence: AtomicI64,
    buffer: Mutex<VecDeque<TaskExecutionLog>>,
}

impl TaskLogger {
    pub(crate) fn new(
        task_id: Uuid,
        config: PersistentLoggerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                task_id,
                config,
                clock,
                next_sequence: AtomicI64::new(0),
                buffer: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// The task this logger is capturing for.
    pub fn task_id(&self) -> Uuid {
        self.inner.task_id
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message.as_ref(), None);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Information, message.as_ref(), None);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message.as_ref(), None);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message.as_ref(), None);
    }

    /// Record an error line with the rendered cause chain attached.
    pub fn error_with(&self, message: impl AsRef<str>, error: &anyhow::Error) {
        self.log(
            LogLevel::Error,
            message.as_ref(),
            Some(render_error_chain(error)),
        );
    }

    /// Record a line at an explicit level.
    pub fn log(&self, level: LogLevel, message: &str, exception_details: Option<String>) {
        let task_id = self.inner.task_id;
        match level {
            LogLevel::Debug => tracing::debug!(task_id = %task_id, "{message}"),
            LogLevel::Information => tracing::info!(task_id = %task_id, "{message}"),
            LogLevel::Warning => tracing::warn!(task_id = %task_id, "{message}"),
            LogLevel::Error => tracing::error!(task_id = %task_id, "{message}"),
        }

        if !self.inner.config.enabled || level < self.inner.config.minimum_level {
            return;
        }

        let entry = TaskExecutionLog {
            id: 0,
            task_id,
            timestamp_utc: self.inner.clock.now(),
            level,
            message: message.to_string(),
            exception_details,
            sequence_number: self.inner.next_sequence.fetch_add(1, Ordering::SeqCst),
        };

        let mut buffer = self.inner.buffer.lock().expect("log buffer poisoned");
        buffer.push_back(entry);
        while buffer.len() > self.inner.config.max_logs_per_task {
            buffer.pop_front();
        }
    }

    /// Take the captured lines, in sequence order.
    pub(crate) fn drain(&self) -> Vec<TaskExecutionLog> {
        let mut buffer = self.inner.buffer.lock().expect("log buffer poisoned");
        buffer.drain(..).collect()
    }
}
