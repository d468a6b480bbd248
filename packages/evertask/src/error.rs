//! Structured error types for the task runtime.
//!
//! [`TaskError`] provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Handler code stays on `anyhow` internally; the runtime
//! classifies what escapes into one of these kinds before it reaches a
//! caller, a status row, or a monitoring event.

use std::time::Duration;

use thiserror::Error;

/// Structured error type for runtime operations.
///
/// Submission errors (`ArgumentInvalid`, `HandlerMissing`, `InvalidSpec`,
/// `Persistence`) surface to the dispatching caller. Everything that happens
/// after a task is accepted surfaces only through the task's status, its
/// recorded exception, and monitoring events.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The submitted value cannot be dispatched as given.
    #[error("invalid task submission: {reason}")]
    ArgumentInvalid {
        /// What was wrong with the submission.
        reason: String,
    },

    /// No handler is registered for the task type.
    #[error("no handler registered for task type {task_type}")]
    HandlerMissing {
        /// The unresolved task type name.
        task_type: String,
    },

    /// The recurrence spec is malformed or can never produce a run.
    #[error("invalid recurrence spec: {reason}")]
    InvalidSpec {
        /// Why the spec was rejected.
        reason: String,
    },

    /// The storage layer failed to persist or update a task.
    #[error("storage operation failed: {source}")]
    Persistence {
        /// The underlying storage error.
        #[source]
        source: anyhow::Error,
    },

    /// The named queue is not registered.
    #[error("queue {name} is not registered")]
    QueueNotFound {
        /// The unknown queue name.
        name: String,
    },

    /// The queue has been closed by shutdown.
    #[error("queue {name} is closed")]
    QueueClosed {
        /// The closed queue name.
        name: String,
    },

    /// An execution attempt exceeded its configured timeout.
    #[error("task execution timed out after {duration:?}")]
    Timeout {
        /// The configured per-attempt limit.
        duration: Duration,
    },
}

impl TaskError {
    pub(crate) fn argument(reason: impl Into<String>) -> Self {
        TaskError::ArgumentInvalid {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_spec(reason: impl Into<String>) -> Self {
        TaskError::InvalidSpec {
            reason: reason.into(),
        }
    }

    /// Whether this error was an attempt timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }
}

/// Render an error and its source chain into the detailed textual form
/// persisted in the task's `exception` column.
pub fn render_error_chain(error: &anyhow::Error) -> String {
    let mut out = String::new();
    for (depth, cause) in error.chain().enumerate() {
        if depth == 0 {
            out.push_str(&cause.to_string());
        } else {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_pattern_matchable() {
        let err = TaskError::Timeout {
            duration: Duration::from_millis(200),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn timeout_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = TaskError::Timeout {
            duration: Duration::from_secs(1),
        }
        .into();

        let task_err = err.downcast_ref::<TaskError>();
        assert!(matches!(task_err, Some(TaskError::Timeout { .. })));
    }

    #[test]
    fn handler_missing_names_the_type() {
        let err = TaskError::HandlerMissing {
            task_type: "reports::Nightly".to_string(),
        };
        assert!(err.to_string().contains("reports::Nightly"));
    }

    #[test]
    fn render_error_chain_includes_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
        let err = anyhow::Error::new(io).context("flush failed");

        let rendered = render_error_chain(&err);
        assert!(rendered.contains("flush failed"));
        assert!(rendered.contains("caused by: connection reset"));
    }
}
