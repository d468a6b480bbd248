//! Monitoring events.
//!
//! After each execution with lifecycle significance the worker broadcasts a
//! [`TaskEvent`] to every subscribed [`TaskMonitor`], fire-and-forget: task
//! completion never waits on a monitor, and subscriber errors are logged and
//! dropped.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::TaskExecutionLog;

/// Severity of a monitoring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventSeverity {
    Information,
    Warning,
    Error,
}

/// Structured notification emitted after an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: Uuid,
    pub event_date_utc: DateTime<Utc>,
    pub severity: TaskEventSeverity,
    pub task_type: String,
    pub task_handler_type: String,
    /// The serialized request payload.
    pub task_parameters: String,
    pub message: String,
    pub exception: Option<String>,
    /// Captured handler logs, when persistent logging is enabled.
    pub execution_logs: Option<Vec<TaskExecutionLog>>,
}

/// A monitoring subscriber.
#[async_trait::async_trait]
pub trait TaskMonitor: Send + Sync {
    async fn on_task_event(&self, event: TaskEvent) -> anyhow::Result<()>;
}

/// Broadcast hub for [`TaskEvent`]s.
#[derive(Default)]
pub struct MonitorHub {
    subscribers: RwLock<Vec<Arc<dyn TaskMonitor>>>,
}

impl MonitorHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, monitor: Arc<dyn TaskMonitor>) {
        self.subscribers
            .write()
            .expect("monitor hub poisoned")
            .push(monitor);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("monitor hub poisoned").len()
    }

    /// Broadcast `event` to every subscriber without awaiting any of them.
    pub fn publish(&self, event: TaskEvent) {
        let subscribers = self
            .subscribers
            .read()
            .expect("monitor hub poisoned")
            .clone();

        for subscriber in subscribers {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(error) = subscriber.on_task_event(event).await {
                    tracing::warn!(error = %error, "task monitor subscriber failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    struct CountingMonitor {
        seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TaskMonitor for CountingMonitor {
        async fn on_task_event(&self, _event: TaskEvent) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingMonitor;

    #[async_trait::async_trait]
    impl TaskMonitor for FailingMonitor {
        async fn on_task_event(&self, _event: TaskEvent) -> anyhow::Result<()> {
            anyhow::bail!("monitor down")
        }
    }

    fn sample_event() -> TaskEvent {
        TaskEvent {
            task_id: Uuid::now_v7(),
            event_date_utc: Utc::now(),
            severity: TaskEventSeverity::Information,
            task_type: "test_task".to_string(),
            task_handler_type: "TestHandler".to_string(),
            task_parameters: "{}".to_string(),
            message: "completed".to_string(),
            exception: None,
            execution_logs: None,
        }
    }

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let hub = MonitorHub::new();
        let a = Arc::new(CountingMonitor {
            seen: AtomicUsize::new(0),
        });
        let b = Arc::new(CountingMonitor {
            seen: AtomicUsize::new(0),
        });
        hub.subscribe(a.clone());
        hub.subscribe(b.clone());
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(sample_event());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(a.seen.load(Ordering::SeqCst), 1);
        assert_eq!(b.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_block_others() {
        let hub = MonitorHub::new();
        let counting = Arc::new(CountingMonitor {
            seen: AtomicUsize::new(0),
        });
        hub.subscribe(Arc::new(FailingMonitor));
        hub.subscribe(counting.clone());

        hub.publish(sample_event());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(counting.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_serializes_for_transport() {
        let json = serde_json::to_string(&sample_event()).unwrap();
        assert!(json.contains("information"));
        assert!(json.contains("test_task"));
    }
}
