//! Startup recovery.
//!
//! Walks the keyset-paginated pending scan and re-dispatches every
//! resumable task under its existing id, so a restart resumes queued,
//! mid-flight and recurring work. A task whose stored payload no longer
//! deserializes is marked `Failed` and recovery continues.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::TaskError;
use crate::model::TaskStatus;
use crate::storage::TaskStorage;

const PAGE_SIZE: usize = 100;

pub(crate) struct RecoveryService {
    storage: Arc<dyn TaskStorage>,
    dispatcher: Dispatcher,
    audit_level: crate::model::AuditLevel,
}

impl RecoveryService {
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        dispatcher: Dispatcher,
        audit_level: crate::model::AuditLevel,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            audit_level,
        }
    }

    /// Resume every pending task. Individual failures never stop the scan.
    pub async fn run(&self) {
        let mut cursor: Option<(DateTime<Utc>, Uuid)> = None;
        let mut resumed = 0usize;
        let mut failed = 0usize;

        loop {
            let page = match self
                .storage
                .retrieve_pending(cursor.map(|c| c.0), cursor.map(|c| c.1), PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(error) => {
                    warn!(error = %error, "recovery scan failed, aborting");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }

            for task in &page {
                match self.dispatcher.dispatch_existing(task).await {
                    Ok(_) => {
                        resumed += 1;
                        debug!(task_id = %task.id, task_type = %task.task_type, "task resumed");
                    }
                    Err(error) => {
                        failed += 1;
                        warn!(
                            task_id = %task.id,
                            task_type = %task.task_type,
                            error = %error,
                            "task could not be resumed"
                        );
                        self.mark_failed(task.id, &error).await;
                    }
                }
            }

            cursor = page.last().map(|t| (t.created_at_utc, t.id));
        }

        if resumed > 0 || failed > 0 {
            info!(resumed, failed, "startup recovery finished");
        }
    }

    async fn mark_failed(&self, id: Uuid, error: &TaskError) {
        if let Err(storage_error) = self
            .storage
            .set_status(
                id,
                TaskStatus::Failed,
                Some(format!("recovery failed: {error}")),
                self.audit_level,
            )
            .await
        {
            warn!(task_id = %id, error = %storage_error, "failed to mark unrecoverable task");
        }
    }
}
