//! Retention cleanup
//!
//! Periodically deletes analytics events and failure patterns older than
//! their configured horizons. Event deletion is paged so no single
//! transaction grows with the backlog.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weft_core::clock::{Clock, SharedClock};
use weft_core::config::AnalyticsConfig;

use crate::persistence::{StoreError, WorkflowStore};

/// Periodic retention cleaner
pub struct RetentionCleaner {
    store: Arc<dyn WorkflowStore>,
    config: AnalyticsConfig,
    clock: SharedClock,
}

impl RetentionCleaner {
    pub fn new(store: Arc<dyn WorkflowStore>, config: AnalyticsConfig, clock: SharedClock) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Run sweeps until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            retention_days = self.config.retention_days,
            failure_retention_days = self.config.failure_retention_days,
            "retention cleaner started"
        );

        loop {
            tokio::select! {
                _ = self.clock.sleep(self.config.cleaner_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!("retention sweep failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!("retention cleaner stopped");
    }

    /// One sweep; returns (events deleted, failures deleted, workflows deleted)
    pub async fn sweep(&self) -> Result<(u64, u64, u64), StoreError> {
        let now = self.clock.now();
        let event_cutoff = now - chrono::Duration::days(self.config.retention_days as i64);
        let failure_cutoff =
            now - chrono::Duration::days(self.config.failure_retention_days as i64);
        let workflow_cutoff =
            now - chrono::Duration::days(self.config.workflow_retention_days as i64);

        let mut events_deleted = 0u64;
        loop {
            let page = self
                .store
                .delete_events_before(event_cutoff, self.config.cleaner_page_size)
                .await?;
            events_deleted += page;
            if page == 0 {
                break;
            }
        }

        let failures_deleted = self.store.delete_failures_before(failure_cutoff).await?;

        // Terminal workflows past their horizon go too, tasks and
        // checkpoints with them, paged like the event deletes.
        let mut workflows_deleted = 0u64;
        loop {
            let page = self
                .store
                .delete_terminal_workflows_before(workflow_cutoff, self.config.cleaner_page_size)
                .await?;
            workflows_deleted += page;
            if page == 0 {
                break;
            }
        }

        if events_deleted > 0 || failures_deleted > 0 || workflows_deleted > 0 {
            debug!(
                events_deleted,
                failures_deleted, workflows_deleted, "retention sweep"
            );
        }
        Ok((events_deleted, failures_deleted, workflows_deleted))
    }
}
