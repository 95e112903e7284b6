//! Retrying decorator for the persistence port
//!
//! Database-level failures are retried a bounded number of times with capped
//! backoff. When the budget is exhausted the decorator fires its fatal
//! signal - the node is expected to drop its heartbeat and exit so another
//! node takes over. Semantic errors (not-found, illegal transition,
//! conflict) pass through untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use weft_core::clock::{Clock, SharedClock};
use weft_core::model::{
    AnalyticsEvent, Checkpoint, FailurePattern, ResolutionStatus, TaskStatus, WorkflowRecord,
    WorkflowStatus,
};

use super::store::{StoreError, TaskTransition, WorkflowStore};

/// Backoff before retry `attempt` (1-based), capped at 10 seconds
fn backoff(attempt: u32) -> Duration {
    let secs = 0.5 * 2f64.powi(attempt.saturating_sub(1).min(8) as i32);
    Duration::from_secs_f64(secs.min(10.0))
}

/// Bounded-retry wrapper around any [`WorkflowStore`]
pub struct RetryingStore {
    inner: Arc<dyn WorkflowStore>,
    clock: SharedClock,
    max_attempts: u32,
    fatal: CancellationToken,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn WorkflowStore>, clock: SharedClock) -> Self {
        Self {
            inner,
            clock,
            max_attempts: 5,
            fatal: CancellationToken::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Fires when the retry budget is exhausted; the node should exit
    pub fn fatal_signal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    async fn with_retries<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Err(StoreError::Database(message)) if attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    let delay = backoff(attempt);
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store call failed, retrying: {}",
                        message
                    );
                    self.clock.sleep(delay).await;
                }
                Err(StoreError::Database(message)) => {
                    error!(
                        op,
                        attempts = self.max_attempts,
                        "store unreachable, signalling fatal: {}",
                        message
                    );
                    self.fatal.cancel();
                    return Err(StoreError::Database(message));
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl WorkflowStore for RetryingStore {
    async fn create_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        self.with_retries("create_workflow", || self.inner.create_workflow(workflow))
            .await
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError> {
        self.with_retries("get_workflow", || self.inner.get_workflow(workflow_id))
            .await
    }

    async fn list_pending_workflows(
        &self,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        self.with_retries("list_pending_workflows", || {
            self.inner.list_pending_workflows(limit)
        })
        .await
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        self.with_retries("update_workflow_status", || {
            self.inner.update_workflow_status(workflow_id, status)
        })
        .await
    }

    async fn record_task_transition(
        &self,
        workflow_id: Uuid,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<TaskTransition, StoreError> {
        self.with_retries("record_task_transition", || {
            self.inner.record_task_transition(
                workflow_id,
                task_id,
                from,
                to,
                result.clone(),
                error.clone(),
            )
        })
        .await
    }

    async fn reset_interrupted_tasks(&self, workflow_id: Uuid) -> Result<Vec<String>, StoreError> {
        self.with_retries("reset_interrupted_tasks", || {
            self.inner.reset_interrupted_tasks(workflow_id)
        })
        .await
    }

    async fn delete_terminal_workflows_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, StoreError> {
        self.with_retries("delete_terminal_workflows_before", || {
            self.inner.delete_terminal_workflows_before(cutoff, limit)
        })
        .await
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.with_retries("write_checkpoint", || self.inner.write_checkpoint(checkpoint))
            .await
    }

    async fn load_latest_checkpoint(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        self.with_retries("load_latest_checkpoint", || {
            self.inner.load_latest_checkpoint(workflow_id)
        })
        .await
    }

    async fn prune_checkpoints(&self, workflow_id: Uuid, keep: usize) -> Result<u64, StoreError> {
        self.with_retries("prune_checkpoints", || {
            self.inner.prune_checkpoints(workflow_id, keep)
        })
        .await
    }

    async fn record_failure(&self, pattern: &FailurePattern) -> Result<(), StoreError> {
        self.with_retries("record_failure", || self.inner.record_failure(pattern))
            .await
    }

    async fn update_failure_resolution(
        &self,
        failure_id: Uuid,
        resolution: ResolutionStatus,
    ) -> Result<(), StoreError> {
        self.with_retries("update_failure_resolution", || {
            self.inner.update_failure_resolution(failure_id, resolution)
        })
        .await
    }

    async fn list_failures(&self, limit: usize) -> Result<Vec<FailurePattern>, StoreError> {
        self.with_retries("list_failures", || self.inner.list_failures(limit))
            .await
    }

    async fn delete_failures_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.with_retries("delete_failures_before", || {
            self.inner.delete_failures_before(cutoff)
        })
        .await
    }

    async fn insert_events(&self, events: &[AnalyticsEvent]) -> Result<(), StoreError> {
        self.with_retries("insert_events", || self.inner.insert_events(events))
            .await
    }

    async fn delete_events_before(
        &self,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> Result<u64, StoreError> {
        self.with_retries("delete_events_before", || {
            self.inner.delete_events_before(cutoff, page_size)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use weft_core::clock::SystemClock;
    use weft_core::model::TaskSpec;

    use crate::persistence::InMemoryWorkflowStore;

    /// Fails the first `fail_first` calls to get_workflow with a database
    /// error, then delegates.
    struct FlakyStore {
        inner: InMemoryWorkflowStore,
        remaining_failures: Mutex<u32>,
    }

    #[async_trait]
    impl WorkflowStore for FlakyStore {
        async fn create_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
            self.inner.create_workflow(workflow).await
        }

        async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError> {
            {
                let mut remaining = self.remaining_failures.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Database("connection reset".to_string()));
                }
            }
            self.inner.get_workflow(workflow_id).await
        }

        async fn list_pending_workflows(
            &self,
            limit: usize,
        ) -> Result<Vec<WorkflowRecord>, StoreError> {
            self.inner.list_pending_workflows(limit).await
        }

        async fn update_workflow_status(
            &self,
            workflow_id: Uuid,
            status: WorkflowStatus,
        ) -> Result<(), StoreError> {
            self.inner.update_workflow_status(workflow_id, status).await
        }

        async fn record_task_transition(
            &self,
            workflow_id: Uuid,
            task_id: &str,
            from: TaskStatus,
            to: TaskStatus,
            result: Option<serde_json::Value>,
            error: Option<String>,
        ) -> Result<TaskTransition, StoreError> {
            self.inner
                .record_task_transition(workflow_id, task_id, from, to, result, error)
                .await
        }

        async fn reset_interrupted_tasks(
            &self,
            workflow_id: Uuid,
        ) -> Result<Vec<String>, StoreError> {
            self.inner.reset_interrupted_tasks(workflow_id).await
        }

        async fn delete_terminal_workflows_before(
            &self,
            cutoff: DateTime<Utc>,
            limit: u32,
        ) -> Result<u64, StoreError> {
            self.inner.delete_terminal_workflows_before(cutoff, limit).await
        }

        async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
            self.inner.write_checkpoint(checkpoint).await
        }

        async fn load_latest_checkpoint(
            &self,
            workflow_id: Uuid,
        ) -> Result<Option<Checkpoint>, StoreError> {
            self.inner.load_latest_checkpoint(workflow_id).await
        }

        async fn prune_checkpoints(
            &self,
            workflow_id: Uuid,
            keep: usize,
        ) -> Result<u64, StoreError> {
            self.inner.prune_checkpoints(workflow_id, keep).await
        }

        async fn record_failure(&self, pattern: &FailurePattern) -> Result<(), StoreError> {
            self.inner.record_failure(pattern).await
        }

        async fn update_failure_resolution(
            &self,
            failure_id: Uuid,
            resolution: ResolutionStatus,
        ) -> Result<(), StoreError> {
            self.inner
                .update_failure_resolution(failure_id, resolution)
                .await
        }

        async fn list_failures(&self, limit: usize) -> Result<Vec<FailurePattern>, StoreError> {
            self.inner.list_failures(limit).await
        }

        async fn delete_failures_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.delete_failures_before(cutoff).await
        }

        async fn insert_events(&self, events: &[AnalyticsEvent]) -> Result<(), StoreError> {
            self.inner.insert_events(events).await
        }

        async fn delete_events_before(
            &self,
            cutoff: DateTime<Utc>,
            page_size: u32,
        ) -> Result<u64, StoreError> {
            self.inner.delete_events_before(cutoff, page_size).await
        }
    }

    fn flaky(fail_first: u32) -> (Arc<FlakyStore>, Uuid) {
        let inner = InMemoryWorkflowStore::new();
        let store = Arc::new(FlakyStore {
            inner,
            remaining_failures: Mutex::new(fail_first),
        });
        (store, Uuid::now_v7())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried() {
        let (store, _) = flaky(2);
        let workflow = WorkflowRecord::new("w", vec![TaskSpec::new("a", "noop")], Utc::now());
        store.create_workflow(&workflow).await.unwrap();

        let retrying = RetryingStore::new(store, Arc::new(SystemClock));
        let loaded = retrying.get_workflow(workflow.id).await.unwrap();
        assert_eq!(loaded.id, workflow.id);
        assert!(!retrying.fatal_signal().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_fires_fatal() {
        let (store, workflow_id) = flaky(100);
        let retrying = RetryingStore::new(store, Arc::new(SystemClock)).with_max_attempts(3);

        let result = retrying.get_workflow(workflow_id).await;
        assert!(matches!(result, Err(StoreError::Database(_))));
        assert!(retrying.fatal_signal().is_cancelled());
    }

    #[tokio::test]
    async fn test_semantic_errors_pass_through() {
        let (store, missing) = flaky(0);
        let retrying = RetryingStore::new(store, Arc::new(SystemClock));

        // Not-found is not an infrastructure failure; no retries, no fatal.
        let result = retrying.get_workflow(missing).await;
        assert!(matches!(result, Err(StoreError::WorkflowNotFound(_))));
        assert!(!retrying.fatal_signal().is_cancelled());
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_secs(1));
        assert!(backoff(30) <= Duration::from_secs(10));
    }
}
