//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use weft_core::clock::{Clock, SharedClock, SystemClock};
use weft_core::model::{
    AnalyticsEvent, Checkpoint, FailurePattern, ResolutionStatus, TaskStatus, WorkflowRecord,
    WorkflowStatus,
};

use super::store::{StoreError, TaskTransition, WorkflowStore};

/// In-memory implementation of WorkflowStore
///
/// Primarily for tests and single-process runs. Provides the same
/// transition-checking semantics as the PostgreSQL implementation.
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, WorkflowRecord>>,
    checkpoints: RwLock<HashMap<Uuid, Vec<Checkpoint>>>,
    failures: RwLock<Vec<FailurePattern>>,
    events: RwLock<Vec<AnalyticsEvent>>,
    clock: SharedClock,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with an injected clock (deterministic tests)
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
            failures: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Number of stored workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Number of buffered analytics events
    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    /// Snapshot of persisted analytics events (for assertions)
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.read().clone()
    }

    /// Snapshot of persisted failure patterns (for assertions)
    pub fn failures(&self) -> Vec<FailurePattern> {
        self.failures.read().clone()
    }

    /// Checkpoint versions recorded for a workflow, ascending
    pub fn checkpoint_versions(&self, workflow_id: Uuid) -> Vec<i64> {
        self.checkpoints
            .read()
            .get(&workflow_id)
            .map(|c| c.iter().map(|cp| cp.version).collect())
            .unwrap_or_default()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
        self.checkpoints.write().clear();
        self.failures.write().clear();
        self.events.write().clear();
    }
}

impl Default for InMemoryWorkflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow.id) {
            return Err(StoreError::Conflict(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn list_pending_workflows(
        &self,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let workflows = self.workflows.read();
        let mut pending: Vec<WorkflowRecord> = workflows
            .values()
            .filter(|w| w.status == WorkflowStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|w| w.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        if workflow.status.is_terminal() && workflow.status != status {
            return Err(StoreError::InvalidTransition {
                entity: "workflow".to_string(),
                from: workflow.status.to_string(),
                to: status.to_string(),
            });
        }

        workflow.status = status;
        workflow.updated_at = workflow.updated_at.max(self.clock.now());
        Ok(())
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
        let now = self.clock.now();
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let task = workflow
            .task_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound {
                workflow_id,
                task_id: task_id.to_string(),
            })?;

        if task.status != from || !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                entity: format!("task {}", task_id),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }

        task.status = to;
        if to == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if to.is_terminal() {
            task.ended_at = Some(now);
        }
        if from == TaskStatus::Running && to == TaskStatus::Pending {
            task.retry_count += 1;
        }
        if let Some(result) = result {
            task.result = Some(result);
        }
        if let Some(error) = error {
            task.error = Some(error);
        }

        let retry_count = task.retry_count;
        workflow.updated_at = workflow.updated_at.max(now);

        Ok(TaskTransition {
            workflow_id,
            task_id: task_id.to_string(),
            from,
            to,
            retry_count,
        })
    }

    async fn reset_interrupted_tasks(&self, workflow_id: Uuid) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now();
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let mut reset = Vec::new();
        for task in &mut workflow.tasks {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                reset.push(task.id.clone());
            }
        }
        if !reset.is_empty() {
            workflow.updated_at = workflow.updated_at.max(now);
        }
        Ok(reset)
    }

    async fn delete_terminal_workflows_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, StoreError> {
        let expired: Vec<Uuid> = {
            let workflows = self.workflows.read();
            workflows
                .values()
                .filter(|w| w.status.is_terminal() && w.updated_at < cutoff)
                .map(|w| w.id)
                .take(limit as usize)
                .collect()
        };

        let mut workflows = self.workflows.write();
        let mut checkpoints = self.checkpoints.write();
        for id in &expired {
            workflows.remove(id);
            checkpoints.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut checkpoints = self.checkpoints.write();
        let entry = checkpoints.entry(checkpoint.workflow_id).or_default();

        if entry.iter().any(|c| c.version == checkpoint.version) {
            return Err(StoreError::Conflict(format!(
                "checkpoint version {} already exists for workflow {}",
                checkpoint.version, checkpoint.workflow_id
            )));
        }

        entry.push(checkpoint.clone());
        entry.sort_by_key(|c| c.version);
        Ok(())
    }

    async fn load_latest_checkpoint(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .checkpoints
            .read()
            .get(&workflow_id)
            .and_then(|c| c.last().cloned()))
    }

    async fn prune_checkpoints(&self, workflow_id: Uuid, keep: usize) -> Result<u64, StoreError> {
        let mut checkpoints = self.checkpoints.write();
        let Some(entry) = checkpoints.get_mut(&workflow_id) else {
            return Ok(0);
        };

        let keep = keep.max(1);
        if entry.len() <= keep {
            return Ok(0);
        }

        let removed = entry.len() - keep;
        entry.drain(..removed);
        Ok(removed as u64)
    }

    async fn record_failure(&self, pattern: &FailurePattern) -> Result<(), StoreError> {
        self.failures.write().push(pattern.clone());
        Ok(())
    }

    async fn update_failure_resolution(
        &self,
        failure_id: Uuid,
        resolution: ResolutionStatus,
    ) -> Result<(), StoreError> {
        let mut failures = self.failures.write();
        let failure = failures
            .iter_mut()
            .find(|f| f.id == failure_id)
            .ok_or(StoreError::FailureNotFound(failure_id))?;
        failure.resolution_status = resolution;
        Ok(())
    }

    async fn list_failures(&self, limit: usize) -> Result<Vec<FailurePattern>, StoreError> {
        let failures = self.failures.read();
        let mut recent: Vec<FailurePattern> = failures.iter().cloned().collect();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(limit);
        Ok(recent)
    }

    async fn delete_failures_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut failures = self.failures.write();
        let before = failures.len();
        failures.retain(|f| f.timestamp >= cutoff);
        Ok((before - failures.len()) as u64)
    }

    async fn insert_events(&self, events: &[AnalyticsEvent]) -> Result<(), StoreError> {
        self.events.write().extend_from_slice(events);
        Ok(())
    }

    async fn delete_events_before(
        &self,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> Result<u64, StoreError> {
        let mut events = self.events.write();
        let mut deleted = 0u64;
        events.retain(|e| {
            if deleted < page_size as u64 && e.timestamp < cutoff {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::model::TaskSpec;

    fn sample_workflow() -> WorkflowRecord {
        WorkflowRecord::new(
            "sample",
            vec![
                TaskSpec::new("a", "noop"),
                TaskSpec::new("b", "noop").with_dependencies(vec!["a"]),
            ],
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryWorkflowStore::new();
        let workflow = sample_workflow();

        store.create_workflow(&workflow).await.unwrap();
        let loaded = store.get_workflow(workflow.id).await.unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Pending);
        assert_eq!(loaded.tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let store = InMemoryWorkflowStore::new();
        let workflow = sample_workflow();

        store.create_workflow(&workflow).await.unwrap();
        let result = store.create_workflow(&workflow).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_task_transition_lifecycle() {
        let store = InMemoryWorkflowStore::new();
        let workflow = sample_workflow();
        store.create_workflow(&workflow).await.unwrap();

        store
            .record_task_transition(
                workflow.id,
                "a",
                TaskStatus::Pending,
                TaskStatus::Running,
                None,
                None,
            )
            .await
            .unwrap();

        let transition = store
            .record_task_transition(
                workflow.id,
                "a",
                TaskStatus::Running,
                TaskStatus::Completed,
                Some(serde_json::json!({"ok": true})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(transition.retry_count, 0);

        let loaded = store.get_workflow(workflow.id).await.unwrap();
        let task = loaded.task("a").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.started_at.is_some());
        assert!(task.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let store = InMemoryWorkflowStore::new();
        let workflow = sample_workflow();
        store.create_workflow(&workflow).await.unwrap();

        // Pending -> Completed skips Running
        let result = store
            .record_task_transition(
                workflow.id,
                "a",
                TaskStatus::Pending,
                TaskStatus::Completed,
                None,
                None,
            )
            .await;

        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_retry_requeue_increments_count() {
        let store = InMemoryWorkflowStore::new();
        let workflow = sample_workflow();
        store.create_workflow(&workflow).await.unwrap();

        store
            .record_task_transition(
                workflow.id,
                "a",
                TaskStatus::Pending,
                TaskStatus::Running,
                None,
                None,
            )
            .await
            .unwrap();

        let transition = store
            .record_task_transition(
                workflow.id,
                "a",
                TaskStatus::Running,
                TaskStatus::Pending,
                None,
                Some("ConnectionError: down".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(transition.retry_count, 1);
    }

    #[tokio::test]
    async fn test_terminal_workflow_status_is_final() {
        let store = InMemoryWorkflowStore::new();
        let workflow = sample_workflow();
        store.create_workflow(&workflow).await.unwrap();

        store
            .update_workflow_status(workflow.id, WorkflowStatus::Cancelled)
            .await
            .unwrap();

        let result = store
            .update_workflow_status(workflow.id, WorkflowStatus::Running)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_checkpoint_versions_unique_and_pruned() {
        let store = InMemoryWorkflowStore::new();
        let workflow = sample_workflow();
        store.create_workflow(&workflow).await.unwrap();

        for version in 1..=5 {
            let checkpoint = Checkpoint::capture(&workflow, version, "node-1", Utc::now());
            store.write_checkpoint(&checkpoint).await.unwrap();
        }

        // Duplicate version conflicts
        let duplicate = Checkpoint::capture(&workflow, 3, "node-1", Utc::now());
        assert!(matches!(
            store.write_checkpoint(&duplicate).await,
            Err(StoreError::Conflict(_))
        ));

        let latest = store
            .load_latest_checkpoint(workflow.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version, 5);

        let removed = store.prune_checkpoints(workflow.id, 2).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.checkpoint_versions(workflow.id), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_event_retention_paging() {
        let store = InMemoryWorkflowStore::new();
        let old = Utc::now() - chrono::Duration::days(100);

        let events: Vec<AnalyticsEvent> = (0..5)
            .map(|i| AnalyticsEvent::new(format!("m{}", i), serde_json::json!(i), old))
            .collect();
        store.insert_events(&events).await.unwrap();
        store
            .insert_events(&[AnalyticsEvent::new("fresh", serde_json::json!(1), Utc::now())])
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(90);
        assert_eq!(store.delete_events_before(cutoff, 2).await.unwrap(), 2);
        assert_eq!(store.delete_events_before(cutoff, 10).await.unwrap(), 3);
        assert_eq!(store.delete_events_before(cutoff, 10).await.unwrap(), 0);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_resolution_update() {
        let store = InMemoryWorkflowStore::new();
        let workflow = sample_workflow();
        let pattern = FailurePattern::new(
            workflow.id,
            "a",
            "ValueError",
            "bad input",
            weft_core::model::Severity::Low,
            0,
            Utc::now(),
        );

        store.record_failure(&pattern).await.unwrap();
        store
            .update_failure_resolution(pattern.id, ResolutionStatus::PendingManualIntervention)
            .await
            .unwrap();

        let failures = store.list_failures(10).await.unwrap();
        assert_eq!(
            failures[0].resolution_status,
            ResolutionStatus::PendingManualIntervention
        );
    }
}
