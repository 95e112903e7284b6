//! WorkflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use weft_core::model::{
    AnalyticsEvent, Checkpoint, FailurePattern, ResolutionStatus, TaskStatus, WorkflowRecord,
    WorkflowStatus,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Task not found within a workflow
    #[error("task {task_id} not found in workflow {workflow_id}")]
    TaskNotFound { workflow_id: Uuid, task_id: String },

    /// Failure pattern not found
    #[error("failure pattern not found: {0}")]
    FailureNotFound(Uuid),

    /// Transition not permitted by the status machine
    #[error("illegal transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// Unique constraint violated (duplicate checkpoint version, duplicate id)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of a task transition, echoing the persisted row
#[derive(Debug, Clone)]
pub struct TaskTransition {
    pub workflow_id: Uuid,
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub retry_count: u32,
}

/// Durable store for workflows, checkpoints, failures and analytics rows
///
/// All multi-row mutations are transactional at single-workflow granularity.
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Persist a new workflow (status Pending, all tasks Pending)
    async fn create_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError>;

    /// Load a workflow with all task states
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError>;

    /// Workflows in Pending, oldest first (primary dispatch path)
    async fn list_pending_workflows(&self, limit: usize) -> Result<Vec<WorkflowRecord>, StoreError>;

    /// Update workflow status; bumps `updated_at`
    ///
    /// Rejects any transition out of a terminal status.
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Task Transitions
    // =========================================================================

    /// Record a task status transition atomically with the workflow's
    /// `updated_at` bump
    ///
    /// Sets `started_at` on the first entry into Running, `ended_at` on any
    /// terminal transition, increments `retry_count` on the Running ->
    /// Pending re-queue, and stores `result`/`error`. Rejects transitions the
    /// task status machine does not allow.
    async fn record_task_transition(
        &self,
        workflow_id: Uuid,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<TaskTransition, StoreError>;

    /// Reset tasks left Running by a dead owner back to Pending
    ///
    /// Adoption path after failover: interrupted runs are re-dispatched
    /// without consuming retry budget. Returns the ids reset.
    async fn reset_interrupted_tasks(&self, workflow_id: Uuid) -> Result<Vec<String>, StoreError>;

    /// Delete terminal workflows last touched before the cutoff, with their
    /// tasks and checkpoints. Non-terminal workflows are never deleted.
    /// Returns workflows removed.
    async fn delete_terminal_workflows_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, StoreError>;

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Persist a checkpoint; unique on (workflow_id, version)
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Most recent checkpoint for a workflow, if any
    async fn load_latest_checkpoint(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// Delete all but the newest `keep` checkpoints for a workflow
    async fn prune_checkpoints(&self, workflow_id: Uuid, keep: usize) -> Result<u64, StoreError>;

    // =========================================================================
    // Failure History
    // =========================================================================

    /// Persist a handler failure
    async fn record_failure(&self, pattern: &FailurePattern) -> Result<(), StoreError>;

    /// Update the resolution status of a recorded failure
    async fn update_failure_resolution(
        &self,
        failure_id: Uuid,
        resolution: ResolutionStatus,
    ) -> Result<(), StoreError>;

    /// Recent failures, newest first
    async fn list_failures(&self, limit: usize) -> Result<Vec<FailurePattern>, StoreError>;

    /// Delete failure rows older than the cutoff; returns rows deleted
    async fn delete_failures_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Analytics
    // =========================================================================

    /// Append a batch of analytics events in one transaction
    async fn insert_events(&self, events: &[AnalyticsEvent]) -> Result<(), StoreError>;

    /// Delete one page of events older than the cutoff; returns rows deleted.
    /// Callers loop until a page comes back empty, keeping transactions short.
    async fn delete_events_before(
        &self,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> Result<u64, StoreError>;
}
