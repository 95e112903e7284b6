//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - Task transitions guarded by row locks and applied atomically with the
//!   workflow's `updated_at` bump
//! - Checkpoint uniqueness on (workflow_id, version)
//! - Paged retention deletes to keep transactions short

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use weft_core::model::{
    AnalyticsEvent, Checkpoint, CheckpointState, FailurePattern, ResolutionStatus, Severity,
    TaskRecord, TaskStatus, WorkflowRecord, WorkflowStatus,
};

use super::store::{StoreError, TaskTransition, WorkflowStore};

/// PostgreSQL implementation of WorkflowStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use weft_engine::persistence::PostgresWorkflowStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/weft").await?;
/// weft_engine::persistence::run_migrations(&pool).await?;
/// let store = PostgresWorkflowStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_tasks(
        &self,
        workflow_ids: &[Uuid],
    ) -> Result<Vec<(Uuid, TaskRecord)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, id, name, type, config, deps, timeout_seconds,
                   max_retries, priority, status, result, error,
                   started_at, ended_at, retry_count
            FROM tasks
            WHERE workflow_id = ANY($1)
            ORDER BY workflow_id, position
            "#,
        )
        .bind(workflow_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            tasks.push((
                row.get("workflow_id"),
                TaskRecord {
                    id: row.get("id"),
                    name: row.get("name"),
                    task_type: row.get("type"),
                    config: row.get("config"),
                    dependencies: row.get("deps"),
                    timeout: std::time::Duration::from_secs(
                        row.get::<i64, _>("timeout_seconds").max(0) as u64,
                    ),
                    max_retries: row.get::<i32, _>("max_retries") as u32,
                    priority: row.get("priority"),
                    status: parse_task_status(&status)?,
                    result: row.get("result"),
                    error: row.get("error"),
                    started_at: row.get("started_at"),
                    ended_at: row.get("ended_at"),
                    retry_count: row.get::<i32, _>("retry_count") as u32,
                },
            ));
        }
        Ok(tasks)
    }

    fn workflow_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowRecord, StoreError> {
        let status: String = row.get("status");
        Ok(WorkflowRecord {
            id: row.get("id"),
            name: row.get("name"),
            status: parse_workflow_status(&status)?,
            tasks: vec![],
            metadata: row.get("metadata"),
            tenant_id: row.get("tenant_id"),
            max_concurrency: row
                .get::<Option<i32>, _>("max_concurrency")
                .map(|c| c.max(1) as usize),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn create_workflow(&self, workflow: &WorkflowRecord) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, status, metadata, tenant_id, max_concurrency,
                                   created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.status.to_string())
        .bind(&workflow.metadata)
        .bind(&workflow.tenant_id)
        .bind(workflow.max_concurrency.map(|c| c as i32))
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("workflow {} already exists", workflow.id))
            }
            other => StoreError::Database(other.to_string()),
        })?;

        for (position, task) in workflow.tasks.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO tasks (workflow_id, id, name, type, config, deps, timeout_seconds,
                                   max_retries, priority, position, status, retry_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(workflow.id)
            .bind(&task.id)
            .bind(&task.name)
            .bind(&task.task_type)
            .bind(&task.config)
            .bind(&task.dependencies)
            .bind(task.timeout.as_secs() as i64)
            .bind(task.max_retries as i32)
            .bind(task.priority)
            .bind(position as i32)
            .bind(task.status.to_string())
            .bind(task.retry_count as i32)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%workflow.id, task_count = workflow.tasks.len(), "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, status, metadata, tenant_id, max_concurrency, created_at, updated_at
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let mut workflow = Self::workflow_from_row(&row)?;
        workflow.tasks = self
            .load_tasks(&[workflow_id])
            .await?
            .into_iter()
            .map(|(_, t)| t)
            .collect();

        Ok(workflow)
    }

    #[instrument(skip(self))]
    async fn list_pending_workflows(
        &self,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, status, metadata, tenant_id, max_concurrency, created_at, updated_at
            FROM workflows
            WHERE status = 'pending'
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            workflows.push(Self::workflow_from_row(row)?);
        }

        let ids: Vec<Uuid> = workflows.iter().map(|w| w.id).collect();
        for (workflow_id, task) in self.load_tasks(&ids).await? {
            if let Some(workflow) = workflows.iter_mut().find(|w| w.id == workflow_id) {
                workflow.tasks.push(task);
            }
        }

        Ok(workflows)
    }

    #[instrument(skip(self))]
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let current = lock_workflow_status(&mut tx, workflow_id).await?;
        if current.is_terminal() && current != status {
            return Err(StoreError::InvalidTransition {
                entity: "workflow".to_string(),
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        sqlx::query(
            r#"
            UPDATE workflows
            SET status = $2,
                updated_at = GREATEST(updated_at, NOW())
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(status.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%workflow_id, %status, "updated workflow status");
        Ok(())
    }

    #[instrument(skip(self, result, error))]
    async fn record_task_transition(
        &self,
        workflow_id: Uuid,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<TaskTransition, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT status, retry_count FROM tasks
            WHERE workflow_id = $1 AND id = $2
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or_else(|| StoreError::TaskNotFound {
            workflow_id,
            task_id: task_id.to_string(),
        })?;

        let current_status: String = row.get("status");
        let current = parse_task_status(&current_status)?;
        if current != from || !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                entity: format!("task {}", task_id),
                from: current.to_string(),
                to: to.to_string(),
            });
        }

        let requeue = from == TaskStatus::Running && to == TaskStatus::Pending;
        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $3,
                started_at = CASE WHEN $4 AND started_at IS NULL THEN NOW() ELSE started_at END,
                ended_at = CASE WHEN $5 THEN NOW() ELSE ended_at END,
                retry_count = retry_count + CASE WHEN $6 THEN 1 ELSE 0 END,
                result = COALESCE($7, result),
                error = COALESCE($8, error)
            WHERE workflow_id = $1 AND id = $2
            RETURNING retry_count
            "#,
        )
        .bind(workflow_id)
        .bind(task_id)
        .bind(to.to_string())
        .bind(to == TaskStatus::Running)
        .bind(to.is_terminal())
        .bind(requeue)
        .bind(&result)
        .bind(&error)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE workflows
            SET updated_at = GREATEST(updated_at, NOW())
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%workflow_id, task_id, %from, %to, "recorded task transition");
        Ok(TaskTransition {
            workflow_id,
            task_id: task_id.to_string(),
            from,
            to,
            retry_count: updated.get::<i32, _>("retry_count") as u32,
        })
    }

    #[instrument(skip(self))]
    async fn reset_interrupted_tasks(&self, workflow_id: Uuid) -> Result<Vec<String>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending'
            WHERE workflow_id = $1 AND status = 'running'
            RETURNING id
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if !rows.is_empty() {
            sqlx::query(
                r#"
                UPDATE workflows
                SET updated_at = GREATEST(updated_at, NOW())
                WHERE id = $1
                "#,
            )
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn delete_terminal_workflows_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, StoreError> {
        // Tasks and checkpoints go with the workflow via ON DELETE CASCADE.
        let result = sqlx::query(
            r#"
            DELETE FROM workflows
            WHERE id IN (
                SELECT id FROM workflows
                WHERE status IN ('completed', 'failed', 'cancelled')
                  AND updated_at < $1
                ORDER BY updated_at
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, checkpoint), fields(workflow_id = %checkpoint.workflow_id, version = checkpoint.version))]
    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let state = serde_json::to_value(&checkpoint.state)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (workflow_id, version, state, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(checkpoint.workflow_id)
        .bind(checkpoint.version)
        .bind(&state)
        .bind(checkpoint.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Conflict(
                format!(
                    "checkpoint version {} already exists for workflow {}",
                    checkpoint.version, checkpoint.workflow_id
                ),
            ),
            other => StoreError::Database(other.to_string()),
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_latest_checkpoint(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, version, state, created_at
            FROM checkpoints
            WHERE workflow_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.map(|row| {
            let state: serde_json::Value = row.get("state");
            let state: CheckpointState = serde_json::from_value(state)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            Ok(Checkpoint {
                workflow_id: row.get("workflow_id"),
                version: row.get("version"),
                state,
                created_at: row.get("created_at"),
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn prune_checkpoints(&self, workflow_id: Uuid, keep: usize) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM checkpoints
            WHERE workflow_id = $1
              AND version NOT IN (
                  SELECT version FROM checkpoints
                  WHERE workflow_id = $1
                  ORDER BY version DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(workflow_id)
        .bind(keep.max(1) as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, pattern), fields(workflow_id = %pattern.workflow_id, error_type = %pattern.error_type))]
    async fn record_failure(&self, pattern: &FailurePattern) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO failure_patterns (id, workflow_id, task_id, error_type, message, context,
                                          severity, retry_count, resolution_status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(pattern.id)
        .bind(pattern.workflow_id)
        .bind(&pattern.task_id)
        .bind(&pattern.error_type)
        .bind(&pattern.message)
        .bind(&pattern.context)
        .bind(pattern.severity.to_string())
        .bind(pattern.retry_count as i32)
        .bind(pattern.resolution_status.to_string())
        .bind(pattern.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to record failure pattern: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn update_failure_resolution(
        &self,
        failure_id: Uuid,
        resolution: ResolutionStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE failure_patterns
            SET resolution_status = $2
            WHERE id = $1
            "#,
        )
        .bind(failure_id)
        .bind(resolution.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FailureNotFound(failure_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_failures(&self, limit: usize) -> Result<Vec<FailurePattern>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, task_id, error_type, message, context,
                   severity, retry_count, resolution_status, created_at
            FROM failure_patterns
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut failures = Vec::with_capacity(rows.len());
        for row in rows {
            let severity: String = row.get("severity");
            let resolution: String = row.get("resolution_status");
            failures.push(FailurePattern {
                id: row.get("id"),
                workflow_id: row.get("workflow_id"),
                task_id: row.get("task_id"),
                error_type: row.get("error_type"),
                message: row.get("message"),
                context: row.get("context"),
                severity: parse_severity(&severity)?,
                retry_count: row.get::<i32, _>("retry_count") as u32,
                resolution_status: parse_resolution(&resolution)?,
                timestamp: row.get("created_at"),
            });
        }
        Ok(failures)
    }

    #[instrument(skip(self))]
    async fn delete_failures_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM failure_patterns WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn insert_events(&self, events: &[AnalyticsEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO analytics_events (id, metric_name, value, timestamp, metadata)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(&event.metric_name)
            .bind(&event.value)
            .bind(event.timestamp)
            .bind(&event.metadata)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_events_before(
        &self,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM analytics_events
            WHERE id IN (
                SELECT id FROM analytics_events
                WHERE timestamp < $1
                ORDER BY timestamp
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(page_size as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

async fn lock_workflow_status(
    tx: &mut Transaction<'_, Postgres>,
    workflow_id: Uuid,
) -> Result<WorkflowStatus, StoreError> {
    let row = sqlx::query("SELECT status FROM workflows WHERE id = $1 FOR UPDATE")
        .bind(workflow_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

    let status: String = row.get("status");
    parse_workflow_status(&status)
}

// Helper functions

fn parse_workflow_status(status: &str) -> Result<WorkflowStatus, StoreError> {
    match status {
        "pending" => Ok(WorkflowStatus::Pending),
        "running" => Ok(WorkflowStatus::Running),
        "completed" => Ok(WorkflowStatus::Completed),
        "failed" => Ok(WorkflowStatus::Failed),
        "cancelled" => Ok(WorkflowStatus::Cancelled),
        "paused" => Ok(WorkflowStatus::Paused),
        _ => Err(StoreError::Database(format!(
            "unknown workflow status: {}",
            status
        ))),
    }
}

fn parse_task_status(status: &str) -> Result<TaskStatus, StoreError> {
    match status {
        "pending" => Ok(TaskStatus::Pending),
        "running" => Ok(TaskStatus::Running),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "skipped" => Ok(TaskStatus::Skipped),
        _ => Err(StoreError::Database(format!(
            "unknown task status: {}",
            status
        ))),
    }
}

fn parse_severity(severity: &str) -> Result<Severity, StoreError> {
    match severity {
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        _ => Err(StoreError::Database(format!(
            "unknown severity: {}",
            severity
        ))),
    }
}

fn parse_resolution(resolution: &str) -> Result<ResolutionStatus, StoreError> {
    match resolution {
        "pending" => Ok(ResolutionStatus::Pending),
        "pending_manual_intervention" => Ok(ResolutionStatus::PendingManualIntervention),
        "permanently_failed" => Ok(ResolutionStatus::PermanentlyFailed),
        "resolved" => Ok(ResolutionStatus::Resolved),
        _ => Err(StoreError::Database(format!(
            "unknown resolution status: {}",
            resolution
        ))),
    }
}
