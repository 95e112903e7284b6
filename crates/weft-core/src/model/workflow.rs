//! Workflow and task records

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow created but not started
    Pending,

    /// Workflow is being scheduled
    Running,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed
    Failed,

    /// Workflow was cancelled
    Cancelled,

    /// Dispatch is suspended; in-flight tasks run to completion
    Paused,
}

impl WorkflowStatus {
    /// Terminal statuses are final; no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Legal forward transitions. Pending -> Running -> {Completed, Failed},
    /// Running -> Pending is the retry re-queue, Pending -> Skipped is the
    /// fail-fast path for descendants of a failed task.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Pending)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

fn default_task_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_retries() -> u32 {
    3
}

fn default_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A task as submitted by the caller
///
/// Dependencies reference other task ids in the same workflow. The submitted
/// order of tasks is preserved for display only; execution order is dictated
/// by the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    /// Task id, unique within the workflow
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Key into the task registry
    #[serde(rename = "type")]
    pub task_type: String,

    /// Opaque handler configuration
    #[serde(default = "default_config")]
    pub config: serde_json::Value,

    /// Ids of tasks that must complete before this one is dispatched
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Wall-clock limit around the handler invocation
    #[serde(
        rename = "timeout_seconds",
        with = "duration_secs",
        default = "default_task_timeout"
    )]
    pub timeout: Duration,

    /// Retry budget; the recovery strategy may lower the effective cap
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Dispatch tie-break among ready tasks (higher first)
    #[serde(default)]
    pub priority: i32,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            task_type: task_type.into(),
            config: default_config(),
            dependencies: vec![],
            timeout: default_task_timeout(),
            max_retries: default_max_retries(),
            priority: 0,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<&str>) -> Self {
        self.dependencies = deps.into_iter().map(String::from).collect();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A task with its runtime state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub config: serde_json::Value,
    pub dependencies: Vec<String>,
    #[serde(rename = "timeout_seconds", with = "duration_secs")]
    pub timeout: Duration,
    pub max_retries: u32,
    pub priority: i32,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl TaskRecord {
    /// Create a pending record from a submitted spec
    pub fn from_spec(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            task_type: spec.task_type,
            config: spec.config,
            dependencies: spec.dependencies,
            timeout: spec.timeout,
            max_retries: spec.max_retries,
            priority: spec.priority,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            ended_at: None,
            retry_count: 0,
        }
    }
}

/// A workflow with its tasks and runtime state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Per-workflow concurrency override; the engine default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskSpec>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            status: WorkflowStatus::Pending,
            tasks: tasks.into_iter().map(TaskRecord::from_spec).collect(),
            metadata: default_config(),
            tenant_id: None,
            max_concurrency: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Task types referenced by this workflow (for capability matching)
    pub fn required_task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.tasks.iter().map(|t| t.task_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn any_task_failed(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Failed)
    }
}

/// Serde support for Duration as whole seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
