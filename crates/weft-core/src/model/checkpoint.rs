//! Workflow checkpoints
//!
//! A checkpoint is a durable snapshot of a workflow's full task-state vector,
//! written after every task transition. Versions are monotonic per workflow
//! and the most recent checkpoint is authoritative for recovery.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workflow::{TaskStatus, WorkflowRecord};

/// Per-task state captured in a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub retry_count: u32,
}

/// Resource usage at checkpoint time
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSnapshot {
    /// Node that wrote the checkpoint
    pub node_id: String,
    /// Tasks in flight when the snapshot was taken
    pub in_flight: usize,
}

/// Full checkpoint state vector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointState {
    /// Task id -> snapshot, in deterministic order
    pub tasks: BTreeMap<String, TaskSnapshot>,
    pub resources: ResourceSnapshot,
}

/// A workflow-scoped snapshot with a monotonic version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub workflow_id: Uuid,
    pub version: i64,
    pub state: CheckpointState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Capture the current task-state vector of a workflow
    pub fn capture(
        workflow: &WorkflowRecord,
        version: i64,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let tasks = workflow
            .tasks
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    TaskSnapshot {
                        status: t.status,
                        result: t.result.clone(),
                        retry_count: t.retry_count,
                    },
                )
            })
            .collect();

        Self {
            workflow_id: workflow.id,
            version,
            state: CheckpointState {
                tasks,
                resources: ResourceSnapshot {
                    node_id: node_id.to_string(),
                    in_flight: workflow.running_count(),
                },
            },
            created_at: now,
        }
    }

    /// Ids of tasks the checkpoint recorded as completed
    pub fn completed_tasks(&self) -> impl Iterator<Item = &str> {
        self.state
            .tasks
            .iter()
            .filter(|(_, s)| s.status == TaskStatus::Completed)
            .map(|(id, _)| id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::workflow::TaskSpec;

    #[test]
    fn test_capture_and_roundtrip() {
        let now = Utc::now();
        let mut workflow = WorkflowRecord::new(
            "w",
            vec![TaskSpec::new("a", "noop"), TaskSpec::new("b", "noop")],
            now,
        );
        workflow.task_mut("a").unwrap().status = TaskStatus::Completed;
        workflow.task_mut("a").unwrap().result = Some(serde_json::json!({"ok": true}));

        let checkpoint = Checkpoint::capture(&workflow, 3, "node-1", now);
        assert_eq!(checkpoint.version, 3);
        assert_eq!(checkpoint.state.tasks.len(), 2);
        assert_eq!(checkpoint.completed_tasks().collect::<Vec<_>>(), vec!["a"]);

        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(checkpoint, parsed);
    }
}
