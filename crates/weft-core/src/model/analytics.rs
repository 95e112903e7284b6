//! Analytics events emitted by the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An append-only execution event
///
/// Emitted on workflow and task transitions and flushed to the persistence
/// port in batches. Subject to the analytics retention horizon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsEvent {
    pub metric_name: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AnalyticsEvent {
    pub fn new(
        metric_name: impl Into<String>,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            metric_name: metric_name.into(),
            value,
            timestamp: now,
            metadata: serde_json::Value::Null,
        }
    }

    /// Event for a workflow status change
    pub fn workflow_transition(
        workflow_id: Uuid,
        status: impl std::fmt::Display,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            "workflow.transition",
            serde_json::json!({
                "workflow_id": workflow_id,
                "status": status.to_string(),
            }),
            now,
        )
    }

    /// Event for a task status change
    pub fn task_transition(
        workflow_id: Uuid,
        task_id: &str,
        status: impl std::fmt::Display,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            "task.transition",
            serde_json::json!({
                "workflow_id": workflow_id,
                "task_id": task_id,
                "status": status.to_string(),
            }),
            now,
        )
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_roundtrip() {
        let event = AnalyticsEvent::task_transition(Uuid::now_v7(), "a", "completed", Utc::now());

        let json = serde_json::to_string(&event).unwrap();
        let parsed: AnalyticsEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
        assert_eq!(parsed.metric_name, "task.transition");
    }
}
