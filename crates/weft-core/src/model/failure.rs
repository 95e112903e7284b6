//! Failure patterns persisted for every handler failure

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Failure severity, derived from the error type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Where a failure pattern stands in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Recorded, recovery in progress
    Pending,
    /// Recovery declined to retry; waiting on an operator
    PendingManualIntervention,
    /// Retry budget exhausted
    PermanentlyFailed,
    /// A later attempt succeeded
    Resolved,
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::PendingManualIntervention => write!(f, "pending_manual_intervention"),
            Self::PermanentlyFailed => write!(f, "permanently_failed"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// A persisted handler failure
///
/// One row per handler failure; consulted by anomaly scoring and retained for
/// a configured horizon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailurePattern {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub task_id: String,
    /// Classification key, e.g. "ConnectionError" or "Timeout"
    pub error_type: String,
    pub message: String,
    pub context: serde_json::Value,
    pub severity: Severity,
    pub retry_count: u32,
    pub resolution_status: ResolutionStatus,
    pub timestamp: DateTime<Utc>,
}

impl FailurePattern {
    pub fn new(
        workflow_id: Uuid,
        task_id: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            task_id: task_id.into(),
            error_type: error_type.into(),
            message: message.into(),
            context: serde_json::Value::Null,
            severity,
            retry_count,
            resolution_status: ResolutionStatus::Pending,
            timestamp: now,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_resolution_status_serde() {
        let json = serde_json::to_string(&ResolutionStatus::PendingManualIntervention).unwrap();
        assert_eq!(json, "\"pending_manual_intervention\"");
    }
}
