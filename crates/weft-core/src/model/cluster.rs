//! Ephemeral cluster state: node roster and job claims
//!
//! These records live in the coordination store, not the persistence port.
//! A node is alive while its heartbeat is fresher than the heartbeat TTL; a
//! claim asserts that one node owns the scheduling of one workflow and
//! expires if not renewed inside its lease.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workflow::duration_secs;

/// Cluster role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Primary,
    Standby,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Standby => write!(f, "standby"),
        }
    }
}

/// A node's heartbeat record, written under `nodes/{node_id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    pub node_id: String,
    pub role: NodeRole,
    /// Load ratio in [0, 1]
    pub load: f64,
    /// Task types this node can execute
    pub capabilities: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    /// Election weight (higher wins)
    pub priority: i32,
}

impl NodeInfo {
    pub fn is_alive(&self, now: DateTime<Utc>, heartbeat_ttl: Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat)
            .to_std()
            .map(|elapsed| elapsed < heartbeat_ttl)
            .unwrap_or(true) // heartbeat in the future counts as alive
    }

    /// Whether this node can run every task type in `required`
    pub fn covers(&self, required: &[String]) -> bool {
        required.iter().all(|t| self.capabilities.contains(t))
    }
}

/// Scheduling ownership of one workflow, written under `claims/{workflow_id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobClaim {
    pub workflow_id: Uuid,
    pub node_id: String,
    pub claimed_at: DateTime<Utc>,
    #[serde(rename = "lease_ttl_seconds", with = "duration_secs")]
    pub lease_ttl: Duration,
}

impl JobClaim {
    pub fn new(
        workflow_id: Uuid,
        node_id: impl Into<String>,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id,
            node_id: node_id.into(),
            claimed_at: now,
            lease_ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.claimed_at)
            .to_std()
            .map(|elapsed| elapsed >= self.lease_ttl)
            .unwrap_or(false)
    }
}

/// Broadcast on the `failover` channel when the primary changes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverNotice {
    pub new_primary: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn node(id: &str, heartbeat: DateTime<Utc>) -> NodeInfo {
        NodeInfo {
            node_id: id.to_string(),
            role: NodeRole::Standby,
            load: 0.1,
            capabilities: vec!["noop".to_string()],
            last_heartbeat: heartbeat,
            priority: 0,
        }
    }

    #[test]
    fn test_node_liveness() {
        let now = Utc::now();
        let ttl = Duration::from_secs(30);

        assert!(node("n1", now - ChronoDuration::seconds(10)).is_alive(now, ttl));
        assert!(!node("n2", now - ChronoDuration::seconds(31)).is_alive(now, ttl));
    }

    #[test]
    fn test_capability_coverage() {
        let mut n = node("n1", Utc::now());
        n.capabilities = vec!["noop".to_string(), "system_check".to_string()];

        assert!(n.covers(&["noop".to_string()]));
        assert!(!n.covers(&["noop".to_string(), "data_backup".to_string()]));
        assert!(n.covers(&[]));
    }

    #[test]
    fn test_claim_expiry() {
        let now = Utc::now();
        let claim = JobClaim::new(Uuid::now_v7(), "n1", Duration::from_secs(60), now);

        assert!(!claim.is_expired(now + ChronoDuration::seconds(59)));
        assert!(claim.is_expired(now + ChronoDuration::seconds(60)));
    }

    #[test]
    fn test_claim_roundtrip() {
        let claim = JobClaim::new(Uuid::now_v7(), "n1", Duration::from_secs(45), Utc::now());
        let json = serde_json::to_string(&claim).unwrap();
        assert!(json.contains("\"lease_ttl_seconds\":45"));

        let parsed: JobClaim = serde_json::from_str(&json).unwrap();
        assert_eq!(claim, parsed);
    }
}
