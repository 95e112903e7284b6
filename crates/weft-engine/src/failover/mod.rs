//! Failover controller
//!
//! Heartbeats, deterministic primary election with compare-and-set
//! promotion, and orphan-claim redistribution. At most one primary exists in
//! steady state; transient multi-primary windows resolve within the
//! heartbeat TTL because every node re-evaluates the same election
//! predicate against the same roster.

mod controller;
mod election;
mod heartbeat;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use weft_core::model::{NodeInfo, NodeRole};

pub use controller::{FailoverController, FailoverError, PrimaryRecord, TickReport};
pub use election::{elect, select_target};
pub use heartbeat::HeartbeatWriter;

/// This node's live identity: role and load, shared between the engine
/// (which reports load), the heartbeat writer and the failover controller
pub struct NodeState {
    node_id: String,
    priority: i32,
    capabilities: Vec<String>,
    role: RwLock<NodeRole>,
    load_bits: AtomicU64,
}

impl NodeState {
    pub fn new(node_id: impl Into<String>, priority: i32, capabilities: Vec<String>) -> Self {
        Self {
            node_id: node_id.into(),
            priority,
            capabilities,
            role: RwLock::new(NodeRole::Standby),
            load_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn role(&self) -> NodeRole {
        *self.role.read()
    }

    pub fn set_role(&self, role: NodeRole) {
        *self.role.write() = role;
    }

    /// Load ratio in [0, 1], reported by the engine
    pub fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    pub fn set_load(&self, load: f64) {
        self.load_bits
            .store(load.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Snapshot for the heartbeat record
    pub fn info(&self, now: DateTime<Utc>) -> NodeInfo {
        NodeInfo {
            node_id: self.node_id.clone(),
            role: self.role(),
            load: self.load(),
            capabilities: self.capabilities.clone(),
            last_heartbeat: now,
            priority: self.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_defaults() {
        let state = NodeState::new("n1", 2, vec!["noop".to_string()]);
        assert_eq!(state.role(), NodeRole::Standby);
        assert_eq!(state.load(), 0.0);
        assert_eq!(state.priority(), 2);
    }

    #[test]
    fn test_load_clamped() {
        let state = NodeState::new("n1", 0, vec![]);
        state.set_load(3.5);
        assert_eq!(state.load(), 1.0);
        state.set_load(-1.0);
        assert_eq!(state.load(), 0.0);
    }

    #[test]
    fn test_info_snapshot() {
        let state = NodeState::new("n1", 1, vec!["noop".to_string()]);
        state.set_role(NodeRole::Primary);
        state.set_load(0.5);

        let info = state.info(Utc::now());
        assert_eq!(info.node_id, "n1");
        assert_eq!(info.role, NodeRole::Primary);
        assert_eq!(info.load, 0.5);
    }
}
