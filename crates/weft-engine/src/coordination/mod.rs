//! Coordination port
//!
//! Ephemeral cluster state (heartbeats, the primary record, job claims) and
//! cross-node notifications flow through the [`CoordinationStore`] trait.
//! Key layout:
//!
//! - `nodes/{node_id}` -> serialized [`weft_core::model::NodeInfo`] (TTL = heartbeat_ttl)
//! - `primary` -> node id of the current primary (compare-and-set)
//! - `claims/{workflow_id}` -> serialized [`weft_core::model::JobClaim`] (TTL = lease_ttl)
//! - channel `failover` -> serialized [`weft_core::model::FailoverNotice`]

mod memory;
mod postgres;
mod retrying;
mod store;

pub use memory::InMemoryCoordinationStore;
pub use postgres::PostgresCoordinationStore;
pub use retrying::RetryingCoordination;
pub use store::{CoordError, CoordinationStore, Subscription};

/// Key for a node's heartbeat record
pub fn node_key(node_id: &str) -> String {
    format!("nodes/{}", node_id)
}

/// Prefix under which all node records live
pub const NODES_PREFIX: &str = "nodes/";

/// Key holding the current primary's node id
pub const PRIMARY_KEY: &str = "primary";

/// Key for a workflow's job claim
pub fn claim_key(workflow_id: uuid::Uuid) -> String {
    format!("claims/{}", workflow_id)
}

/// Prefix under which all claims live
pub const CLAIMS_PREFIX: &str = "claims/";

/// Channel carrying failover notices
pub const FAILOVER_CHANNEL: &str = "failover";
