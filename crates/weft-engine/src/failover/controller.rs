//! Failover controller
//!
//! Watches the node roster, keeps a single primary elected, and - on the
//! primary only - breaks expired claims of dead nodes and reassigns the
//! orphaned workflows to capable, lightly-loaded survivors. The controller
//! manages leases and claims; it never re-executes tasks itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use weft_core::clock::{Clock, SharedClock};
use weft_core::config::FailoverConfig;
use weft_core::model::{FailoverNotice, JobClaim, NodeInfo, NodeRole, WorkflowStatus};

use crate::coordination::{
    CoordError, CoordinationStore, CLAIMS_PREFIX, FAILOVER_CHANNEL, NODES_PREFIX, PRIMARY_KEY,
};
use crate::persistence::{StoreError, WorkflowStore};

use super::election::{elect, select_target};
use super::NodeState;

/// Value stored under the `primary` key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrimaryRecord {
    pub node_id: String,
    pub since: DateTime<Utc>,
}

/// Errors from failover operations
#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What one monitor tick did (for logging and tests)
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// This node promoted itself during the tick
    pub promoted: bool,
    /// Orphaned workflows reassigned
    pub reassigned: usize,
    /// Claims broken with no capable target (workflow left pending)
    pub unplaced: usize,
}

/// Heartbeat-driven failover controller
pub struct FailoverController {
    coord: Arc<dyn CoordinationStore>,
    store: Arc<dyn WorkflowStore>,
    state: Arc<NodeState>,
    config: FailoverConfig,
    /// Lease applied to claims this controller writes during reassignment
    lease_ttl: Duration,
    clock: SharedClock,
}

impl FailoverController {
    pub fn new(
        coord: Arc<dyn CoordinationStore>,
        store: Arc<dyn WorkflowStore>,
        state: Arc<NodeState>,
        config: FailoverConfig,
        lease_ttl: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            coord,
            store,
            state,
            config,
            lease_ttl,
            clock,
        }
    }

    /// Alive nodes per the roster and heartbeat TTL
    pub async fn alive_nodes(&self) -> Result<Vec<NodeInfo>, FailoverError> {
        let now = self.clock.now();
        let mut alive = Vec::new();
        for (_, raw) in self.coord.list_prefix(NODES_PREFIX).await? {
            match serde_json::from_str::<NodeInfo>(&raw) {
                Ok(info) if info.is_alive(now, self.config.heartbeat_ttl) => alive.push(info),
                Ok(_) => {}
                Err(e) => warn!("unreadable node record skipped: {}", e),
            }
        }
        Ok(alive)
    }

    /// One monitor pass: settle the primary, then (as primary) reassign
    /// orphaned claims
    #[instrument(skip(self), fields(node_id = %self.state.node_id()))]
    pub async fn tick(&self) -> Result<TickReport, FailoverError> {
        let mut report = TickReport::default();
        let alive = self.alive_nodes().await?;

        report.promoted = self.settle_primary(&alive).await?;

        if self.state.role() == NodeRole::Primary {
            let (reassigned, unplaced) = self.reassign_orphans(&alive).await?;
            report.reassigned = reassigned;
            report.unplaced = unplaced;
        }

        Ok(report)
    }

    /// Keep exactly one alive primary; promote self when the election
    /// predicate says so and the CAS wins
    async fn settle_primary(&self, alive: &[NodeInfo]) -> Result<bool, FailoverError> {
        let raw = self.coord.get(PRIMARY_KEY).await?;
        let current: Option<PrimaryRecord> =
            raw.as_deref().and_then(|r| serde_json::from_str(r).ok());

        let primary_alive = current
            .as_ref()
            .map(|p| alive.iter().any(|n| n.node_id == p.node_id))
            .unwrap_or(false);

        if primary_alive {
            let primary_id = current.expect("checked above").node_id;
            self.state.set_role(if primary_id == self.state.node_id() {
                NodeRole::Primary
            } else {
                NodeRole::Standby
            });
            return Ok(false);
        }

        // No alive primary. Promote only if the deterministic predicate
        // picks this node.
        let winner = elect(alive);
        if winner.map(|w| w.node_id.as_str()) != Some(self.state.node_id()) {
            self.state.set_role(NodeRole::Standby);
            return Ok(false);
        }

        let now = self.clock.now();
        let record = PrimaryRecord {
            node_id: self.state.node_id().to_string(),
            since: now,
        };
        let new_value = serde_json::to_string(&record)?;

        let won = self
            .coord
            .compare_and_swap(PRIMARY_KEY, raw.as_deref(), &new_value, None)
            .await?;

        if !won {
            // Lost the race; another observer promoted first.
            self.state.set_role(NodeRole::Standby);
            return Ok(false);
        }

        self.state.set_role(NodeRole::Primary);
        info!(node_id = %self.state.node_id(), "promoted to primary");

        let notice = FailoverNotice {
            new_primary: self.state.node_id().to_string(),
            timestamp: now,
        };
        self.coord
            .publish(FAILOVER_CHANNEL, &serde_json::to_string(&notice)?)
            .await?;

        Ok(true)
    }

    /// Break expired claims held by dead nodes and hand their workflows to
    /// capable survivors. Bounded per tick to avoid stampedes.
    async fn reassign_orphans(&self, alive: &[NodeInfo]) -> Result<(usize, usize), FailoverError> {
        let now = self.clock.now();
        let mut reassigned = 0usize;
        let mut unplaced = 0usize;

        for (key, raw) in self.coord.list_prefix(CLAIMS_PREFIX).await? {
            if reassigned + unplaced >= self.config.max_redistribute_per_tick {
                debug!("redistribution budget for this tick exhausted");
                break;
            }

            let claim: JobClaim = match serde_json::from_str(&raw) {
                Ok(claim) => claim,
                Err(e) => {
                    warn!(key, "unreadable claim skipped: {}", e);
                    continue;
                }
            };

            let owner_alive = alive.iter().any(|n| n.node_id == claim.node_id);
            if owner_alive || !claim.is_expired(now) {
                continue;
            }

            // Orphan: return the workflow to pending, then hand it over.
            let workflow = match self.store.get_workflow(claim.workflow_id).await {
                Ok(workflow) => workflow,
                Err(StoreError::WorkflowNotFound(_)) => {
                    self.coord.delete(&key).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if workflow.status.is_terminal() {
                self.coord.delete(&key).await?;
                continue;
            }

            if workflow.status != WorkflowStatus::Pending {
                self.store
                    .update_workflow_status(claim.workflow_id, WorkflowStatus::Pending)
                    .await?;
            }

            match select_target(alive, &workflow.required_task_types()) {
                Some(target) => {
                    let new_claim = JobClaim::new(
                        claim.workflow_id,
                        target.node_id.clone(),
                        self.lease_ttl,
                        now,
                    );
                    let handed_over = self
                        .coord
                        .compare_and_swap(
                            &key,
                            Some(raw.as_str()),
                            &serde_json::to_string(&new_claim)?,
                            Some(self.lease_ttl),
                        )
                        .await?;

                    if handed_over {
                        info!(
                            workflow_id = %claim.workflow_id,
                            from = %claim.node_id,
                            to = %target.node_id,
                            "reassigned orphaned workflow"
                        );
                        reassigned += 1;
                    }
                }
                None => {
                    warn!(
                        workflow_id = %claim.workflow_id,
                        "no capable node for orphaned workflow, breaking claim"
                    );
                    self.coord.delete(&key).await?;
                    unplaced += 1;
                }
            }
        }

        Ok((reassigned, unplaced))
    }

    /// Monitor until shutdown: periodic ticks, plus failover notices from
    /// other nodes applied as they arrive
    pub async fn run(self, shutdown: CancellationToken) {
        info!(node_id = %self.state.node_id(), "failover controller started");

        let mut notices = match self.coord.subscribe(FAILOVER_CHANNEL).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                error!("failover channel subscription failed: {}", e);
                None
            }
        };

        loop {
            tokio::select! {
                _ = self.clock.sleep(self.config.monitor_interval) => {
                    if let Err(e) = self.tick().await {
                        error!("failover tick failed: {}", e);
                    }
                }
                notice = recv_notice(&mut notices) => {
                    match notice {
                        Some(notice) => self.observe_notice(&notice),
                        None => notices = None,
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!(node_id = %self.state.node_id(), "failover controller stopped");
    }

    /// Record another node's promotion
    pub fn observe_notice(&self, raw: &str) {
        match serde_json::from_str::<FailoverNotice>(raw) {
            Ok(notice) => {
                if notice.new_primary != self.state.node_id() {
                    self.state.set_role(NodeRole::Standby);
                }
                info!(new_primary = %notice.new_primary, "observed failover");
            }
            Err(e) => warn!("unreadable failover notice: {}", e),
        }
    }
}

/// Receive the next failover notice; pends forever once the subscription is
/// gone so the select loop falls back to timer ticks alone.
async fn recv_notice(
    subscription: &mut Option<crate::coordination::Subscription>,
) -> Option<String> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::clock::{Clock, ManualClock};
    use weft_core::model::TaskSpec;

    use crate::coordination::{claim_key, InMemoryCoordinationStore};
    use crate::failover::HeartbeatWriter;
    use crate::persistence::InMemoryWorkflowStore;

    struct Cluster {
        clock: Arc<ManualClock>,
        coord: Arc<InMemoryCoordinationStore>,
        store: Arc<InMemoryWorkflowStore>,
    }

    impl Cluster {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(Utc::now()));
            Self {
                coord: Arc::new(InMemoryCoordinationStore::with_clock(clock.clone())),
                store: Arc::new(InMemoryWorkflowStore::with_clock(clock.clone())),
                clock,
            }
        }

        fn node(&self, id: &str, priority: i32) -> (Arc<NodeState>, FailoverController) {
            let state = Arc::new(NodeState::new(id, priority, vec!["noop".to_string()]));
            let controller = FailoverController::new(
                self.coord.clone(),
                self.store.clone(),
                state.clone(),
                FailoverConfig::default().with_node_priority(priority),
                Duration::from_secs(30),
                self.clock.clone(),
            );
            (state, controller)
        }

        async fn beat(&self, state: &Arc<NodeState>) {
            HeartbeatWriter::new(
                self.coord.clone(),
                state.clone(),
                FailoverConfig::default(),
                self.clock.clone(),
            )
            .beat()
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_sole_node_promotes_itself() {
        let cluster = Cluster::new();
        let (state, controller) = cluster.node("n1", 0);
        cluster.beat(&state).await;

        let report = controller.tick().await.unwrap();
        assert!(report.promoted);
        assert_eq!(state.role(), NodeRole::Primary);

        // Second tick is a no-op: the primary is alive (itself)
        let report = controller.tick().await.unwrap();
        assert!(!report.promoted);
    }

    #[tokio::test]
    async fn test_only_election_winner_promotes() {
        let cluster = Cluster::new();
        let (s1, c1) = cluster.node("n1", 1);
        let (s2, c2) = cluster.node("n2", 5);
        cluster.beat(&s1).await;
        cluster.beat(&s2).await;

        // Lower-priority node ticks first but must not promote.
        let report = c1.tick().await.unwrap();
        assert!(!report.promoted);
        assert_eq!(s1.role(), NodeRole::Standby);

        let report = c2.tick().await.unwrap();
        assert!(report.promoted);
        assert_eq!(s2.role(), NodeRole::Primary);
    }

    #[tokio::test]
    async fn test_standby_takes_over_when_primary_heartbeat_lapses() {
        let cluster = Cluster::new();
        let (s1, c1) = cluster.node("n1", 5);
        let (s2, c2) = cluster.node("n2", 1);
        cluster.beat(&s1).await;
        cluster.beat(&s2).await;

        c1.tick().await.unwrap();
        c2.tick().await.unwrap();
        assert_eq!(s1.role(), NodeRole::Primary);
        assert_eq!(s2.role(), NodeRole::Standby);

        // n1 stops beating; n2 keeps its heartbeat fresh.
        cluster.clock.advance(Duration::from_secs(20));
        cluster.beat(&s2).await;
        cluster.clock.advance(Duration::from_secs(15));

        let report = c2.tick().await.unwrap();
        assert!(report.promoted);
        assert_eq!(s2.role(), NodeRole::Primary);
    }

    #[tokio::test]
    async fn test_orphaned_claim_reassigned_to_capable_node() {
        let cluster = Cluster::new();
        let (s2, c2) = cluster.node("n2", 1);
        cluster.beat(&s2).await;

        // A workflow claimed by n1, which is not in the roster.
        let workflow = weft_core::model::WorkflowRecord::new(
            "w",
            vec![TaskSpec::new("a", "noop")],
            cluster.clock.now(),
        );
        cluster.store.create_workflow(&workflow).await.unwrap();
        cluster
            .store
            .update_workflow_status(workflow.id, WorkflowStatus::Running)
            .await
            .unwrap();

        let dead_claim = JobClaim::new(
            workflow.id,
            "n1",
            Duration::from_secs(30),
            cluster.clock.now() - chrono::Duration::seconds(60),
        );
        cluster
            .coord
            .put(
                &claim_key(workflow.id),
                &serde_json::to_string(&dead_claim).unwrap(),
                None,
            )
            .await
            .unwrap();

        let report = c2.tick().await.unwrap();
        assert!(report.promoted);
        assert_eq!(report.reassigned, 1);

        // Claim now names n2; workflow is back to pending.
        let raw = cluster
            .coord
            .get(&claim_key(workflow.id))
            .await
            .unwrap()
            .unwrap();
        let claim: JobClaim = serde_json::from_str(&raw).unwrap();
        assert_eq!(claim.node_id, "n2");

        let workflow = cluster.store.get_workflow(workflow.id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Pending);
    }

    #[tokio::test]
    async fn test_claim_with_no_capable_node_is_broken() {
        let cluster = Cluster::new();
        let (s2, c2) = cluster.node("n2", 1); // capabilities: noop only
        cluster.beat(&s2).await;

        let workflow = weft_core::model::WorkflowRecord::new(
            "w",
            vec![TaskSpec::new("a", "gpu_transcode")],
            cluster.clock.now(),
        );
        cluster.store.create_workflow(&workflow).await.unwrap();

        let dead_claim = JobClaim::new(
            workflow.id,
            "gone",
            Duration::from_secs(30),
            cluster.clock.now() - chrono::Duration::seconds(120),
        );
        cluster
            .coord
            .put(
                &claim_key(workflow.id),
                &serde_json::to_string(&dead_claim).unwrap(),
                None,
            )
            .await
            .unwrap();

        let report = c2.tick().await.unwrap();
        assert_eq!(report.reassigned, 0);
        assert_eq!(report.unplaced, 1);
        assert!(cluster
            .coord
            .get(&claim_key(workflow.id))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_redistribution_bounded_per_tick() {
        let cluster = Cluster::new();
        let state = Arc::new(NodeState::new("n2", 1, vec!["noop".to_string()]));
        let config = FailoverConfig {
            max_redistribute_per_tick: 2,
            ..FailoverConfig::default()
        };
        let controller = FailoverController::new(
            cluster.coord.clone(),
            cluster.store.clone(),
            state.clone(),
            config,
            Duration::from_secs(30),
            cluster.clock.clone(),
        );
        cluster.beat(&state).await;

        for _ in 0..5 {
            let workflow = weft_core::model::WorkflowRecord::new(
                "w",
                vec![TaskSpec::new("a", "noop")],
                cluster.clock.now(),
            );
            cluster.store.create_workflow(&workflow).await.unwrap();
            let claim = JobClaim::new(
                workflow.id,
                "gone",
                Duration::from_secs(30),
                cluster.clock.now() - chrono::Duration::seconds(60),
            );
            cluster
                .coord
                .put(
                    &claim_key(workflow.id),
                    &serde_json::to_string(&claim).unwrap(),
                    None,
                )
                .await
                .unwrap();
        }

        let report = controller.tick().await.unwrap();
        assert_eq!(report.reassigned, 2);

        let report = controller.tick().await.unwrap();
        assert_eq!(report.reassigned, 2);
    }

    #[tokio::test]
    async fn test_standby_records_observed_promotion() {
        let cluster = Cluster::new();
        let (state, controller) = cluster.node("n1", 0);
        state.set_role(NodeRole::Primary);

        let notice = FailoverNotice {
            new_primary: "n9".to_string(),
            timestamp: cluster.clock.now(),
        };
        controller.observe_notice(&serde_json::to_string(&notice).unwrap());

        assert_eq!(state.role(), NodeRole::Standby);
    }
}
