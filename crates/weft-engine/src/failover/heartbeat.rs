//! Node heartbeat writer
//!
//! Every node periodically writes its `NodeInfo` under `nodes/{node_id}`
//! with a TTL of the heartbeat TTL, so a crashed node disappears from the
//! roster without anyone cleaning up after it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weft_core::clock::{Clock, SharedClock};
use weft_core::config::FailoverConfig;

use crate::coordination::{node_key, CoordError, CoordinationStore};

use super::NodeState;

/// Periodic heartbeat loop
pub struct HeartbeatWriter {
    coord: Arc<dyn CoordinationStore>,
    state: Arc<NodeState>,
    config: FailoverConfig,
    clock: SharedClock,
}

impl HeartbeatWriter {
    pub fn new(
        coord: Arc<dyn CoordinationStore>,
        state: Arc<NodeState>,
        config: FailoverConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            coord,
            state,
            config,
            clock,
        }
    }

    /// Write one heartbeat
    pub async fn beat(&self) -> Result<(), CoordError> {
        let info = self.state.info(self.clock.now());
        let value =
            serde_json::to_string(&info).map_err(|e| CoordError::Serialization(e.to_string()))?;
        self.coord
            .put(
                &node_key(&info.node_id),
                &value,
                Some(self.config.heartbeat_ttl),
            )
            .await?;
        debug!(node_id = %info.node_id, load = info.load, role = %info.role, "heartbeat");
        Ok(())
    }

    /// Beat until shutdown, then drop the heartbeat key so the roster
    /// reflects the departure immediately
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            node_id = %self.state.node_id(),
            interval_secs = self.config.heartbeat_interval.as_secs(),
            "heartbeat writer started"
        );

        loop {
            if let Err(e) = self.beat().await {
                error!("heartbeat write failed: {}", e);
            }

            tokio::select! {
                _ = self.clock.sleep(self.config.heartbeat_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        let _ = self.coord.delete(&node_key(self.state.node_id())).await;
        info!(node_id = %self.state.node_id(), "heartbeat writer stopped");
    }
}
