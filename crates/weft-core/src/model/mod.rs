//! Domain records shared by the engine, ports and node

mod analytics;
mod checkpoint;
mod cluster;
mod failure;
mod workflow;

pub use analytics::AnalyticsEvent;
pub use checkpoint::{Checkpoint, CheckpointState, ResourceSnapshot, TaskSnapshot};
pub use cluster::{FailoverNotice, JobClaim, NodeInfo, NodeRole};
pub use failure::{FailurePattern, ResolutionStatus, Severity};
pub use workflow::{TaskRecord, TaskSpec, TaskStatus, WorkflowRecord, WorkflowStatus};
