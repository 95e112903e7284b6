//! # Weft Core
//!
//! Domain model for the Weft workflow engine: workflow/task records and
//! status machines, checkpoint and failure shapes, the cluster roster,
//! DAG helpers, the task registry, the injected clock, and configuration.
//!
//! This crate performs no I/O; the execution engine and its ports live in
//! `weft-engine`, the runnable node in `weft-node`.

pub mod clock;
pub mod config;
pub mod dag;
pub mod handlers;
pub mod model;
pub mod registry;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{AnalyticsConfig, ConfigError, EngineConfig, FailoverConfig};
pub use dag::TopologyError;
pub use model::{
    AnalyticsEvent, Checkpoint, CheckpointState, FailoverNotice, FailurePattern, JobClaim,
    NodeInfo, NodeRole, ResolutionStatus, Severity, TaskRecord, TaskSpec, TaskStatus,
    WorkflowRecord, WorkflowStatus,
};
pub use registry::{HandlerError, TaskContext, TaskHandler, TaskRegistry};
