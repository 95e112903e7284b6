//! # Weft Engine
//!
//! A PostgreSQL-backed workflow execution engine for reliable, distributed
//! task coordination.
//!
//! ## Features
//!
//! - **DAG scheduling**: dependency-ordered parallel dispatch under
//!   per-workflow and global concurrency caps
//! - **Checkpointed progress**: a durable task-state snapshot after every
//!   result-bearing transition, with guarded restore on recovery
//! - **Staged recovery**: failure classification, severity-driven retry
//!   strategies with bounded exponential backoff, manual-intervention parking
//! - **Failover**: heartbeat roster, deterministic compare-and-set primary
//!   election, orphan-claim redistribution
//! - **Analytics intake**: bounded queue with explicit backpressure and
//!   batched, transactional persistence
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (per-workflow scheduler loops, task runner, checkpoints)   │
//! └───────────────┬─────────────────────────────┬───────────────┘
//!                 │                             │
//!                 ▼                             ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────┐
//! │        WorkflowStore          │ │     CoordinationStore     │
//! │ (workflows, tasks,            │ │ (heartbeats, primary,     │
//! │  checkpoints, failures,       │ │  job claims, pub/sub)     │
//! │  analytics rows)              │ │                           │
//! └───────────────────────────────┘ └───────────────────────────┘
//!                 ▲                             ▲
//!                 │                             │
//! ┌───────────────┴───────────────┐ ┌───────────┴───────────────┐
//! │   RecoveryController          │ │    FailoverController     │
//! │   AnalyticsPipeline           │ │    HeartbeatWriter        │
//! └───────────────────────────────┘ └───────────────────────────┘
//! ```
//!
//! Both ports ship an in-memory implementation, so the whole engine runs in
//! tests without a database.

pub mod analytics;
pub mod coordination;
pub mod engine;
pub mod failover;
pub mod persistence;
pub mod recovery;

/// Prelude for common imports
pub mod prelude {
    pub use crate::analytics::{AnalyticsPipeline, EmitError, EventSink, RetentionCleaner};
    pub use crate::coordination::{
        CoordError, CoordinationStore, InMemoryCoordinationStore, PostgresCoordinationStore,
    };
    pub use crate::engine::{EngineError, HealthSnapshot, WorkflowEngine};
    pub use crate::failover::{FailoverController, HeartbeatWriter, NodeState};
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::recovery::{RecoveryController, RecoveryDecision, RetryStage, RetryStrategy};
}

// Re-export key types at crate root
pub use analytics::{AnalyticsPipeline, EventSink, RetentionCleaner};
pub use coordination::{CoordinationStore, InMemoryCoordinationStore, PostgresCoordinationStore};
pub use engine::{EngineError, HealthSnapshot, WorkflowEngine};
pub use failover::{FailoverController, HeartbeatWriter, NodeState};
pub use persistence::{
    run_migrations, InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
};
pub use recovery::{RecoveryController, RecoveryDecision, RetryStage, RetryStrategy};
