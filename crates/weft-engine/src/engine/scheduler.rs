//! Workflow engine
//!
//! Owns the end-to-end lifecycle of workflows on this node: submission,
//! claim-guarded scheduling, dependency-ordered parallel dispatch under
//! per-workflow and global caps, checkpointing, recovery hand-off,
//! cancellation, pause/resume and failover adoption.
//!
//! One scheduler loop runs per active workflow; a `JobClaim` in the
//! coordination store guarantees a single logical owner per workflow, so
//! loops never contend on workflow state - all mutations flow through the
//! claim holder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use weft_core::clock::{Clock, SharedClock};
use weft_core::config::EngineConfig;
use weft_core::dag::{self, TopologyError};
use weft_core::model::{
    AnalyticsEvent, Checkpoint, FailurePattern, JobClaim, NodeRole, ResolutionStatus, TaskRecord,
    TaskSpec, TaskStatus, WorkflowRecord, WorkflowStatus,
};
use weft_core::registry::{HandlerError, TaskContext, TaskRegistry};

use crate::analytics::EventSink;
use crate::coordination::{claim_key, CoordError, CoordinationStore, CLAIMS_PREFIX};
use crate::failover::NodeState;
use crate::persistence::{StoreError, WorkflowStore};
use crate::recovery::{RecoveryController, RecoveryDecision, RecoveryError};

use super::runner::{self, RunOutcome};

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad DAG at submit time
    #[error("invalid topology: {0}")]
    InvalidTopology(#[from] TopologyError),

    /// No handler registered for a submitted task type
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    /// Workflow not found
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    /// Operation on a workflow that already reached a terminal status
    #[error("workflow {id} is already terminal ({status})")]
    AlreadyTerminal { id: Uuid, status: WorkflowStatus },

    /// Caller contract violation (wrong source status for the operation)
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Too many active workflows on this node; transient, retryable
    #[error("capacity exceeded: {active}/{cap} active workflows")]
    CapacityExceeded { active: usize, cap: usize },

    /// Another live node owns the workflow's claim
    #[error("workflow {0} is claimed by another node")]
    ClaimHeld(Uuid),

    /// Persistence port failure
    #[error("store error: {0}")]
    Store(StoreError),

    /// Coordination port failure
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::WorkflowNotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<RecoveryError> for EngineError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::Store(inner) => inner.into(),
        }
    }
}

/// Health snapshot for the node surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub node_role: NodeRole,
    pub active_workflows: usize,
    pub queue_depth: usize,
    pub dropped_events: u64,
}

/// Per-workflow scheduler handle
struct WorkflowHandle {
    cancel: tokio_util::sync::CancellationToken,
    pause: watch::Sender<bool>,
    #[allow(dead_code)] // Held so the scheduler task is traceable from the handle
    join: JoinHandle<()>,
}

/// Events the scheduler loop waits on
enum LoopEvent {
    /// A dispatched task finished (in any way)
    Finished {
        task_id: String,
        attempt: u32,
        outcome: RunOutcome,
    },
    /// A retry backoff elapsed and the task was re-queued
    Requeued { task_id: String },
}

/// What a dispatch attempt did
enum Dispatch {
    Started,
    NoPermit,
    Rejected,
}

/// The workflow engine
///
/// Construct with [`WorkflowEngine::new`]; the engine is shared behind an
/// `Arc` because scheduler loops are spawned tasks holding a reference.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    coord: Arc<dyn CoordinationStore>,
    registry: Arc<TaskRegistry>,
    recovery: Arc<RecoveryController>,
    sink: EventSink,
    node_state: Arc<NodeState>,
    config: EngineConfig,
    clock: SharedClock,
    global_slots: Arc<Semaphore>,
    active: Mutex<HashMap<Uuid, WorkflowHandle>>,
    shutdown: tokio_util::sync::CancellationToken,
    /// Back-reference for spawning scheduler loops from `&self`
    weak_self: std::sync::Weak<WorkflowEngine>,
}

impl WorkflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        coord: Arc<dyn CoordinationStore>,
        registry: Arc<TaskRegistry>,
        recovery: Arc<RecoveryController>,
        sink: EventSink,
        node_state: Arc<NodeState>,
        config: EngineConfig,
        clock: SharedClock,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            store,
            coord,
            registry,
            recovery,
            sink,
            node_state,
            global_slots: Arc::new(Semaphore::new(config.global_task_cap.max(1))),
            config,
            clock,
            active: Mutex::new(HashMap::new()),
            shutdown: tokio_util::sync::CancellationToken::new(),
            weak_self: weak_self.clone(),
        })
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Validate and persist a new workflow (status Pending)
    #[instrument(skip(self, tasks, metadata), fields(task_count = tasks.len()))]
    pub async fn create(
        &self,
        name: impl Into<String> + std::fmt::Debug,
        tasks: Vec<TaskSpec>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Uuid, EngineError> {
        dag::validate(&tasks)?;
        for task in &tasks {
            if !self.registry.contains(&task.task_type) {
                return Err(EngineError::UnknownTaskType(task.task_type.clone()));
            }
        }

        let mut workflow = WorkflowRecord::new(name, tasks, self.clock.now());
        if let Some(metadata) = metadata {
            workflow.metadata = metadata;
        }

        self.store.create_workflow(&workflow).await?;
        self.emit_workflow(workflow.id, WorkflowStatus::Pending);
        info!(workflow_id = %workflow.id, "created workflow");
        Ok(workflow.id)
    }

    /// Begin asynchronous scheduling of a Pending (or Paused) workflow
    ///
    /// Acquires the job claim, marks the workflow Running and returns
    /// immediately; the scheduler loop runs in the background.
    #[instrument(skip(self))]
    pub async fn execute(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                id: workflow_id,
                status: workflow.status,
            });
        }
        match workflow.status {
            WorkflowStatus::Pending => {}
            WorkflowStatus::Paused => return self.resume(workflow_id).await,
            other => {
                return Err(EngineError::InvalidTransition(format!(
                    "cannot execute workflow in status {}",
                    other
                )))
            }
        }

        {
            let active = self.active.lock();
            if active.contains_key(&workflow_id) {
                return Err(EngineError::InvalidTransition(
                    "workflow is already scheduled on this node".to_string(),
                ));
            }
            if active.len() >= self.config.max_active_workflows {
                return Err(EngineError::CapacityExceeded {
                    active: active.len(),
                    cap: self.config.max_active_workflows,
                });
            }
        }

        self.acquire_claim(workflow_id).await?;
        self.store
            .update_workflow_status(workflow_id, WorkflowStatus::Running)
            .await?;
        self.emit_workflow(workflow_id, WorkflowStatus::Running);
        self.spawn_scheduler(workflow_id);
        Ok(())
    }

    /// Last-persisted workflow record including all task states
    pub async fn status(&self, workflow_id: Uuid) -> Result<WorkflowRecord, EngineError> {
        Ok(self.store.get_workflow(workflow_id).await?)
    }

    /// Cancel a workflow; idempotent
    ///
    /// In-flight tasks observe cancellation at their next suspension point
    /// and their completions are still recorded.
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Ok(());
        }

        let handle_cancel = {
            let active = self.active.lock();
            active.get(&workflow_id).map(|h| h.cancel.clone())
        };

        match handle_cancel {
            Some(token) => {
                // The scheduler loop drains in-flight tasks and finalizes.
                token.cancel();
            }
            None => {
                self.store
                    .update_workflow_status(workflow_id, WorkflowStatus::Cancelled)
                    .await?;
                self.emit_workflow(workflow_id, WorkflowStatus::Cancelled);
                let _ = self.coord.delete(&claim_key(workflow_id)).await;
            }
        }
        info!(%workflow_id, "cancellation requested");
        Ok(())
    }

    /// Stop dispatching new tasks; in-flight tasks run to completion
    #[instrument(skip(self))]
    pub async fn pause(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Running {
            return Err(EngineError::InvalidTransition(format!(
                "cannot pause workflow in status {}",
                workflow.status
            )));
        }

        if let Some(handle) = self.active.lock().get(&workflow_id) {
            let _ = handle.pause.send(true);
        }
        self.store
            .update_workflow_status(workflow_id, WorkflowStatus::Paused)
            .await?;
        self.emit_workflow(workflow_id, WorkflowStatus::Paused);
        Ok(())
    }

    /// Re-enter normal scheduling after a pause
    #[instrument(skip(self))]
    pub async fn resume(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Paused {
            return Err(EngineError::InvalidTransition(format!(
                "cannot resume workflow in status {}",
                workflow.status
            )));
        }

        self.store
            .update_workflow_status(workflow_id, WorkflowStatus::Running)
            .await?;
        self.emit_workflow(workflow_id, WorkflowStatus::Running);

        let resumed_in_place = {
            let active = self.active.lock();
            match active.get(&workflow_id) {
                Some(handle) => {
                    let _ = handle.pause.send(false);
                    true
                }
                None => false,
            }
        };

        if !resumed_in_place {
            self.acquire_claim(workflow_id).await?;
            self.spawn_scheduler(workflow_id);
        }
        Ok(())
    }

    /// Adopt a workflow whose claim names this node (failover hand-off)
    ///
    /// Restores from the latest usable checkpoint, resets interrupted runs
    /// (never regressing completed tasks) and resumes scheduling.
    #[instrument(skip(self))]
    pub async fn resume_from_claim(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let raw = self.coord.get(&claim_key(workflow_id)).await?;
        let claim: JobClaim = match raw.as_deref().map(serde_json::from_str) {
            Some(Ok(claim)) => claim,
            _ => return Err(EngineError::ClaimHeld(workflow_id)),
        };
        if claim.node_id != self.config.node_id {
            return Err(EngineError::ClaimHeld(workflow_id));
        }
        if self.active.lock().contains_key(&workflow_id) {
            return Ok(());
        }

        let workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            let _ = self.coord.delete(&claim_key(workflow_id)).await;
            return Ok(());
        }

        // Checkpoint guard: never restore a snapshot behind durable
        // completions. The store remains authoritative either way.
        let _restored = self.recovery.restore_state(workflow_id).await?;
        let reset = self.store.reset_interrupted_tasks(workflow_id).await?;
        if !reset.is_empty() {
            info!(%workflow_id, ?reset, "reset interrupted tasks for re-dispatch");
        }

        if workflow.status != WorkflowStatus::Paused {
            self.store
                .update_workflow_status(workflow_id, WorkflowStatus::Running)
                .await?;
            self.emit_workflow(workflow_id, WorkflowStatus::Running);
        }
        self.spawn_scheduler(workflow_id);
        info!(%workflow_id, "adopted workflow from claim");
        Ok(())
    }

    /// Scan for claims naming this node and adopt any not already scheduled
    pub async fn adopt_claims(&self) -> Result<usize, EngineError> {
        let mut adopted = 0;
        for (_, raw) in self.coord.list_prefix(CLAIMS_PREFIX).await? {
            let Ok(claim) = serde_json::from_str::<JobClaim>(&raw) else {
                continue;
            };
            if claim.node_id != self.config.node_id
                || self.active.lock().contains_key(&claim.workflow_id)
            {
                continue;
            }
            match self.resume_from_claim(claim.workflow_id).await {
                Ok(()) => adopted += 1,
                Err(e) => warn!(workflow_id = %claim.workflow_id, "claim adoption failed: {}", e),
            }
        }
        Ok(adopted)
    }

    /// Dispatch workflows sitting in Pending in durable storage
    ///
    /// Primary duty: standbys rely on claims instead. Stops at the first
    /// capacity refusal.
    pub async fn dispatch_pending(&self, limit: usize) -> Result<usize, EngineError> {
        let pending = self.store.list_pending_workflows(limit).await?;
        let mut started = 0;
        for workflow in pending {
            match self.execute(workflow.id).await {
                Ok(()) => started += 1,
                Err(EngineError::CapacityExceeded { .. }) => break,
                Err(
                    EngineError::ClaimHeld(_)
                    | EngineError::InvalidTransition(_)
                    | EngineError::AlreadyTerminal { .. }
                    | EngineError::NotFound(_),
                ) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    /// Node-surface health
    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            node_role: self.node_state.role(),
            active_workflows: self.active.lock().len(),
            queue_depth: self.sink.queue_depth(),
            dropped_events: self.sink.dropped(),
        }
    }

    /// Workflows currently scheduled on this node
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Drain all scheduler loops: workflows return to Pending with claims
    /// released, ready for adoption elsewhere
    pub async fn shutdown(&self) {
        info!("engine shutdown requested");
        self.shutdown.cancel();

        let deadline = self.clock.now()
            + chrono::Duration::from_std(self.config.shutdown_grace * 2).unwrap_or_else(|_| chrono::Duration::zero());
        while self.active_count() > 0 {
            if self.clock.now() >= deadline {
                warn!(
                    remaining = self.active_count(),
                    "shutdown grace elapsed with schedulers still draining"
                );
                break;
            }
            self.clock.sleep(Duration::from_millis(50)).await;
        }
        info!("engine shutdown complete");
    }

    // =========================================================================
    // Scheduler loop
    // =========================================================================

    fn spawn_scheduler(&self, workflow_id: Uuid) {
        let cancel = self.shutdown.child_token();
        let (pause_tx, pause_rx) = watch::channel(false);
        let engine = self.weak_self.upgrade().expect("engine dropped");
        let loop_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            engine.run_workflow(workflow_id, loop_cancel, pause_rx).await;
        });

        self.active.lock().insert(
            workflow_id,
            WorkflowHandle {
                cancel,
                pause: pause_tx,
                join,
            },
        );
    }

    async fn run_workflow(
        self: Arc<Self>,
        workflow_id: Uuid,
        cancel: tokio_util::sync::CancellationToken,
        mut pause_rx: watch::Receiver<bool>,
    ) {
        debug!(%workflow_id, "scheduler loop started");
        if let Err(e) = self
            .schedule_until_done(workflow_id, &cancel, &mut pause_rx)
            .await
        {
            error!(%workflow_id, "scheduler loop failed: {}", e);
        }
        self.active.lock().remove(&workflow_id);
        self.report_load();
        debug!(%workflow_id, "scheduler loop exited");
    }

    async fn schedule_until_done(
        &self,
        workflow_id: Uuid,
        cancel: &tokio_util::sync::CancellationToken,
        pause_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let mut version = self.next_checkpoint_version(workflow_id).await?;
        let mut in_flight: JoinSet<LoopEvent> = JoinSet::new();
        let mut running = 0usize;

        loop {
            // Node shutdown: park the workflow for another node instead of
            // cancelling the caller's work.
            if self.shutdown.is_cancelled() {
                self.drain(workflow_id, &mut in_flight, &mut version).await;
                self.park(workflow_id).await;
                return Ok(());
            }

            // Explicit cancellation: record whatever finishes, then finalize.
            if cancel.is_cancelled() {
                self.drain(workflow_id, &mut in_flight, &mut version).await;
                self.finalize_cancelled(workflow_id, &mut version).await?;
                return Ok(());
            }

            let workflow = self.store.get_workflow(workflow_id).await?;
            if workflow.status.is_terminal() {
                return Ok(());
            }

            // Optional global cap on the whole workflow's wall-clock time.
            if let Some(limit) = self.config.workflow_timeout {
                let deadline =
                    workflow.created_at + chrono::Duration::from_std(limit).unwrap_or_else(|_| chrono::Duration::zero());
                if self.clock.now() >= deadline {
                    warn!(%workflow_id, "workflow exceeded its global timeout, cancelling");
                    cancel.cancel();
                    self.drain(workflow_id, &mut in_flight, &mut version).await;
                    self.finalize_cancelled(workflow_id, &mut version).await?;
                    return Ok(());
                }
            }

            let paused = *pause_rx.borrow() || workflow.status == WorkflowStatus::Paused;

            if !paused {
                let workflow_cap = workflow
                    .max_concurrency
                    .unwrap_or(self.config.workflow_task_cap)
                    .max(1);
                let slots = workflow_cap.saturating_sub(running);
                let ready = dag::ready_set(&workflow.tasks);

                for task in ready.into_iter().take(slots) {
                    match self
                        .dispatch(workflow_id, task, cancel, &mut in_flight)
                        .await?
                    {
                        Dispatch::Started => running += 1,
                        Dispatch::NoPermit => break,
                        Dispatch::Rejected => continue,
                    }
                }
            }
            self.report_load();

            if in_flight.is_empty() {
                if paused {
                    tokio::select! {
                        _ = pause_rx.changed() => {}
                        _ = cancel.cancelled() => {}
                        _ = self.clock.sleep(self.config.lease_ttl / 2) => {
                            if !self.renew_claim(workflow_id).await {
                                warn!(%workflow_id, "lost claim while paused, stopping scheduler");
                                return Ok(());
                            }
                        }
                    }
                    continue;
                }

                let workflow = self.store.get_workflow(workflow_id).await?;
                let ready_empty = dag::ready_set(&workflow.tasks).is_empty();
                if ready_empty && workflow.running_count() == 0 {
                    self.finalize(workflow_id, &mut version).await?;
                    return Ok(());
                }

                // Ready tasks exist but the global cap is saturated; retry shortly.
                tokio::select! {
                    _ = self.clock.sleep(Duration::from_millis(200)) => {}
                    _ = cancel.cancelled() => {}
                }
                continue;
            }

            tokio::select! {
                Some(joined) = in_flight.join_next() => {
                    let event = match joined {
                        Ok(event) => event,
                        Err(join_error) => {
                            error!(%workflow_id, "scheduler subtask panicked: {}", join_error);
                            running = running.saturating_sub(1);
                            continue;
                        }
                    };
                    match event {
                        LoopEvent::Finished { task_id, attempt, outcome } => {
                            running = running.saturating_sub(1);
                            self.handle_outcome(
                                workflow_id,
                                &task_id,
                                attempt,
                                outcome,
                                &mut in_flight,
                                &mut version,
                            )
                            .await?;
                        }
                        LoopEvent::Requeued { task_id } => {
                            debug!(%workflow_id, task_id, "task re-queued after backoff");
                            self.checkpoint(workflow_id, &mut version).await?;
                        }
                    }
                }
                _ = cancel.cancelled() => {}
                _ = pause_rx.changed() => {}
                _ = self.clock.sleep(self.config.lease_ttl / 2) => {
                    if !self.renew_claim(workflow_id).await {
                        warn!(%workflow_id, "lost claim, stopping scheduler");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Dispatch one ready task into the runner pool
    async fn dispatch(
        &self,
        workflow_id: Uuid,
        task: &TaskRecord,
        cancel: &tokio_util::sync::CancellationToken,
        in_flight: &mut JoinSet<LoopEvent>,
    ) -> Result<Dispatch, EngineError> {
        let Some(handler) = self.registry.get(&task.task_type) else {
            // Validated at submit; can only happen if the registry changed.
            warn!(%workflow_id, task_id = %task.id, task_type = %task.task_type, "no handler registered");
            self.store
                .record_task_transition(
                    workflow_id,
                    &task.id,
                    TaskStatus::Pending,
                    TaskStatus::Running,
                    None,
                    None,
                )
                .await?;
            self.store
                .record_task_transition(
                    workflow_id,
                    &task.id,
                    TaskStatus::Running,
                    TaskStatus::Failed,
                    None,
                    Some(format!("no handler registered for type {}", task.task_type)),
                )
                .await?;
            self.emit_task(workflow_id, &task.id, TaskStatus::Failed);
            return Ok(Dispatch::Rejected);
        };

        let Ok(permit) = Arc::clone(&self.global_slots).try_acquire_owned() else {
            return Ok(Dispatch::NoPermit);
        };

        self.store
            .record_task_transition(
                workflow_id,
                &task.id,
                TaskStatus::Pending,
                TaskStatus::Running,
                None,
                None,
            )
            .await?;

        let attempt = task.retry_count + 1;
        let ctx = TaskContext::new(workflow_id, task.id.clone(), attempt)
            .with_cancellation(cancel.child_token());
        let config = task.config.clone();
        let timeout = task.timeout;
        let grace = self.config.shutdown_grace;
        let clock = Arc::clone(&self.clock);
        let task_id = task.id.clone();

        debug!(%workflow_id, task_id, attempt, "dispatching task");
        in_flight.spawn(async move {
            let outcome = runner::run_task(handler, config, ctx, timeout, grace, clock).await;
            drop(permit);
            LoopEvent::Finished {
                task_id,
                attempt,
                outcome,
            }
        });

        Ok(Dispatch::Started)
    }

    /// Apply a finished task's outcome
    async fn handle_outcome(
        &self,
        workflow_id: Uuid,
        task_id: &str,
        attempt: u32,
        outcome: RunOutcome,
        in_flight: &mut JoinSet<LoopEvent>,
        version: &mut i64,
    ) -> Result<(), EngineError> {
        match outcome {
            RunOutcome::Success(result) => {
                self.store
                    .record_task_transition(
                        workflow_id,
                        task_id,
                        TaskStatus::Running,
                        TaskStatus::Completed,
                        Some(result),
                        None,
                    )
                    .await?;
                self.emit_task(workflow_id, task_id, TaskStatus::Completed);
                self.checkpoint(workflow_id, version).await?;
            }
            RunOutcome::Failure(error) => {
                self.handle_failure(workflow_id, task_id, attempt, error, in_flight, version)
                    .await?;
            }
            RunOutcome::Abandoned => {
                self.store
                    .record_task_transition(
                        workflow_id,
                        task_id,
                        TaskStatus::Running,
                        TaskStatus::Failed,
                        None,
                        Some("AbandonedOnShutdown: handler did not observe cancellation".into()),
                    )
                    .await?;
                self.emit_task(workflow_id, task_id, TaskStatus::Failed);
                self.checkpoint(workflow_id, version).await?;
            }
        }
        Ok(())
    }

    /// Route a handler failure through the recovery controller
    async fn handle_failure(
        &self,
        workflow_id: Uuid,
        task_id: &str,
        attempt: u32,
        error: HandlerError,
        in_flight: &mut JoinSet<LoopEvent>,
        version: &mut i64,
    ) -> Result<(), EngineError> {
        let severity = self.recovery.classify(&error.error_type);
        let pattern = FailurePattern::new(
            workflow_id,
            task_id,
            &error.error_type,
            &error.message,
            severity,
            attempt.saturating_sub(1),
            self.clock.now(),
        )
        .with_context(error.context.clone());
        self.store.record_failure(&pattern).await?;

        let workflow = self.store.get_workflow(workflow_id).await?;
        let max_retries = workflow
            .task(task_id)
            .map(|t| t.max_retries)
            .unwrap_or_default();

        match self.recovery.decide(&pattern, max_retries) {
            RecoveryDecision::Retry {
                stage,
                delay,
                attempt: next_attempt,
            } => {
                info!(
                    %workflow_id,
                    task_id,
                    %severity,
                    %stage,
                    delay_secs = delay.as_secs(),
                    next_attempt,
                    "scheduling retry"
                );
                // Verify the latest checkpoint before re-entering scheduling;
                // a stale one is discarded in favor of durable task rows.
                let _ = self.recovery.restore_state(workflow_id).await?;

                // The task stays Running in the store until the backoff
                // elapses, so the ready set cannot re-dispatch it early.
                let engine = self.weak_self.upgrade().expect("engine dropped");
                let task_id = task_id.to_string();
                let error_text = error.to_string();
                in_flight.spawn(async move {
                    engine.recovery.wait_backoff(delay).await;
                    if let Err(e) = engine
                        .store
                        .record_task_transition(
                            workflow_id,
                            &task_id,
                            TaskStatus::Running,
                            TaskStatus::Pending,
                            None,
                            Some(error_text),
                        )
                        .await
                    {
                        error!(%workflow_id, task_id, "retry re-queue failed: {}", e);
                    }
                    LoopEvent::Requeued { task_id }
                });
            }
            RecoveryDecision::GiveUp { resolution } => {
                warn!(
                    %workflow_id,
                    task_id,
                    %severity,
                    %resolution,
                    "giving up on task: {}",
                    error
                );
                self.store
                    .record_task_transition(
                        workflow_id,
                        task_id,
                        TaskStatus::Running,
                        TaskStatus::Failed,
                        None,
                        Some(error.to_string()),
                    )
                    .await?;
                self.store
                    .update_failure_resolution(pattern.id, resolution)
                    .await?;
                if resolution == ResolutionStatus::PendingManualIntervention {
                    self.sink.emit_sampled(
                        AnalyticsEvent::new(
                            "recovery.manual_intervention",
                            serde_json::json!({
                                "workflow_id": workflow_id,
                                "task_id": task_id,
                                "error_type": error.error_type,
                            }),
                            self.clock.now(),
                        ),
                    );
                }
                self.emit_task(workflow_id, task_id, TaskStatus::Failed);
                self.checkpoint(workflow_id, version).await?;
            }
        }
        Ok(())
    }

    /// Await every in-flight run and record its outcome without spawning
    /// retries (used on cancellation and shutdown)
    async fn drain(
        &self,
        workflow_id: Uuid,
        in_flight: &mut JoinSet<LoopEvent>,
        version: &mut i64,
    ) {
        while let Some(joined) = in_flight.join_next().await {
            let Ok(LoopEvent::Finished {
                task_id, outcome, ..
            }) = joined
            else {
                continue;
            };

            let (to, result, error) = match outcome {
                RunOutcome::Success(result) => (TaskStatus::Completed, Some(result), None),
                RunOutcome::Failure(e) => (TaskStatus::Failed, None, Some(e.to_string())),
                RunOutcome::Abandoned => (
                    TaskStatus::Failed,
                    None,
                    Some("AbandonedOnShutdown: handler did not observe cancellation".to_string()),
                ),
            };
            if let Err(e) = self
                .store
                .record_task_transition(workflow_id, &task_id, TaskStatus::Running, to, result, error)
                .await
            {
                error!(%workflow_id, task_id, "drain transition failed: {}", e);
                continue;
            }
            self.emit_task(workflow_id, &task_id, to);
            if let Err(e) = self.checkpoint(workflow_id, version).await {
                error!(%workflow_id, "drain checkpoint failed: {}", e);
            }
        }
    }

    /// Mark unreachable tasks Skipped and settle the final status
    async fn finalize(
        &self,
        workflow_id: Uuid,
        version: &mut i64,
    ) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;

        // Fail-fast: descendants of failed (or skipped) tasks can never run.
        let mut statuses: HashMap<String, TaskStatus> = workflow
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect();
        let mut to_skip: Vec<String> = Vec::new();
        let mut changed = true;
        while changed {
            changed = false;
            for task in &workflow.tasks {
                if statuses[&task.id] != TaskStatus::Pending {
                    continue;
                }
                let blocked = task.dependencies.iter().any(|dep| {
                    matches!(
                        statuses.get(dep),
                        Some(TaskStatus::Failed) | Some(TaskStatus::Skipped)
                    )
                });
                if blocked {
                    statuses.insert(task.id.clone(), TaskStatus::Skipped);
                    to_skip.push(task.id.clone());
                    changed = true;
                }
            }
        }

        for task_id in &to_skip {
            self.store
                .record_task_transition(
                    workflow_id,
                    task_id,
                    TaskStatus::Pending,
                    TaskStatus::Skipped,
                    None,
                    None,
                )
                .await?;
            self.emit_task(workflow_id, task_id, TaskStatus::Skipped);
        }
        if !to_skip.is_empty() {
            self.checkpoint(workflow_id, version).await?;
        }

        let workflow = self.store.get_workflow(workflow_id).await?;
        let all_completed = workflow
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Completed);
        let final_status = if all_completed {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };

        self.store
            .update_workflow_status(workflow_id, final_status)
            .await?;
        self.emit_workflow(workflow_id, final_status);
        let _ = self.coord.delete(&claim_key(workflow_id)).await;
        info!(%workflow_id, status = %final_status, "workflow finished");
        Ok(())
    }

    async fn finalize_cancelled(
        &self,
        workflow_id: Uuid,
        version: &mut i64,
    ) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if !workflow.status.is_terminal() {
            self.store
                .update_workflow_status(workflow_id, WorkflowStatus::Cancelled)
                .await?;
            self.emit_workflow(workflow_id, WorkflowStatus::Cancelled);
            self.checkpoint(workflow_id, version).await?;
        }
        let _ = self.coord.delete(&claim_key(workflow_id)).await;
        info!(%workflow_id, "workflow cancelled");
        Ok(())
    }

    /// Return the workflow to Pending and release the claim (node shutdown)
    async fn park(&self, workflow_id: Uuid) {
        match self.store.get_workflow(workflow_id).await {
            Ok(workflow) if !workflow.status.is_terminal() => {
                if let Err(e) = self
                    .store
                    .update_workflow_status(workflow_id, WorkflowStatus::Pending)
                    .await
                {
                    error!(%workflow_id, "failed to park workflow: {}", e);
                } else {
                    self.emit_workflow(workflow_id, WorkflowStatus::Pending);
                    info!(%workflow_id, "parked workflow for recovery");
                }
            }
            Ok(_) => {}
            Err(e) => error!(%workflow_id, "failed to load workflow while parking: {}", e),
        }
        let _ = self.coord.delete(&claim_key(workflow_id)).await;
    }

    // =========================================================================
    // Claims, checkpoints, load
    // =========================================================================

    async fn acquire_claim(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        let key = claim_key(workflow_id);
        let claim = JobClaim::new(
            workflow_id,
            self.config.node_id.clone(),
            self.config.lease_ttl,
            self.clock.now(),
        );
        let value =
            serde_json::to_string(&claim).map_err(|e| CoordError::Serialization(e.to_string()))?;

        if self
            .coord
            .compare_and_swap(&key, None, &value, Some(self.config.lease_ttl))
            .await?
        {
            return Ok(());
        }

        match self.coord.get(&key).await? {
            Some(raw) => {
                let existing: JobClaim = serde_json::from_str(&raw)
                    .map_err(|e| CoordError::Serialization(e.to_string()))?;
                if existing.node_id == self.config.node_id {
                    // Stale claim from a previous run of this node.
                    self.coord
                        .put(&key, &value, Some(self.config.lease_ttl))
                        .await?;
                    Ok(())
                } else {
                    Err(EngineError::ClaimHeld(workflow_id))
                }
            }
            None => {
                // Expired between the CAS and the read; one more attempt.
                if self
                    .coord
                    .compare_and_swap(&key, None, &value, Some(self.config.lease_ttl))
                    .await?
                {
                    Ok(())
                } else {
                    Err(EngineError::ClaimHeld(workflow_id))
                }
            }
        }
    }

    /// Renew the lease; false means ownership was lost
    async fn renew_claim(&self, workflow_id: Uuid) -> bool {
        let key = claim_key(workflow_id);
        let current = match self.coord.get(&key).await {
            Ok(current) => current,
            Err(e) => {
                // Transient backend failure: keep scheduling, the lease may
                // still be live.
                warn!(%workflow_id, "claim renewal read failed: {}", e);
                return true;
            }
        };

        let renewed = JobClaim::new(
            workflow_id,
            self.config.node_id.clone(),
            self.config.lease_ttl,
            self.clock.now(),
        );
        let Ok(value) = serde_json::to_string(&renewed) else {
            return false;
        };

        match current {
            Some(raw) => {
                let owned = serde_json::from_str::<JobClaim>(&raw)
                    .map(|c| c.node_id == self.config.node_id)
                    .unwrap_or(false);
                if !owned {
                    return false;
                }
                self.coord
                    .compare_and_swap(&key, Some(&raw), &value, Some(self.config.lease_ttl))
                    .await
                    .unwrap_or(false)
            }
            None => self
                .coord
                .compare_and_swap(&key, None, &value, Some(self.config.lease_ttl))
                .await
                .unwrap_or(false),
        }
    }

    async fn next_checkpoint_version(&self, workflow_id: Uuid) -> Result<i64, EngineError> {
        Ok(self
            .store
            .load_latest_checkpoint(workflow_id)
            .await?
            .map(|c| c.version + 1)
            .unwrap_or(1))
    }

    /// Snapshot the workflow's task-state vector at the next version
    async fn checkpoint(&self, workflow_id: Uuid, version: &mut i64) -> Result<(), EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let checkpoint =
            Checkpoint::capture(&workflow, *version, &self.config.node_id, self.clock.now());

        match self.store.write_checkpoint(&checkpoint).await {
            Ok(()) => {
                *version += 1;
                let _ = self
                    .store
                    .prune_checkpoints(workflow_id, self.config.checkpoint_keep)
                    .await;
                Ok(())
            }
            Err(StoreError::Conflict(_)) => {
                // Version raced (e.g. adoption overlap); resync and move on.
                *version = self.next_checkpoint_version(workflow_id).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn report_load(&self) {
        let cap = self.config.global_task_cap.max(1);
        let in_use = cap.saturating_sub(self.global_slots.available_permits());
        self.node_state.set_load(in_use as f64 / cap as f64);
    }

    fn emit_workflow(&self, workflow_id: Uuid, status: WorkflowStatus) {
        self.sink.emit_sampled(AnalyticsEvent::workflow_transition(
            workflow_id,
            status,
            self.clock.now(),
        ));
    }

    fn emit_task(&self, workflow_id: Uuid, task_id: &str, status: TaskStatus) {
        self.sink.emit_sampled(AnalyticsEvent::task_transition(
            workflow_id,
            task_id,
            status,
            self.clock.now(),
        ));
    }
}
