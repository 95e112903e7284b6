//! End-to-end scheduling scenarios over the in-memory ports
//!
//! The whole engine runs without a database here: the in-memory workflow
//! store and coordination store provide the same semantics as the Postgres
//! implementations, and the injected clock makes backoff and failover
//! timing deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use weft_core::clock::{Clock, ManualClock, SharedClock, SystemClock};
use weft_core::config::{AnalyticsConfig, EngineConfig, FailoverConfig};
use weft_core::model::{
    Checkpoint, JobClaim, ResolutionStatus, Severity, TaskSpec, TaskStatus, WorkflowRecord,
    WorkflowStatus,
};
use weft_core::registry::{HandlerError, TaskContext, TaskHandler, TaskRegistry};

use weft_engine::analytics;
use weft_engine::coordination::{claim_key, CoordinationStore, InMemoryCoordinationStore};
use weft_engine::failover::{FailoverController, HeartbeatWriter, NodeState};
use weft_engine::persistence::{InMemoryWorkflowStore, WorkflowStore};
use weft_engine::recovery::RecoveryController;
use weft_engine::{EngineError, WorkflowEngine};

// =============================================================================
// Test handlers
// =============================================================================

/// Counts invocations per task id; fails the first `fail_times` attempts
/// with the configured error type.
struct FlakyHandler {
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    fn task_type(&self) -> &'static str {
        "flaky"
    }

    async fn run(
        &self,
        config: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let entry = attempts.entry(ctx.task_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let fail_times = config.get("fail_times").and_then(|v| v.as_u64()).unwrap_or(0);
        let error_type = config
            .get("error_type")
            .and_then(|v| v.as_str())
            .unwrap_or("ConnectionError");

        if u64::from(attempt) <= fail_times {
            Err(HandlerError::new(error_type, "induced failure"))
        } else {
            Ok(serde_json::json!({ "attempt": attempt }))
        }
    }
}

/// Rendezvous for exactly two concurrent invocations; proves parallel
/// dispatch (the test hangs if the tasks were serialized).
struct PairHandler {
    barrier: Arc<tokio::sync::Barrier>,
}

#[async_trait]
impl TaskHandler for PairHandler {
    fn task_type(&self) -> &'static str {
        "pair"
    }

    async fn run(
        &self,
        _config: &serde_json::Value,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        self.barrier.wait().await;
        Ok(serde_json::json!({ "paired": true }))
    }
}

/// Signals when it starts, then blocks until released or cancelled.
struct GateHandler {
    started: tokio::sync::mpsc::UnboundedSender<String>,
    release: Arc<Notify>,
}

#[async_trait]
impl TaskHandler for GateHandler {
    fn task_type(&self) -> &'static str {
        "gate"
    }

    async fn run(
        &self,
        _config: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let _ = self.started.send(ctx.task_id.clone());
        tokio::select! {
            _ = self.release.notified() => Ok(serde_json::json!({ "released": true })),
            _ = ctx.cancellation.cancelled() => {
                Ok(serde_json::json!({ "observed_cancellation": true }))
            }
        }
    }
}

/// Tracks the peak number of concurrent invocations.
struct ProbeHandler {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for ProbeHandler {
    fn task_type(&self) -> &'static str {
        "probe"
    }

    async fn run(
        &self,
        _config: &serde_json::Value,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(serde_json::json!({}))
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    engine: Arc<WorkflowEngine>,
    store: Arc<InMemoryWorkflowStore>,
    coord: Arc<InMemoryCoordinationStore>,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    started: tokio::sync::mpsc::UnboundedReceiver<String>,
    release: Arc<Notify>,
    peak: Arc<AtomicUsize>,
}

fn harness(clock: SharedClock, config: EngineConfig) -> Harness {
    let store = Arc::new(InMemoryWorkflowStore::with_clock(clock.clone()));
    let coord = Arc::new(InMemoryCoordinationStore::with_clock(clock.clone()));

    let attempts: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let (started_tx, started_rx) = tokio::sync::mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut registry = TaskRegistry::with_builtins();
    registry.register(FlakyHandler {
        attempts: attempts.clone(),
    });
    registry.register(PairHandler {
        barrier: Arc::new(tokio::sync::Barrier::new(2)),
    });
    registry.register(GateHandler {
        started: started_tx,
        release: release.clone(),
    });
    registry.register(ProbeHandler {
        current,
        peak: peak.clone(),
    });

    let store_dyn: Arc<dyn WorkflowStore> = store.clone();
    let coord_dyn: Arc<dyn CoordinationStore> = coord.clone();

    // batch_size 1 so every emitted event is persisted immediately
    let analytics_config = AnalyticsConfig::default().with_batch_size(1);
    let (sink, pipeline) = analytics::channel(store_dyn.clone(), analytics_config, clock.clone());
    tokio::spawn(pipeline.run());

    let recovery = Arc::new(RecoveryController::new(store_dyn.clone(), clock.clone()));
    let node_state = Arc::new(NodeState::new(
        config.node_id.clone(),
        0,
        registry.task_types(),
    ));

    let engine = WorkflowEngine::new(
        store_dyn,
        coord_dyn,
        Arc::new(registry),
        recovery,
        sink,
        node_state,
        config,
        clock,
    );

    Harness {
        engine,
        store,
        coord,
        attempts,
        started: started_rx,
        release,
        peak,
    }
}

fn system_harness() -> Harness {
    harness(
        Arc::new(SystemClock),
        EngineConfig::default().with_node_id("n1"),
    )
}

async fn wait_for_status(
    engine: &Arc<WorkflowEngine>,
    workflow_id: Uuid,
    status: WorkflowStatus,
) -> WorkflowRecord {
    for _ in 0..2000 {
        let workflow = engine.status(workflow_id).await.unwrap();
        if workflow.status == status {
            return workflow;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("workflow never reached {:?}", status);
}

fn task_events(store: &InMemoryWorkflowStore) -> Vec<(String, String)> {
    store
        .events()
        .into_iter()
        .filter(|e| e.metric_name == "task.transition")
        .map(|e| {
            (
                e.value["task_id"].as_str().unwrap_or_default().to_string(),
                e.value["status"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

/// The pipeline flushes asynchronously; wait until `count` task events land
async fn wait_for_task_events(store: &InMemoryWorkflowStore, count: usize) {
    for _ in 0..1000 {
        if task_events(store).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {} task events, got {:?}", count, task_events(store));
}

/// Wait for an event with the given metric name to be persisted
async fn wait_for_metric(store: &InMemoryWorkflowStore, metric: &str) {
    for _ in 0..1000 {
        if store.events().iter().any(|e| e.metric_name == metric) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("event {} never persisted", metric);
}

// =============================================================================
// Scenarios
// =============================================================================

/// S1: linear DAG, all succeed, strictly increasing checkpoints
#[tokio::test(start_paused = true)]
async fn linear_dag_completes_in_order() {
    let h = system_harness();

    let id = h
        .engine
        .create(
            "linear",
            vec![
                TaskSpec::new("a", "noop").with_timeout(Duration::from_secs(5)),
                TaskSpec::new("b", "noop")
                    .with_dependencies(vec!["a"])
                    .with_timeout(Duration::from_secs(5)),
                TaskSpec::new("c", "noop")
                    .with_dependencies(vec!["b"])
                    .with_timeout(Duration::from_secs(5)),
            ],
            None,
        )
        .await
        .unwrap();

    h.engine.execute(id).await.unwrap();
    let workflow = wait_for_status(&h.engine, id, WorkflowStatus::Completed).await;

    for task in &workflow.tasks {
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.started_at.is_some());
        assert!(task.ended_at.is_some());
        assert_eq!(task.retry_count, 0);
    }

    // One checkpoint per completion, versions strictly increasing
    assert_eq!(h.store.checkpoint_versions(id), vec![1, 2, 3]);

    // Exactly three task-transition events, in dependency order
    wait_for_task_events(&h.store, 3).await;
    let events = task_events(&h.store);
    assert_eq!(
        events,
        vec![
            ("a".to_string(), "completed".to_string()),
            ("b".to_string(), "completed".to_string()),
            ("c".to_string(), "completed".to_string()),
        ]
    );
}

/// S2: diamond DAG; B and C run simultaneously, D only after both
#[tokio::test(start_paused = true)]
async fn diamond_dag_dispatches_in_parallel() {
    let h = system_harness();

    let id = h
        .engine
        .create(
            "diamond",
            vec![
                TaskSpec::new("a", "noop"),
                // The pair barrier resolves only when B and C are running at
                // the same instant; serialized dispatch would deadlock.
                TaskSpec::new("b", "pair").with_dependencies(vec!["a"]),
                TaskSpec::new("c", "pair").with_dependencies(vec!["a"]),
                TaskSpec::new("d", "noop").with_dependencies(vec!["b", "c"]),
            ],
            None,
        )
        .await
        .unwrap();

    h.engine.execute(id).await.unwrap();
    let workflow = wait_for_status(&h.engine, id, WorkflowStatus::Completed).await;

    // D finished after both B and C
    let ended = |task: &str| workflow.task(task).unwrap().ended_at.unwrap();
    assert!(ended("d") >= ended("b"));
    assert!(ended("d") >= ended("c"));
}

/// S3: transient failure, delayed retry per the high-severity strategy
#[tokio::test(start_paused = true)]
async fn transient_failure_retries_and_completes() {
    let h = system_harness();

    let id = h
        .engine
        .create(
            "flaky-once",
            vec![TaskSpec::new("a", "flaky")
                .with_config(serde_json::json!({ "fail_times": 1, "error_type": "ConnectionError" }))],
            None,
        )
        .await
        .unwrap();

    h.engine.execute(id).await.unwrap();
    let workflow = wait_for_status(&h.engine, id, WorkflowStatus::Completed).await;

    let task = workflow.task("a").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(*h.attempts.lock().get("a").unwrap(), 2);

    // The failure was classified high severity (delayed stage)
    let failures = h.store.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].severity, Severity::High);
    assert_eq!(failures[0].error_type, "ConnectionError");
}

/// S4: low-severity failure parks for manual intervention, workflow fails
#[tokio::test(start_paused = true)]
async fn hard_failure_parks_for_manual_intervention() {
    let h = system_harness();

    let id = h
        .engine
        .create(
            "bad-input",
            vec![TaskSpec::new("a", "flaky")
                .with_config(serde_json::json!({ "fail_times": 99, "error_type": "ValueError" }))
                .with_max_retries(1)],
            None,
        )
        .await
        .unwrap();

    h.engine.execute(id).await.unwrap();
    let workflow = wait_for_status(&h.engine, id, WorkflowStatus::Failed).await;

    let task = workflow.task("a").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    // One attempt only: manual stage never retries
    assert_eq!(*h.attempts.lock().get("a").unwrap(), 1);
    assert_eq!(task.retry_count, 0);

    let failures = h.store.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].severity, Severity::Low);
    assert_eq!(
        failures[0].resolution_status,
        ResolutionStatus::PendingManualIntervention
    );

    // A notification event was enqueued for the operator path
    wait_for_metric(&h.store, "recovery.manual_intervention").await;
}

/// S4 variant: exhausted retries mark the pattern permanently failed
#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_permanently() {
    let h = system_harness();

    let id = h
        .engine
        .create(
            "always-down",
            vec![TaskSpec::new("a", "flaky")
                .with_config(serde_json::json!({ "fail_times": 99, "error_type": "ConnectionError" }))
                .with_max_retries(2)],
            None,
        )
        .await
        .unwrap();

    h.engine.execute(id).await.unwrap();
    let workflow = wait_for_status(&h.engine, id, WorkflowStatus::Failed).await;

    let task = workflow.task("a").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert!(task.retry_count <= task.max_retries);
    assert_eq!(*h.attempts.lock().get("a").unwrap(), 3);

    let failures = h.store.failures();
    assert_eq!(failures.len(), 3);
    assert_eq!(
        failures.iter().map(|f| f.retry_count).collect::<Vec<_>>(),
        // newest first
        vec![2, 1, 0]
    );
    assert_eq!(
        failures[0].resolution_status,
        ResolutionStatus::PermanentlyFailed
    );
}

/// Fail-fast: descendants of a failed task are skipped, not run
#[tokio::test(start_paused = true)]
async fn descendants_of_failed_task_are_skipped() {
    let h = system_harness();

    let id = h
        .engine
        .create(
            "fail-fast",
            vec![
                TaskSpec::new("a", "flaky")
                    .with_config(serde_json::json!({ "fail_times": 99, "error_type": "ValueError" })),
                TaskSpec::new("b", "noop").with_dependencies(vec!["a"]),
                TaskSpec::new("c", "noop").with_dependencies(vec!["b"]),
                TaskSpec::new("d", "noop"),
            ],
            None,
        )
        .await
        .unwrap();

    h.engine.execute(id).await.unwrap();
    let workflow = wait_for_status(&h.engine, id, WorkflowStatus::Failed).await;

    assert_eq!(workflow.task("a").unwrap().status, TaskStatus::Failed);
    assert_eq!(workflow.task("b").unwrap().status, TaskStatus::Skipped);
    assert_eq!(workflow.task("c").unwrap().status, TaskStatus::Skipped);
    // The independent branch still ran
    assert_eq!(workflow.task("d").unwrap().status, TaskStatus::Completed);
}

/// S5: cancellation mid-run; in-flight completion recorded, successor never
/// dispatched
#[tokio::test(start_paused = true)]
async fn cancellation_mid_run() {
    let mut h = system_harness();

    let id = h
        .engine
        .create(
            "cancel-me",
            vec![
                TaskSpec::new("a", "gate").with_timeout(Duration::from_secs(3600)),
                TaskSpec::new("b", "noop").with_dependencies(vec!["a"]),
            ],
            None,
        )
        .await
        .unwrap();

    h.engine.execute(id).await.unwrap();

    // Wait until A is actually running, then cancel.
    let started = h.started.recv().await.unwrap();
    assert_eq!(started, "a");
    h.engine.cancel(id).await.unwrap();

    let workflow = wait_for_status(&h.engine, id, WorkflowStatus::Cancelled).await;

    // A observed cancellation and its completion was recorded
    let a = workflow.task("a").unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.result.as_ref().unwrap()["observed_cancellation"], true);

    // B was never dispatched
    let b = workflow.task("b").unwrap();
    assert_eq!(b.status, TaskStatus::Pending);
    assert!(b.started_at.is_none());

    // The claim was released
    assert!(h.coord.get(&claim_key(id)).await.unwrap().is_none());

    // Cancellation is idempotent
    h.engine.cancel(id).await.unwrap();
}

/// Pause stops dispatch but lets in-flight tasks finish; resume re-enters
/// scheduling
#[tokio::test(start_paused = true)]
async fn pause_and_resume() {
    let mut h = system_harness();

    let id = h
        .engine
        .create(
            "pausable",
            vec![
                TaskSpec::new("a", "gate").with_timeout(Duration::from_secs(3600)),
                TaskSpec::new("b", "noop").with_dependencies(vec!["a"]),
            ],
            None,
        )
        .await
        .unwrap();

    h.engine.execute(id).await.unwrap();
    h.started.recv().await.unwrap();

    h.engine.pause(id).await.unwrap();

    // Release A; it completes while paused, but B must not be dispatched.
    for _ in 0..200 {
        h.release.notify_waiters();
        let workflow = h.engine.status(id).await.unwrap();
        if workflow.task("a").unwrap().status == TaskStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let workflow = h.engine.status(id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Paused);
    assert_eq!(workflow.task("a").unwrap().status, TaskStatus::Completed);
    assert_eq!(workflow.task("b").unwrap().status, TaskStatus::Pending);

    // Pausing a paused workflow is a contract violation
    assert!(matches!(
        h.engine.pause(id).await,
        Err(EngineError::InvalidTransition(_))
    ));

    h.engine.resume(id).await.unwrap();
    wait_for_status(&h.engine, id, WorkflowStatus::Completed).await;
}

/// The global in-flight cap is never exceeded
#[tokio::test(start_paused = true)]
async fn global_concurrency_cap_respected() {
    let h = harness(
        Arc::new(SystemClock),
        EngineConfig::default()
            .with_node_id("n1")
            .with_global_task_cap(2)
            .with_workflow_task_cap(8),
    );

    let tasks: Vec<TaskSpec> = (0..6)
        .map(|i| TaskSpec::new(format!("t{}", i), "probe"))
        .collect();
    let id = h.engine.create("crowded", tasks, None).await.unwrap();

    h.engine.execute(id).await.unwrap();
    wait_for_status(&h.engine, id, WorkflowStatus::Completed).await;

    assert!(h.peak.load(Ordering::SeqCst) <= 2);
}

/// Re-executing a terminal workflow is refused; status stays put
#[tokio::test(start_paused = true)]
async fn terminal_workflow_is_final() {
    let h = system_harness();

    let id = h
        .engine
        .create("once", vec![TaskSpec::new("a", "noop")], None)
        .await
        .unwrap();
    h.engine.execute(id).await.unwrap();
    wait_for_status(&h.engine, id, WorkflowStatus::Completed).await;

    assert!(matches!(
        h.engine.execute(id).await,
        Err(EngineError::AlreadyTerminal { .. })
    ));
    assert!(matches!(
        h.engine.resume(id).await,
        Err(EngineError::InvalidTransition(_))
    ));
}

/// S6: node failover - the standby promotes, adopts the orphaned claim,
/// restores from the checkpoint and re-runs only the interrupted task
#[tokio::test]
async fn node_failover_resumes_from_checkpoint() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let shared: SharedClock = clock.clone();

    let h = harness(shared.clone(), EngineConfig::default().with_node_id("n2"));

    // Workflow state as node n1 left it: A completed (checkpointed),
    // B running mid-flight.
    let workflow = WorkflowRecord::new(
        "failover",
        vec![
            TaskSpec::new("a", "flaky"),
            TaskSpec::new("b", "flaky").with_dependencies(vec!["a"]),
        ],
        shared.now(),
    );
    let id = workflow.id;
    h.store.create_workflow(&workflow).await.unwrap();
    h.store
        .update_workflow_status(id, WorkflowStatus::Running)
        .await
        .unwrap();
    for (from, to) in [
        (TaskStatus::Pending, TaskStatus::Running),
        (TaskStatus::Running, TaskStatus::Completed),
    ] {
        h.store
            .record_task_transition(id, "a", from, to, Some(serde_json::json!({"done": true})), None)
            .await
            .unwrap();
    }
    h.store
        .record_task_transition(id, "b", TaskStatus::Pending, TaskStatus::Running, None, None)
        .await
        .unwrap();

    let snapshot = h.store.get_workflow(id).await.unwrap();
    h.store
        .write_checkpoint(&Checkpoint::capture(&snapshot, 1, "n1", shared.now()))
        .await
        .unwrap();

    // n1's claim, already past its lease.
    let stale_claim = JobClaim::new(
        id,
        "n1",
        Duration::from_secs(30),
        shared.now() - chrono::Duration::seconds(120),
    );
    h.coord
        .put(
            &claim_key(id),
            &serde_json::to_string(&stale_claim).unwrap(),
            None,
        )
        .await
        .unwrap();

    // n2 is alive; n1 has stopped heartbeating (it never wrote one here).
    let node_state = Arc::new(NodeState::new("n2", 1, vec!["flaky".to_string()]));
    HeartbeatWriter::new(
        h.coord.clone(),
        node_state.clone(),
        FailoverConfig::default(),
        shared.clone(),
    )
    .beat()
    .await
    .unwrap();

    let controller = FailoverController::new(
        h.coord.clone(),
        h.store.clone(),
        node_state,
        FailoverConfig::default(),
        Duration::from_secs(30),
        shared.clone(),
    );

    let report = controller.tick().await.unwrap();
    assert!(report.promoted);
    assert_eq!(report.reassigned, 1);

    // The re-written claim names n2; adopt and finish.
    let adopted = h.engine.adopt_claims().await.unwrap();
    assert_eq!(adopted, 1);

    let workflow = wait_for_status(&h.engine, id, WorkflowStatus::Completed).await;

    // A was never re-run; B ran exactly once on n2.
    let attempts = h.attempts.lock();
    assert!(attempts.get("a").is_none());
    assert_eq!(*attempts.get("b").unwrap(), 1);
    drop(attempts);

    assert_eq!(
        workflow.task("a").unwrap().result.as_ref().unwrap()["done"],
        true
    );
    assert_eq!(workflow.task("b").unwrap().status, TaskStatus::Completed);
    // Re-dispatch after failover consumed no retry budget
    assert_eq!(workflow.task("b").unwrap().retry_count, 0);
}

/// Primary-side dispatch picks up workflows persisted as pending
#[tokio::test(start_paused = true)]
async fn pending_dispatch_loop_starts_persisted_workflows() {
    let h = system_harness();

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(
            h.engine
                .create(format!("queued-{}", i), vec![TaskSpec::new("a", "noop")], None)
                .await
                .unwrap(),
        );
    }

    let started = h.engine.dispatch_pending(10).await.unwrap();
    assert_eq!(started, 3);

    for id in ids {
        wait_for_status(&h.engine, id, WorkflowStatus::Completed).await;
    }
}
