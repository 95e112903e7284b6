//! Weft node binary
//!
//! Wires the engine to PostgreSQL, runs the background loops (heartbeat,
//! failover monitor, analytics pipeline, retention cleaner, pending
//! dispatch) and serves the submission/health API until ctrl-c.

mod api;
mod config;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use weft_core::clock::{Clock, SharedClock, SystemClock};
use weft_core::model::NodeRole;
use weft_core::registry::TaskRegistry;
use weft_engine::coordination::{CoordinationStore, RetryingCoordination};
use weft_engine::failover::{FailoverController, HeartbeatWriter, NodeState};
use weft_engine::persistence::{run_migrations, RetryingStore, WorkflowStore};
use weft_engine::{
    analytics, PostgresCoordinationStore, PostgresWorkflowStore, RecoveryController,
    RetentionCleaner, WorkflowEngine,
};

use config::NodeConfig;

/// Graceful shutdown
const EXIT_OK: i32 = 0;
/// Fatal configuration error
const EXIT_CONFIG: i32 = 2;
/// Persistence port unreachable after bounded retries
const EXIT_STORAGE: i32 = 3;
/// Coordination port unreachable after bounded retries
const EXIT_COORDINATION: i32 = 4;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft_node=info,weft_engine=info,weft_core=info".into()),
        )
        .init();

    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            return EXIT_CONFIG;
        }
    };

    let clock: SharedClock = Arc::new(SystemClock);

    info!(
        node_id = %config.engine.node_id,
        bind_addr = %config.bind_addr,
        "weft-node starting"
    );

    // Persistence port, with bounded connection retries.
    let pool = match connect_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("persistence port unreachable: {}", e);
            return EXIT_STORAGE;
        }
    };
    if let Err(e) = run_migrations(&pool).await {
        error!("migrations failed: {}", e);
        return EXIT_STORAGE;
    }

    // Both ports run behind bounded-retry decorators; exhausting a budget at
    // runtime fires the fatal signal and the node exits for failover.
    let raw_store: Arc<dyn WorkflowStore> = Arc::new(PostgresWorkflowStore::new(pool.clone()));
    let retrying_store = Arc::new(RetryingStore::new(raw_store, clock.clone()));
    let store_fatal = retrying_store.fatal_signal();
    let store: Arc<dyn WorkflowStore> = retrying_store;

    // Coordination port shares the pool; probe it before going live.
    let coordination = PostgresCoordinationStore::new(pool.clone());
    let raw_coord: Arc<dyn CoordinationStore> = Arc::new(coordination.clone());
    let retrying_coord = Arc::new(RetryingCoordination::new(raw_coord, clock.clone()));
    let coord_fatal = retrying_coord.fatal_signal();
    let coord: Arc<dyn CoordinationStore> = retrying_coord;
    if let Err(e) = probe_coordination(&coord, &config).await {
        error!("coordination port unreachable: {}", e);
        return EXIT_COORDINATION;
    }

    // Registry, analytics, recovery, engine.
    let registry = Arc::new(TaskRegistry::with_builtins());
    let (sink, pipeline) =
        analytics::channel(store.clone(), config.analytics.clone(), clock.clone());
    let pipeline_handle = tokio::spawn(pipeline.run());

    let recovery = Arc::new(RecoveryController::new(store.clone(), clock.clone()));
    let node_state = Arc::new(NodeState::new(
        config.engine.node_id.clone(),
        config.failover.node_priority,
        registry.task_types(),
    ));

    let engine = WorkflowEngine::new(
        store.clone(),
        coord.clone(),
        registry,
        recovery,
        sink,
        node_state.clone(),
        config.engine.clone(),
        clock.clone(),
    );

    // Background loops, all stopped by one root token.
    let shutdown = CancellationToken::new();

    let heartbeat = HeartbeatWriter::new(
        coord.clone(),
        node_state.clone(),
        config.failover.clone(),
        clock.clone(),
    );
    let heartbeat_handle = tokio::spawn(heartbeat.run(shutdown.child_token()));

    let failover = FailoverController::new(
        coord.clone(),
        store.clone(),
        node_state.clone(),
        config.failover.clone(),
        config.engine.lease_ttl,
        clock.clone(),
    );
    let failover_handle = tokio::spawn(failover.run(shutdown.child_token()));

    let cleaner = RetentionCleaner::new(store.clone(), config.analytics.clone(), clock.clone());
    let cleaner_handle = tokio::spawn(cleaner.run(shutdown.child_token()));

    let purge_handle = tokio::spawn(purge_loop(
        coordination,
        clock.clone(),
        shutdown.child_token(),
    ));

    let dispatch_handle = tokio::spawn(dispatch_loop(
        engine.clone(),
        node_state.clone(),
        clock.clone(),
        config.engine.pending_poll_interval,
        shutdown.child_token(),
    ));

    // HTTP surface.
    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind {}: {}", config.bind_addr, e);
            return EXIT_CONFIG;
        }
    };
    let app = api::router(engine.clone());
    let server_token = shutdown.child_token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await
        {
            error!("http server error: {}", e);
        }
    });

    info!("weft-node running");

    // Run until ctrl-c or an unrecoverable port failure.
    let exit_code = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => warn!("signal listener failed: {}", e),
            }
            EXIT_OK
        }
        _ = store_fatal.cancelled() => {
            error!("persistence port lost after retries, shutting down");
            EXIT_STORAGE
        }
        _ = coord_fatal.cancelled() => {
            error!("coordination port lost after retries, shutting down");
            EXIT_COORDINATION
        }
    };

    // Drain: stop loops (the heartbeat drops its key on the way out), park
    // workflows, flush analytics.
    shutdown.cancel();
    engine.shutdown().await;

    for handle in [
        heartbeat_handle,
        failover_handle,
        cleaner_handle,
        purge_handle,
        dispatch_handle,
        server,
    ] {
        let _ = handle.await;
    }
    drop(engine);
    let _ = pipeline_handle.await;

    info!(exit_code, "weft-node stopped");
    exit_code
}

async fn connect_pool(config: &NodeConfig) -> Result<PgPool, sqlx::Error> {
    let mut last_error = None;
    for attempt in 1..=config.connect_attempts.max(1) {
        match PgPoolOptions::new()
            .max_connections(16)
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                warn!(attempt, "database connection failed: {}", e);
                last_error = Some(e);
                tokio::time::sleep(NodeConfig::connect_backoff(attempt)).await;
            }
        }
    }
    Err(last_error.expect("at least one attempt"))
}

/// One write/delete round trip; the retrying decorator supplies the bounded
/// retry budget underneath.
async fn probe_coordination(
    coord: &Arc<dyn CoordinationStore>,
    config: &NodeConfig,
) -> Result<(), weft_engine::coordination::CoordError> {
    let key = format!("probe/{}", config.engine.node_id);
    coord
        .put(&key, "ok", Some(std::time::Duration::from_secs(5)))
        .await?;
    coord.delete(&key).await
}

/// Primary dispatches pending workflows from durable storage; every node
/// adopts claims naming it (failover hand-offs).
async fn dispatch_loop(
    engine: Arc<WorkflowEngine>,
    node_state: Arc<NodeState>,
    clock: SharedClock,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = clock.sleep(interval) => {
                if let Err(e) = engine.adopt_claims().await {
                    error!("claim adoption failed: {}", e);
                }
                if node_state.role() == NodeRole::Primary {
                    match engine.dispatch_pending(32).await {
                        Ok(started) if started > 0 => {
                            info!(started, "dispatched pending workflows");
                        }
                        Ok(_) => {}
                        Err(e) => error!("pending dispatch failed: {}", e),
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Sweep expired coordination keys so the table stays small
async fn purge_loop(
    coordination: PostgresCoordinationStore,
    clock: SharedClock,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = clock.sleep(std::time::Duration::from_secs(60)) => {
                if let Err(e) = coordination.purge_expired().await {
                    warn!("coordination purge failed: {}", e);
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
