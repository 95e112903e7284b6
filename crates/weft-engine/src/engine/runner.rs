//! Task execution wrapper
//!
//! Runs one handler invocation with its wall-clock timeout, cancellation
//! observation and panic isolation. The handler runs in its own tokio task,
//! so a panicking handler never takes a scheduler down with it.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use weft_core::clock::{Clock, SharedClock};
use weft_core::registry::{HandlerError, TaskContext, TaskHandler};

/// How a single handler invocation ended
#[derive(Debug)]
pub(crate) enum RunOutcome {
    /// Handler returned a result
    Success(serde_json::Value),

    /// Handler returned an error, timed out, or panicked
    Failure(HandlerError),

    /// Cancellation was signalled and the handler did not finish within the
    /// shutdown grace; its late completion (if any) is dropped
    Abandoned,
}

/// Execute a handler with timeout and cancellation semantics
///
/// - The timeout is wall-clock around the invocation; expiry reports a
///   `Timeout` failure and the late handler is dropped (idempotence
///   assumption).
/// - When `ctx.cancellation` fires, the handler gets `shutdown_grace` to
///   observe it; whatever it returns inside the grace window is recorded,
///   otherwise the run is abandoned.
pub(crate) async fn run_task(
    handler: Arc<dyn TaskHandler>,
    config: serde_json::Value,
    ctx: TaskContext,
    timeout: Duration,
    shutdown_grace: Duration,
    clock: SharedClock,
) -> RunOutcome {
    let cancellation = ctx.cancellation.clone();
    let task_id = ctx.task_id.clone();

    let mut invocation = tokio::spawn(async move { handler.run(&config, &ctx).await });

    tokio::select! {
        joined = &mut invocation => finish(joined, &task_id),
        _ = clock.sleep(timeout) => {
            invocation.abort();
            RunOutcome::Failure(HandlerError::timeout(format!(
                "handler exceeded {}s",
                timeout.as_secs()
            )))
        }
        _ = cancellation.cancelled() => {
            // Grace window for the handler to observe cancellation.
            tokio::select! {
                joined = &mut invocation => finish(joined, &task_id),
                _ = clock.sleep(shutdown_grace) => {
                    warn!(task_id, "handler ignored cancellation, abandoning");
                    invocation.abort();
                    RunOutcome::Abandoned
                }
            }
        }
    }
}

fn finish(
    joined: Result<Result<serde_json::Value, HandlerError>, tokio::task::JoinError>,
    task_id: &str,
) -> RunOutcome {
    match joined {
        Ok(Ok(value)) => RunOutcome::Success(value),
        Ok(Err(error)) => RunOutcome::Failure(error),
        Err(join_error) => {
            warn!(task_id, "handler panicked: {}", join_error);
            RunOutcome::Failure(HandlerError::new(
                "Panic",
                format!("handler panicked: {}", join_error),
            ))
        }
    }
}
