//! Built-in task handlers
//!
//! Small idempotent system tasks registered by default so a fresh node can
//! execute workflows without external plug-ins. Real deployments register
//! their own handlers next to these.

use async_trait::async_trait;
use serde_json::json;

use crate::registry::{HandlerError, TaskContext, TaskHandler};

/// Does nothing and succeeds. Useful for wiring and smoke tests.
pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    fn task_type(&self) -> &'static str {
        "noop"
    }

    async fn run(
        &self,
        _config: &serde_json::Value,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(json!({ "status": "ok" }))
    }
}

/// Reports node health back into the workflow result.
pub struct SystemCheckHandler;

#[async_trait]
impl TaskHandler for SystemCheckHandler {
    fn task_type(&self) -> &'static str {
        "system_check"
    }

    async fn run(
        &self,
        _config: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        if ctx.is_cancelled() {
            return Err(HandlerError::new("Cancelled", "cancelled before start"));
        }
        Ok(json!({ "status": "healthy" }))
    }
}

/// Placeholder backup step; `config.target` names the destination.
pub struct DataBackupHandler;

#[async_trait]
impl TaskHandler for DataBackupHandler {
    fn task_type(&self) -> &'static str {
        "data_backup"
    }

    async fn run(
        &self,
        config: &serde_json::Value,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let target = config
            .get("target")
            .and_then(|v| v.as_str())
            .unwrap_or("default");
        Ok(json!({ "status": "backup_completed", "target": target }))
    }
}

/// Placeholder log rotation step.
pub struct LogCleanupHandler;

#[async_trait]
impl TaskHandler for LogCleanupHandler {
    fn task_type(&self) -> &'static str {
        "log_cleanup"
    }

    async fn run(
        &self,
        _config: &serde_json::Value,
        _ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(json!({ "status": "cleanup_completed" }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_noop_succeeds() {
        let ctx = TaskContext::new(Uuid::now_v7(), "t", 1);
        let result = NoopHandler.run(&json!({}), &ctx).await.unwrap();
        assert_eq!(result["status"], "ok");
    }

    #[tokio::test]
    async fn test_backup_reads_target() {
        let ctx = TaskContext::new(Uuid::now_v7(), "t", 1);
        let result = DataBackupHandler
            .run(&json!({"target": "s3://archive"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result["target"], "s3://archive");
    }

    #[tokio::test]
    async fn test_system_check_observes_cancellation() {
        let ctx = TaskContext::new(Uuid::now_v7(), "t", 1);
        ctx.cancellation.cancel();

        let err = SystemCheckHandler.run(&json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.error_type, "Cancelled");
    }
}
