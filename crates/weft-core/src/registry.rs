//! Task registry
//!
//! Maps task type names to handler implementations. Handlers are registered
//! at build time; the registry is the only place a task type string is
//! resolved. Handlers must be idempotent with respect to
//! `(workflow_id, task_id, attempt)` - the engine guarantees at-least-once
//! execution, not exactly-once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Error returned by a task handler
///
/// `error_type` is the classification key the recovery controller maps to a
/// severity ("ConnectionError" -> high, "Timeout" -> medium, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl HandlerError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    /// Transport-level failure (classified high severity)
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new("ConnectionError", message)
    }

    /// Handler exceeded its wall-clock budget
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new("Timeout", message)
    }

    /// Bad input or configuration (classified low severity)
    pub fn value(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    /// Credential or permission failure (classified critical)
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new("AuthenticationError", message)
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Execution context passed to every handler invocation
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub workflow_id: Uuid,
    pub task_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    /// Observed at suspension points; a cancelled token means the workflow
    /// was cancelled or the node is shutting down
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(workflow_id: Uuid, task_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            workflow_id,
            task_id: task_id.into(),
            attempt,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// A registered task implementation
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Registry key; the task's `type` field selects the handler by this name
    fn task_type(&self) -> &'static str;

    /// Execute the task. The engine enforces the task timeout around this
    /// call; long-running handlers should still observe `ctx.cancellation`.
    async fn run(
        &self,
        config: &serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Registry of task handlers keyed by task type
pub struct TaskRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Create a registry with the built-in handlers registered
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::handlers::NoopHandler);
        registry.register(crate::handlers::SystemCheckHandler);
        registry.register(crate::handlers::DataBackupHandler);
        registry.register(crate::handlers::LogCleanupHandler);
        registry
    }

    /// Register a handler under its task type
    pub fn register<H: TaskHandler>(&mut self, handler: H) {
        self.handlers.insert(handler.task_type(), Arc::new(handler));
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).map(Arc::clone)
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task type names, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().map(|k| k.to_string()).collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
