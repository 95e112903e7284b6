//! Tunable configuration
//!
//! Each component receives its config struct at construction - there is no
//! global settings singleton. `from_env` constructors read the `WEFT_*`
//! variables; any unparseable value is a fatal configuration error (the node
//! binary exits with code 2).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration parse failure
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable present but not parseable
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// Required variable missing
    #[error("missing required environment variable {0}")]
    Missing(String),
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

fn default_global_cap() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 4)
        .unwrap_or(16)
}

/// Scheduler and engine limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Node identity, shared with heartbeat and claims
    pub node_id: String,

    /// Maximum tasks in flight across all workflows on this node
    pub global_task_cap: usize,

    /// Default per-workflow concurrent-task cap (workflow may override)
    pub workflow_task_cap: usize,

    /// Maximum workflows this node schedules at once
    pub max_active_workflows: usize,

    /// Job-claim lease; renewed at half this interval
    pub lease_ttl: Duration,

    /// How long a cancelled handler may run before it is abandoned
    pub shutdown_grace: Duration,

    /// Optional wall-clock cap on a whole workflow; exceeded workflows are
    /// cancelled
    pub workflow_timeout: Option<Duration>,

    /// Checkpoints retained per workflow (>= 1)
    pub checkpoint_keep: usize,

    /// Poll interval for pending workflows in durable storage (primary only)
    pub pending_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::now_v7()),
            global_task_cap: default_global_cap(),
            workflow_task_cap: 4,
            max_active_workflows: 100,
            lease_ttl: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            workflow_timeout: None,
            checkpoint_keep: 5,
            pending_poll_interval: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            node_id: std::env::var("WEFT_NODE_ID").unwrap_or(defaults.node_id),
            global_task_cap: env_parse("WEFT_GLOBAL_TASK_CAP", defaults.global_task_cap)?,
            workflow_task_cap: env_parse("WEFT_WORKFLOW_TASK_CAP", defaults.workflow_task_cap)?,
            max_active_workflows: env_parse(
                "WEFT_MAX_ACTIVE_WORKFLOWS",
                defaults.max_active_workflows,
            )?,
            lease_ttl: env_secs("WEFT_LEASE_TTL_SECS", defaults.lease_ttl)?,
            shutdown_grace: env_secs("WEFT_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            workflow_timeout: match std::env::var("WEFT_WORKFLOW_TIMEOUT_SECS") {
                Ok(raw) => Some(Duration::from_secs(raw.parse().map_err(|_| {
                    ConfigError::InvalidValue {
                        key: "WEFT_WORKFLOW_TIMEOUT_SECS".to_string(),
                        value: raw,
                    }
                })?)),
                Err(_) => defaults.workflow_timeout,
            },
            checkpoint_keep: env_parse("WEFT_CHECKPOINT_KEEP", defaults.checkpoint_keep)?
                .max(1),
            pending_poll_interval: env_secs(
                "WEFT_PENDING_POLL_INTERVAL_SECS",
                defaults.pending_poll_interval,
            )?,
        })
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_global_task_cap(mut self, cap: usize) -> Self {
        self.global_task_cap = cap.max(1);
        self
    }

    pub fn with_workflow_task_cap(mut self, cap: usize) -> Self {
        self.workflow_task_cap = cap.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_workflow_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_timeout = Some(timeout);
        self
    }

    pub fn with_checkpoint_keep(mut self, keep: usize) -> Self {
        self.checkpoint_keep = keep.max(1);
        self
    }
}

/// Heartbeat and failover limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverConfig {
    /// How often a node writes its heartbeat
    pub heartbeat_interval: Duration,

    /// A node is dead once its heartbeat is older than this
    pub heartbeat_ttl: Duration,

    /// How often the monitor loop runs
    pub monitor_interval: Duration,

    /// Election weight (higher wins)
    pub node_priority: i32,

    /// Orphan claims reassigned per monitor tick, to avoid stampedes
    pub max_redistribute_per_tick: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(10),
            node_priority: 0,
            max_redistribute_per_tick: 16,
        }
    }
}

impl FailoverConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            heartbeat_interval: env_secs(
                "WEFT_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            )?,
            heartbeat_ttl: env_secs("WEFT_HEARTBEAT_TTL_SECS", defaults.heartbeat_ttl)?,
            monitor_interval: env_secs("WEFT_MONITOR_INTERVAL_SECS", defaults.monitor_interval)?,
            node_priority: env_parse("WEFT_NODE_PRIORITY", defaults.node_priority)?,
            max_redistribute_per_tick: env_parse(
                "WEFT_MAX_REDISTRIBUTE_PER_TICK",
                defaults.max_redistribute_per_tick,
            )?,
        })
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat_ttl = ttl;
        self
    }

    pub fn with_node_priority(mut self, priority: i32) -> Self {
        self.node_priority = priority;
        self
    }
}

/// Analytics intake limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsConfig {
    /// Bounded queue capacity
    pub queue_capacity: usize,

    /// Maximum events per flushed batch
    pub batch_size: usize,

    /// Flush a partial batch once the oldest event is this stale
    pub flush_interval: Duration,

    /// Whole-batch retry budget on flush failure
    pub max_batch_retries: u32,

    /// Under backpressure, keep 1 in `sample_every` events
    pub sample_every: u64,

    /// Analytics rows older than this are deleted
    pub retention_days: u32,

    /// Failure patterns older than this are deleted
    pub failure_retention_days: u32,

    /// Terminal workflows untouched for this long are deleted (with their
    /// tasks and checkpoints)
    pub workflow_retention_days: u32,

    /// How often the retention cleaner runs
    pub cleaner_interval: Duration,

    /// Rows deleted per page during retention cleanup
    pub cleaner_page_size: u32,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 1_000,
            flush_interval: Duration::from_secs(60),
            max_batch_retries: 5,
            sample_every: 10,
            retention_days: 90,
            failure_retention_days: 30,
            workflow_retention_days: 90,
            cleaner_interval: Duration::from_secs(3600),
            cleaner_page_size: 1_000,
        }
    }
}

impl AnalyticsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            queue_capacity: env_parse("WEFT_ANALYTICS_QUEUE_CAPACITY", defaults.queue_capacity)?,
            batch_size: env_parse("WEFT_ANALYTICS_BATCH_SIZE", defaults.batch_size)?,
            flush_interval: env_secs(
                "WEFT_ANALYTICS_FLUSH_INTERVAL_SECS",
                defaults.flush_interval,
            )?,
            max_batch_retries: env_parse(
                "WEFT_ANALYTICS_MAX_BATCH_RETRIES",
                defaults.max_batch_retries,
            )?,
            sample_every: env_parse("WEFT_ANALYTICS_SAMPLE_EVERY", defaults.sample_every)?,
            retention_days: env_parse("WEFT_RETENTION_DAYS", defaults.retention_days)?,
            failure_retention_days: env_parse(
                "WEFT_FAILURE_RETENTION_DAYS",
                defaults.failure_retention_days,
            )?,
            workflow_retention_days: env_parse(
                "WEFT_WORKFLOW_RETENTION_DAYS",
                defaults.workflow_retention_days,
            )?,
            cleaner_interval: env_secs("WEFT_CLEANER_INTERVAL_SECS", defaults.cleaner_interval)?,
            cleaner_page_size: env_parse("WEFT_CLEANER_PAGE_SIZE", defaults.cleaner_page_size)?,
        })
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}
