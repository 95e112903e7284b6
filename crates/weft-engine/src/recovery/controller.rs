//! Recovery controller
//!
//! Pure policy plus checkpoint restoration: given a persisted failure
//! pattern, decide whether the engine retries (and after what delay) or
//! gives up (and with what resolution). The controller never raises out of a
//! decision - every path yields a [`RecoveryDecision`] the engine persists.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_core::clock::{Clock, SharedClock};
use weft_core::model::{Checkpoint, FailurePattern, ResolutionStatus, Severity, TaskStatus};

use crate::persistence::{StoreError, WorkflowStore};

use super::classifier::SeverityClassifier;
use super::strategy::{RetryStage, RetryStrategy};

/// Anomaly scorer port
///
/// Scores a failure pattern in `[0, 1]`; above [`MANUAL_OVERRIDE_SCORE`] the
/// controller refuses to automate the retry regardless of severity. The
/// production detector is external; the default scorer is a constant.
pub trait AnomalyScorer: Send + Sync + 'static {
    fn score(&self, pattern: &FailurePattern) -> f64;
}

/// Suspicion overrides automation above this score
pub const MANUAL_OVERRIDE_SCORE: f64 = 0.8;

/// Default scorer: indifferent
pub struct DefaultScorer;

impl AnomalyScorer for DefaultScorer {
    fn score(&self, _pattern: &FailurePattern) -> f64 {
        0.5
    }
}

/// What the engine should do with a failed task
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    /// Re-queue the task after the backoff delay
    Retry {
        stage: RetryStage,
        delay: Duration,
        /// Retry number this decision authorizes (1-based)
        attempt: u32,
    },
    /// Stop retrying; the task fails with this resolution recorded
    GiveUp { resolution: ResolutionStatus },
}

/// Outcome of a checkpoint restoration request
#[derive(Debug, Clone, PartialEq)]
pub enum RestoredState {
    /// The latest checkpoint is consistent with durable task state
    FromCheckpoint(Checkpoint),
    /// No usable checkpoint; the store's task rows are authoritative
    StoreAuthoritative,
}

/// Errors from restoration (decisions themselves never fail)
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Recovery controller
///
/// Owns the severity table, the strategy rows and the anomaly scorer. The
/// engine calls [`classify`](Self::classify) when building a failure
/// pattern, [`decide`](Self::decide) to pick a path, and
/// [`restore_state`](Self::restore_state) before re-entering scheduling
/// after a failure or failover.
pub struct RecoveryController {
    classifier: SeverityClassifier,
    scorer: Arc<dyn AnomalyScorer>,
    store: Arc<dyn WorkflowStore>,
    clock: SharedClock,
}

impl RecoveryController {
    pub fn new(store: Arc<dyn WorkflowStore>, clock: SharedClock) -> Self {
        Self {
            classifier: SeverityClassifier::default(),
            scorer: Arc::new(DefaultScorer),
            store,
            clock,
        }
    }

    pub fn with_classifier(mut self, classifier: SeverityClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn AnomalyScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Severity for an error type
    pub fn classify(&self, error_type: &str) -> Severity {
        self.classifier.classify(error_type)
    }

    /// Decide the recovery path for a failure
    ///
    /// `pattern.retry_count` is the number of retries already performed for
    /// this task. The effective retry cap is the smaller of the task's
    /// budget and the strategy row's.
    pub fn decide(&self, pattern: &FailurePattern, task_max_retries: u32) -> RecoveryDecision {
        let score = self.scorer.score(pattern).clamp(0.0, 1.0);
        let strategy = if score > MANUAL_OVERRIDE_SCORE {
            debug!(
                workflow_id = %pattern.workflow_id,
                task_id = %pattern.task_id,
                score,
                "anomaly score overrides severity, forcing manual stage"
            );
            RetryStrategy::manual()
        } else {
            RetryStrategy::for_severity(pattern.severity)
        };

        if strategy.stage == RetryStage::Manual {
            return RecoveryDecision::GiveUp {
                resolution: ResolutionStatus::PendingManualIntervention,
            };
        }

        let cap = task_max_retries.min(strategy.max_retries);
        if pattern.retry_count >= cap {
            return RecoveryDecision::GiveUp {
                resolution: ResolutionStatus::PermanentlyFailed,
            };
        }

        RecoveryDecision::Retry {
            stage: strategy.stage,
            delay: strategy.delay_for_retry(pattern.retry_count),
            attempt: pattern.retry_count + 1,
        }
    }

    /// Perform the backoff wait for a retry decision
    pub async fn wait_backoff(&self, delay: Duration) {
        if !delay.is_zero() {
            self.clock.sleep(delay).await;
        }
    }

    /// Load the most recent checkpoint and verify it has not fallen behind
    /// durable task state
    ///
    /// A checkpoint older than the last durable COMPLETED transition would
    /// regress completed work on restore, so it is rejected and the store's
    /// rows are authoritative instead.
    pub async fn restore_state(&self, workflow_id: Uuid) -> Result<RestoredState, RecoveryError> {
        let Some(checkpoint) = self.store.load_latest_checkpoint(workflow_id).await? else {
            return Ok(RestoredState::StoreAuthoritative);
        };

        let workflow = self.store.get_workflow(workflow_id).await?;
        let stale = workflow
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .any(|t| {
                checkpoint
                    .state
                    .tasks
                    .get(&t.id)
                    .map(|s| s.status != TaskStatus::Completed)
                    .unwrap_or(true)
            });

        if stale {
            warn!(
                %workflow_id,
                version = checkpoint.version,
                "checkpoint predates durable completions, restoring from store"
            );
            return Ok(RestoredState::StoreAuthoritative);
        }

        info!(%workflow_id, version = checkpoint.version, "restored from checkpoint");
        Ok(RestoredState::FromCheckpoint(checkpoint))
    }
}
