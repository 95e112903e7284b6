//! Retry / recovery controller
//!
//! Failure classification, staged retry strategies with bounded backoff,
//! anomaly-score overrides and guarded checkpoint restoration.

mod classifier;
mod controller;
mod strategy;

pub use classifier::SeverityClassifier;
pub use controller::{
    AnomalyScorer, DefaultScorer, RecoveryController, RecoveryDecision, RecoveryError,
    RestoredState, MANUAL_OVERRIDE_SCORE,
};
pub use strategy::{RetryStage, RetryStrategy};
