//! Retry strategy selection
//!
//! Each severity maps to a fixed strategy row: how to stage the retry,
//! how many attempts to allow, and the backoff envelope.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use weft_core::model::Severity;

/// When a retry runs, if at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStage {
    /// Retry promptly with short backoff
    Immediate,
    /// Retry with long backoff
    Delayed,
    /// Do not retry; park for an operator
    Manual,
}

impl std::fmt::Display for RetryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Delayed => write!(f, "delayed"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A retry strategy row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    pub stage: RetryStage,
    /// Strategy-level retry cap; the task's own `max_retries` also applies
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryStrategy {
    /// Strategy for a classified severity
    ///
    /// Critical failures retry immediately (something is broken enough that
    /// waiting will not fix it, but a blip is possible); high-severity
    /// transport failures get patient delayed retries; everything else waits
    /// for an operator.
    pub fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical => Self {
                stage: RetryStage::Immediate,
                max_retries: 3,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                backoff_factor: 1.5,
            },
            Severity::High => Self {
                stage: RetryStage::Delayed,
                max_retries: 5,
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(300),
                backoff_factor: 2.0,
            },
            Severity::Medium | Severity::Low => Self {
                stage: RetryStage::Manual,
                max_retries: 1,
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                backoff_factor: 1.0,
            },
        }
    }

    /// Force the manual stage, keeping the row shape
    pub fn manual() -> Self {
        Self::for_severity(Severity::Low)
    }

    /// Backoff before retry number `retry_count + 1` (0-based count of
    /// retries already performed). Exponential, capped at `max_delay`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        if self.stage == RetryStage::Manual {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_factor.powi(retry_count.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_row() {
        let strategy = RetryStrategy::for_severity(Severity::Critical);
        assert_eq!(strategy.stage, RetryStage::Immediate);
        assert_eq!(strategy.max_retries, 3);
        assert_eq!(strategy.initial_delay, Duration::from_secs(1));
        assert_eq!(strategy.max_delay, Duration::from_secs(30));
        assert_eq!(strategy.backoff_factor, 1.5);
    }

    #[test]
    fn test_high_row() {
        let strategy = RetryStrategy::for_severity(Severity::High);
        assert_eq!(strategy.stage, RetryStage::Delayed);
        assert_eq!(strategy.max_retries, 5);
        assert_eq!(strategy.initial_delay, Duration::from_secs(5));
        assert_eq!(strategy.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_medium_and_low_are_manual() {
        for severity in [Severity::Medium, Severity::Low] {
            let strategy = RetryStrategy::for_severity(severity);
            assert_eq!(strategy.stage, RetryStage::Manual);
            assert_eq!(strategy.max_retries, 1);
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let strategy = RetryStrategy::for_severity(Severity::High);

        assert_eq!(strategy.delay_for_retry(0), Duration::from_secs(5));
        assert_eq!(strategy.delay_for_retry(1), Duration::from_secs(10));
        assert_eq!(strategy.delay_for_retry(2), Duration::from_secs(20));
        assert_eq!(strategy.delay_for_retry(3), Duration::from_secs(40));
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let strategy = RetryStrategy::for_severity(Severity::High);
        assert_eq!(strategy.delay_for_retry(20), Duration::from_secs(300));
    }

    #[test]
    fn test_manual_has_no_delay() {
        let strategy = RetryStrategy::manual();
        assert_eq!(strategy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(strategy.delay_for_retry(5), Duration::ZERO);
    }
}
