//! Clock abstraction
//!
//! Every component that reads the wall clock or sleeps does so through this
//! trait, so timeout, backoff and heartbeat behavior is deterministic under
//! test. Production code uses `SystemClock`; tests use `ManualClock` and
//! advance time explicitly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the given duration
    async fn sleep(&self, duration: Duration);
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Real time: `Utc::now` + `tokio::time::sleep`
///
/// Works with tokio's paused test time for sleep-driven tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually advanced clock for tests
///
/// `sleep` parks the caller until `advance` moves time past its deadline.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    waker: Notify,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            waker: Notify::new(),
        }
    }

    /// Advance the clock and wake every parked sleeper
    pub fn advance(&self, duration: Duration) {
        {
            let mut now = self.now.lock();
            *now += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        }
        self.waker.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        loop {
            // Register interest before re-checking so an advance between the
            // check and the await is not lost.
            let woken = self.waker.notified();
            if self.now() >= deadline {
                return;
            }
            woken.await;
        }
    }
}
