//! Retrying decorator for the coordination port
//!
//! Same contract as the persistence decorator: backend failures retry with
//! capped backoff inside a bounded budget, then the fatal signal fires and
//! the node is expected to drop out of the cluster.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use weft_core::clock::{Clock, SharedClock};

use super::store::{CoordError, CoordinationStore, Subscription};

fn backoff(attempt: u32) -> Duration {
    let secs = 0.5 * 2f64.powi(attempt.saturating_sub(1).min(8) as i32);
    Duration::from_secs_f64(secs.min(10.0))
}

/// Bounded-retry wrapper around any [`CoordinationStore`]
pub struct RetryingCoordination {
    inner: Arc<dyn CoordinationStore>,
    clock: SharedClock,
    max_attempts: u32,
    fatal: CancellationToken,
}

impl RetryingCoordination {
    pub fn new(inner: Arc<dyn CoordinationStore>, clock: SharedClock) -> Self {
        Self {
            inner,
            clock,
            max_attempts: 5,
            fatal: CancellationToken::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Fires when the retry budget is exhausted; the node should exit
    pub fn fatal_signal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    async fn with_retries<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, CoordError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CoordError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Err(CoordError::Backend(message)) if attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    let delay = backoff(attempt);
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "coordination call failed, retrying: {}",
                        message
                    );
                    self.clock.sleep(delay).await;
                }
                Err(CoordError::Backend(message)) => {
                    error!(
                        op,
                        attempts = self.max_attempts,
                        "coordination store unreachable, signalling fatal: {}",
                        message
                    );
                    self.fatal.cancel();
                    return Err(CoordError::Backend(message));
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for RetryingCoordination {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        self.with_retries("get", || self.inner.get(key)).await
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError> {
        self.with_retries("put", || self.inner.put(key, value, ttl))
            .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordError> {
        self.with_retries("compare_and_swap", || {
            self.inner.compare_and_swap(key, expected, new, ttl)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        self.with_retries("delete", || self.inner.delete(key)).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordError> {
        self.with_retries("list_prefix", || self.inner.list_prefix(prefix))
            .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoordError> {
        self.with_retries("publish", || self.inner.publish(channel, payload))
            .await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, CoordError> {
        self.with_retries("subscribe", || self.inner.subscribe(channel))
            .await
    }
}
