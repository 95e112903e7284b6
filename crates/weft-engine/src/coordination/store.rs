//! CoordinationStore trait definition
//!
//! Ephemeral cluster-wide state: node heartbeats, the primary record and job
//! claims. Keys carry an optional TTL; an expired key behaves as absent.
//! `compare_and_swap` is the only write primitive used for contended keys
//! (primary election, claim hand-off).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Error type for coordination operations
#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    /// Backend failure (connection lost, query failed)
    #[error("coordination backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Subscription channel closed
    #[error("subscription closed")]
    Closed,
}

/// A live subscription to a pub/sub channel
///
/// Messages published after the subscription was created are delivered in
/// publish order per publisher. Dropping the subscription unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Receive the next message; `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// Shared key/value + pub/sub port
///
/// All operations target a logically shared cluster-wide namespace.
/// Implementations must be thread-safe.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Read a key; expired keys read as absent
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError>;

    /// Write a key, unconditionally, with an optional TTL
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError>;

    /// Conditionally write a key
    ///
    /// With `expected = None` the write succeeds only if the key is absent
    /// (or expired). With `expected = Some(v)` it succeeds only if the
    /// current live value equals `v`. Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordError>;

    /// Remove a key
    async fn delete(&self, key: &str) -> Result<(), CoordError>;

    /// Live keys under a prefix, with their values, sorted by key
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordError>;

    /// Publish a payload to a channel
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoordError>;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> Result<Subscription, CoordError>;
}
