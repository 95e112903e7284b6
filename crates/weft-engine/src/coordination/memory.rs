//! In-memory implementation of CoordinationStore
//!
//! Backs tests and single-node deployments. TTLs are evaluated against the
//! injected clock, so liveness and lease-expiry tests are deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use weft_core::clock::{Clock, SharedClock, SystemClock};

use super::store::{CoordError, CoordinationStore, Subscription};

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// In-memory implementation of CoordinationStore
///
/// Clone the `Arc` and hand it to every component under test; the namespace
/// is shared the way a real cluster store would be.
pub struct InMemoryCoordinationStore {
    entries: Mutex<HashMap<String, Entry>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
    clock: SharedClock,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()))
    }

    /// Number of live keys (for assertions)
    pub fn live_key_count(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .lock()
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError> {
        let expires_at = self.expiry(ttl);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut entries = self.entries.lock();

        let current: Option<String> = entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone());
        if current.as_deref() != expected {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordError> {
        let now = self.clock.now();
        let mut live: Vec<(String, String)> = self
            .entries
            .lock()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        live.sort();
        Ok(live)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoordError> {
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(channel) {
            senders.retain(|tx| tx.try_send(payload.to_string()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, CoordError> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::clock::ManualClock;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryCoordinationStore::new();

        store.put("primary", "n1", None).await.unwrap();
        assert_eq!(store.get("primary").await.unwrap(), Some("n1".to_string()));

        store.delete("primary").await.unwrap();
        assert_eq!(store.get("primary").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_clock_driven() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryCoordinationStore::with_clock(clock.clone());

        store
            .put("nodes/n1", "alive", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(store.get("nodes/n1").await.unwrap().is_some());

        clock.advance(Duration::from_secs(31));
        assert!(store.get("nodes/n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cas_insert_only_when_absent() {
        let store = InMemoryCoordinationStore::new();

        assert!(store.compare_and_swap("primary", None, "n1", None).await.unwrap());
        assert!(!store.compare_and_swap("primary", None, "n2", None).await.unwrap());
        assert_eq!(store.get("primary").await.unwrap(), Some("n1".to_string()));
    }

    #[tokio::test]
    async fn test_cas_replaces_expected_value() {
        let store = InMemoryCoordinationStore::new();
        store.put("primary", "n1", None).await.unwrap();

        assert!(!store
            .compare_and_swap("primary", Some("n9"), "n2", None)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("primary", Some("n1"), "n2", None)
            .await
            .unwrap());
        assert_eq!(store.get("primary").await.unwrap(), Some("n2".to_string()));
    }

    #[tokio::test]
    async fn test_cas_treats_expired_as_absent() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryCoordinationStore::with_clock(clock.clone());

        store
            .put("primary", "n1", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(11));

        assert!(store.compare_and_swap("primary", None, "n2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_prefix_sorted_and_live_only() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryCoordinationStore::with_clock(clock.clone());

        store.put("nodes/n2", "b", None).await.unwrap();
        store.put("nodes/n1", "a", None).await.unwrap();
        store
            .put("nodes/n3", "c", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        store.put("claims/w1", "n1", None).await.unwrap();
        clock.advance(Duration::from_secs(6));

        let nodes = store.list_prefix("nodes/").await.unwrap();
        let keys: Vec<&str> = nodes.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["nodes/n1", "nodes/n2"]);
    }

    #[tokio::test]
    async fn test_pub_sub_delivery() {
        let store = InMemoryCoordinationStore::new();
        let mut subscription = store.subscribe("failover").await.unwrap();

        store.publish("failover", "n2 promoted").await.unwrap();
        assert_eq!(subscription.recv().await, Some("n2 promoted".to_string()));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let store = InMemoryCoordinationStore::new();
        store.publish("failover", "nobody listening").await.unwrap();
    }
}
