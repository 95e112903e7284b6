//! PostgreSQL implementation of CoordinationStore
//!
//! The shared namespace lives in the `coordination_kv` table; TTLs are
//! `expires_at` columns evaluated against the database clock, and
//! compare-and-set is a conditional UPDATE. Pub/sub rides on
//! `pg_notify` / `LISTEN`, so no polling is involved.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, warn};

use super::store::{CoordError, CoordinationStore, Subscription};

fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    ttl.map(|ttl| Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()))
}

/// PostgreSQL implementation of CoordinationStore
#[derive(Clone)]
pub struct PostgresCoordinationStore {
    pool: PgPool,
}

impl PostgresCoordinationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Remove expired keys. Expired keys already read as absent; this keeps
    /// the table from growing. Called periodically by the node.
    pub async fn purge_expired(&self) -> Result<u64, CoordError> {
        let result = sqlx::query("DELETE FROM coordination_kv WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(|e| CoordError::Backend(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CoordinationStore for PostgresCoordinationStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let row = sqlx::query(
            r#"
            SELECT value FROM coordination_kv
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoordError::Backend(e.to_string()))?;

        Ok(row.map(|r| r.get("value")))
    }

    #[instrument(skip(self, value))]
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CoordError> {
        sqlx::query(
            r#"
            INSERT INTO coordination_kv (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl))
        .execute(&self.pool)
        .await
        .map_err(|e| CoordError::Backend(e.to_string()))?;

        Ok(())
    }

    #[instrument(skip(self, new))]
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordError> {
        let rows_affected = match expected {
            // Insert-if-absent; an expired row counts as absent and is taken over.
            None => sqlx::query(
                r#"
                INSERT INTO coordination_kv (key, value, expires_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value,
                    expires_at = EXCLUDED.expires_at
                WHERE coordination_kv.expires_at IS NOT NULL
                  AND coordination_kv.expires_at <= NOW()
                "#,
            )
            .bind(key)
            .bind(new)
            .bind(expiry(ttl))
            .execute(&self.pool)
            .await
            .map_err(|e| CoordError::Backend(e.to_string()))?
            .rows_affected(),

            Some(expected) => sqlx::query(
                r#"
                UPDATE coordination_kv
                SET value = $2,
                    expires_at = $3
                WHERE key = $1
                  AND value = $4
                  AND (expires_at IS NULL OR expires_at > NOW())
                "#,
            )
            .bind(key)
            .bind(new)
            .bind(expiry(ttl))
            .bind(expected)
            .execute(&self.pool)
            .await
            .map_err(|e| CoordError::Backend(e.to_string()))?
            .rows_affected(),
        };

        Ok(rows_affected > 0)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), CoordError> {
        sqlx::query("DELETE FROM coordination_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| CoordError::Backend(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, CoordError> {
        // LIKE with the prefix escaped so keys containing % or _ stay literal
        let escaped = prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        let rows = sqlx::query(
            r#"
            SELECT key, value FROM coordination_kv
            WHERE key LIKE $1 || '%'
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY key
            "#,
        )
        .bind(escaped)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoordError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("key"), r.get("value")))
            .collect())
    }

    #[instrument(skip(self, payload))]
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoordError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| CoordError::Backend(e.to_string()))?;

        debug!(channel, "published notification");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, CoordError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| CoordError::Backend(e.to_string()))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| CoordError::Backend(e.to_string()))?;

        let channel = channel.to_string();
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        if tx.send(notification.payload().to_string()).await.is_err() {
                            debug!(channel, "subscriber dropped, stopping listener");
                            break;
                        }
                    }
                    Err(e) => {
                        // recv reconnects internally on transient errors; a
                        // returned error means the connection is gone for good.
                        error!(channel, "listener failed: {}", e);
                        break;
                    }
                }
            }
            warn!(channel, "subscription closed");
        });

        Ok(Subscription::new(rx))
    }
}
