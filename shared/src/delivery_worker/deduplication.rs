// ============================================================================
// Delivery Deduplication
// ============================================================================
//
// Optional guard against sending the same welcome notification twice when a
// record is redelivered (consumer crash before commit) or the publisher
// emitted a duplicate for the same token.
//
// Key: `delivered:{email}:{idempotency token}`, written only after the
// channel accepted the message, with a TTL longer than topic retention.
//
// The store is advisory: if it cannot be reached the executor delivers
// anyway, since a duplicate welcome is tolerated and a missed one is not.
//
// ============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::cmd;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

const KEY_PREFIX: &str = "delivered:";

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Whether a delivery was already recorded for `key`
    async fn is_processed(&self, key: &str) -> Result<bool>;

    /// Record a successful delivery for `key`, forgotten after `ttl`
    async fn mark_processed(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// Process-local store; only deduplicates within one worker process
#[derive(Debug, Default)]
pub struct InMemoryDedupStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn is_processed(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, expires_at| *expires_at > now);
        Ok(entries.contains_key(key))
    }

    async fn mark_processed(&self, key: &str, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }
}

/// Redis-backed store shared by every worker process in the group
pub struct RedisDedupStore {
    client: redis::Client,
    conn: RwLock<redis::aio::MultiplexedConnection>,
}

impl RedisDedupStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid REDIS_URL")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis dedup store");
        Ok(Self {
            client,
            conn: RwLock::new(conn),
        })
    }

    /// Run a Redis command with retry, reconnecting before the last attempt
    async fn execute<F, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(
            &mut redis::aio::MultiplexedConnection,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<T, redis::RedisError>> + Send + '_>,
        >,
    {
        const MAX_RETRIES: u32 = 3;
        const INITIAL_BACKOFF_MS: u64 = 100;

        let mut attempt = 1;
        loop {
            let result = {
                let mut conn = self.conn.write().await;
                operation(&mut conn).await
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= MAX_RETRIES {
                return Err(anyhow::anyhow!(
                    "Redis operation '{}' failed after {} attempts: {}",
                    operation_name,
                    MAX_RETRIES,
                    err
                ));
            }

            warn!(
                operation = operation_name,
                attempt = attempt,
                error = %err,
                "Redis operation failed, will retry"
            );
            tokio::time::sleep(Duration::from_millis(
                INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1),
            ))
            .await;

            if attempt == MAX_RETRIES - 1 {
                match self.client.get_multiplexed_async_connection().await {
                    Ok(new_conn) => {
                        *self.conn.write().await = new_conn;
                        info!("Reconnected to Redis");
                    }
                    Err(reconnect_err) => {
                        error!(error = %reconnect_err, "Failed to reconnect to Redis");
                    }
                }
            }
            attempt += 1;
        }
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn is_processed(&self, key: &str) -> Result<bool> {
        let redis_key = format!("{}{}", KEY_PREFIX, key);
        let exists: i64 = self
            .execute("dedup_exists", |conn| {
                let key = redis_key.clone();
                Box::pin(async move { cmd("EXISTS").arg(&key).query_async(conn).await })
            })
            .await?;
        Ok(exists > 0)
    }

    async fn mark_processed(&self, key: &str, ttl: Duration) -> Result<()> {
        let redis_key = format!("{}{}", KEY_PREFIX, key);
        let ttl_seconds = ttl.as_secs().max(1);
        self.execute("dedup_mark", |conn| {
            let key = redis_key.clone();
            Box::pin(async move {
                let _: () = cmd("SETEX")
                    .arg(&key)
                    .arg(ttl_seconds)
                    .arg(1)
                    .query_async(conn)
                    .await?;
                Ok(())
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_marks_and_checks() {
        let store = InMemoryDedupStore::new();
        assert!(!store.is_processed("a@x.com:tok").await.unwrap());

        store
            .mark_processed("a@x.com:tok", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.is_processed("a@x.com:tok").await.unwrap());
        assert!(!store.is_processed("a@x.com:other").await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_entries_expire() {
        let store = InMemoryDedupStore::new();
        store
            .mark_processed("a@x.com:tok", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.is_processed("a@x.com:tok").await.unwrap());
    }
}
