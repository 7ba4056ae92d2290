use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Client, Script, aio::MultiplexedConnection};
use tokio::sync::OnceCell;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::RedisConfig,
    error::TrackerError,
    models::{request::Channel, retry::RetryConfig, status::DeliveryStatus},
    tracker::{StatusStore, VersionedStatus},
    utils::retry_with_backoff,
};

/// Writes `data` and bumps `version` only when the stored version matches ARGV[1].
const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if current == false then current = '0' end
if current ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'version', tostring(tonumber(ARGV[1]) + 1), 'data', ARGV[2])
return 1
"#;

const PROVIDER_ID_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Decides a compare-and-swap whose reply was lost, from what the key holds now.
///
/// `Some(applied)` is final; `None` means the write certainly did not land and may be retried.
fn settle_lost_write(expected: u64, stored: Option<(u64, &str)>, data: &str) -> Option<bool> {
    match stored {
        Some((version, current)) if version == expected + 1 && current == data => Some(true),
        Some((version, _)) if version == expected => None,
        None if expected == 0 => None,
        _ => Some(false),
    }
}

/// Delivery records as Redis hashes `{version, data}` plus sorted-set indexes.
pub struct RedisStatusStore {
    client: Client,
    pool: Vec<OnceCell<MultiplexedConnection>>,
    next: AtomicUsize,
    prefix: String,
    cas: Script,
    write_retry: RetryConfig,
}

impl RedisStatusStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self, Error> {
        info!(url = %config.url, "Connecting to Redis");

        let client = Client::open(config.url.as_str())
            .map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

        let pool: Vec<OnceCell<MultiplexedConnection>> =
            (0..config.max_connections.max(1)).map(|_| OnceCell::new()).collect();

        for cell in pool.iter().take(config.min_connections as usize) {
            let connection = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;
            let _ = cell.set(connection);
        }

        info!(
            min_connections = config.min_connections,
            max_connections = config.max_connections,
            "Redis connection established"
        );

        Ok(Self {
            client,
            pool,
            next: AtomicUsize::new(0),
            prefix: config.key_prefix.clone(),
            cas: Script::new(CAS_SCRIPT),
            write_retry: RetryConfig {
                max_retries: 2,
                initial_delay_ms: 50,
                max_delay_ms: 500,
                ..RetryConfig::default()
            },
        })
    }

    /// Round-robins over the pool, opening connections on first use.
    async fn connection(&self) -> Result<MultiplexedConnection, TrackerError> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        let connection = self.pool[slot]
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        Ok(connection.clone())
    }

    fn status_key(&self, message_id: &str) -> String {
        format!("{}:status:{}", self.prefix, message_id)
    }

    fn failed_key(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    fn retries_key(&self) -> String {
        format!("{}:retries", self.prefix)
    }

    fn provider_key(&self, channel: Channel, provider_message_id: &str) -> String {
        format!("{}:provider:{}:{}", self.prefix, channel, provider_message_id)
    }

    async fn stored(&self, key: &str) -> Result<Option<(u64, String)>, TrackerError> {
        let mut conn = self.connection().await?;
        let (version, data): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(key)
            .arg("version")
            .arg("data")
            .query_async(&mut conn)
            .await?;

        Ok(version.zip(data))
    }

    async fn run_cas(&self, key: &str, expected: u64, data: &str) -> Result<bool, TrackerError> {
        let mut conn = self.connection().await?;
        let applied: i32 = self
            .cas
            .key(key)
            .arg(expected)
            .arg(data)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn zadd(&self, key: String, member: &str, score: i64) -> Result<(), TrackerError> {
        retry_with_backoff(&self.write_retry, || {
            let key = key.clone();
            async move {
                let mut conn = self.connection().await?;
                let _: () = conn.zadd(&key, member, score).await?;
                Ok::<_, TrackerError>(())
            }
        })
        .await
    }
}

#[async_trait]
impl StatusStore for RedisStatusStore {
    async fn load(&self, message_id: &str) -> Result<Option<VersionedStatus>, TrackerError> {
        match self.stored(&self.status_key(message_id)).await? {
            Some((version, data)) => Ok(Some(VersionedStatus {
                version,
                status: serde_json::from_str(&data)?,
            })),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        status: &DeliveryStatus,
        expected: u64,
    ) -> Result<bool, TrackerError> {
        let key = self.status_key(&status.message_id);
        let data = serde_json::to_string(status)?;

        // the script is not idempotent, so a failed call is settled by reading the key back
        let mut retry = 0;
        let applied = loop {
            let error = match self.run_cas(&key, expected, &data).await {
                Ok(applied) => break applied,
                Err(e) if retry < self.write_retry.max_retries => e,
                Err(e) => return Err(e),
            };
            warn!(message_id = %status.message_id, error = %error, "Compare-and-swap failed, checking stored version");

            if let Ok(stored) = self.stored(&key).await {
                let stored = stored.as_ref().map(|(v, d)| (*v, d.as_str()));
                if let Some(applied) = settle_lost_write(expected, stored, &data) {
                    break applied;
                }
            }

            sleep(self.write_retry.delay_for_retry(retry)).await;
            retry += 1;
        };

        debug!(message_id = %status.message_id, expected, applied, "Status compare-and-swap");
        Ok(applied)
    }

    async fn index_failed(&self, message_id: &str, at: DateTime<Utc>) -> Result<(), TrackerError> {
        self.zadd(self.failed_key(), message_id, at.timestamp_millis())
            .await
    }

    async fn failed_ids(&self, limit: usize) -> Result<Vec<String>, TrackerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        Ok(conn
            .zrevrange(self.failed_key(), 0, limit as isize - 1)
            .await?)
    }

    async fn index_retry(&self, message_id: &str, at: DateTime<Utc>) -> Result<(), TrackerError> {
        self.zadd(self.retries_key(), message_id, at.timestamp_millis())
            .await
    }

    async fn remove_retry(&self, message_id: &str) -> Result<(), TrackerError> {
        let mut conn = self.connection().await?;
        let _: () = conn.zrem(self.retries_key(), message_id).await?;
        Ok(())
    }

    async fn due_retry_ids(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, TrackerError> {
        let mut conn = self.connection().await?;
        Ok(conn
            .zrangebyscore_limit(
                self.retries_key(),
                "-inf",
                now.timestamp_millis(),
                0,
                limit as isize,
            )
            .await?)
    }

    async fn map_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
        message_id: &str,
    ) -> Result<(), TrackerError> {
        let key = self.provider_key(channel, provider_message_id);
        retry_with_backoff(&self.write_retry, || {
            let key = key.clone();
            async move {
                let mut conn = self.connection().await?;
                let _: () = conn.set_ex(&key, message_id, PROVIDER_ID_TTL_SECS).await?;
                Ok::<_, TrackerError>(())
            }
        })
        .await
    }

    async fn resolve_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> Result<Option<String>, TrackerError> {
        let mut conn = self.connection().await?;
        Ok(conn
            .get(self.provider_key(channel, provider_message_id))
            .await?)
    }

    async fn ping(&self) -> Result<(), TrackerError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
