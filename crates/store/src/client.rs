//! Redis-backed key-value store.
//! Counters live in hashes; batches go through a MULTI/EXEC pipeline.

use crate::kv::{Increment, KvStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use variant_core::config::RedisConfig;
use variant_core::types::{MetricValue, MetricsBucket};
use variant_core::{ExperimentError, ExperimentResult};

const CAS_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
local matches
if ARGV[1] == '' then matches = (current == false) else matches = (current == ARGV[2]) end
if not matches then return 0 end
if tonumber(ARGV[4]) > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'EX', ARGV[4])
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
";

const INSERT_NEW_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
if tonumber(ARGV[2]) > 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
else
  redis.call('SET', KEYS[1], ARGV[1])
end
redis.call('SADD', KEYS[2], ARGV[3])
return 1
";

fn store_err(err: redis::RedisError) -> ExperimentError {
    metrics::counter!("store.redis.errors").increment(1);
    ExperimentError::store(err)
}

/// Redis store. Holds no connection until [`KvStore::connect`] succeeds.
pub struct RedisKv {
    client: redis::Client,
    url: String,
    conn: RwLock<Option<ConnectionManager>>,
    retry_count: u32,
    retry_interval: Duration,
    connect_timeout: Duration,
}

impl RedisKv {
    /// Parses the first configured URL; no network traffic happens here.
    pub fn new(config: &RedisConfig) -> ExperimentResult<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());
        let client = redis::Client::open(url.as_str())
            .map_err(|e| ExperimentError::Config(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client,
            url,
            conn: RwLock::new(None),
            retry_count: config.retry_count,
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        })
    }

    fn connection(&self) -> ExperimentResult<ConnectionManager> {
        self.conn
            .read()
            .clone()
            .ok_or(ExperimentError::NotConnected("redis"))
    }

    async fn try_connect(&self) -> ExperimentResult<ConnectionManager> {
        let manager = tokio::time::timeout(
            self.connect_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        .map_err(|_| ExperimentError::Store("redis connect timed out".to_string()))?
        .map_err(store_err)?;

        let mut conn = manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        debug!(response = %pong, "Redis ping");
        Ok(manager)
    }
}

fn ttl_arg(ttl_secs: Option<u64>) -> u64 {
    ttl_secs.unwrap_or(0)
}

/// One MULTI/EXEC block. HINCRBY fails once a field holds a fraction, so
/// every increment goes through HINCRBYFLOAT; whole results still read back
/// as integers.
fn increment_pipeline(increments: &[Increment]) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for inc in increments {
        pipe.cmd("HINCRBYFLOAT")
            .arg(&inc.key)
            .arg(&inc.field)
            .arg(inc.by.as_f64())
            .ignore();
    }
    pipe
}

#[async_trait]
impl KvStore for RedisKv {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> ExperimentResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        info!(url = %self.url, "Connecting to Redis");

        let mut last_error = None;
        for attempt in 0..=self.retry_count {
            match self.try_connect().await {
                Ok(manager) => {
                    *self.conn.write() = Some(manager);
                    info!(attempt, "Redis connection established");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Redis connection attempt failed");
                    last_error = Some(e);
                    if attempt < self.retry_count {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or(ExperimentError::NotConnected("redis")))
    }

    async fn disconnect(&self) -> ExperimentResult<()> {
        if self.conn.write().take().is_some() {
            info!(url = %self.url, "Redis connection released");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.read().is_some()
    }

    async fn get(&self, key: &str) -> ExperimentResult<Option<String>> {
        let mut conn = self.connection()?;
        conn.get(key).await.map_err(store_err)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> ExperimentResult<bool> {
        let mut conn = self.connection()?;
        let swapped: i32 = redis::Script::new(CAS_SCRIPT)
            .key(key)
            .arg(if expected.is_some() { "1" } else { "" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl_arg(ttl_secs))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(swapped == 1)
    }

    async fn insert_new(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
        registry: &str,
        member: &str,
    ) -> ExperimentResult<bool> {
        let mut conn = self.connection()?;
        let inserted: i32 = redis::Script::new(INSERT_NEW_SCRIPT)
            .key(key)
            .key(registry)
            .arg(value)
            .arg(ttl_arg(ttl_secs))
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(inserted == 1)
    }

    async fn set_contains(&self, set: &str, member: &str) -> ExperimentResult<bool> {
        let mut conn = self.connection()?;
        conn.sismember(set, member).await.map_err(store_err)
    }

    async fn increment_batch(&self, increments: &[Increment]) -> ExperimentResult<()> {
        if increments.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection()?;
        increment_pipeline(increments)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn get_counters(&self, key: &str) -> ExperimentResult<MetricsBucket> {
        let mut conn = self.connection()?;
        let raw: HashMap<String, String> = conn.hgetall(key).await.map_err(store_err)?;
        let mut bucket = MetricsBucket::new();
        for (field, value) in raw {
            match MetricValue::parse(&value) {
                Some(v) => {
                    bucket.insert(field, v);
                }
                None => warn!(key, field = %field, value = %value, "Unparseable counter"),
            }
        }
        Ok(bucket)
    }
}
