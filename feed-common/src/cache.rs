use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// All cache keys carry a version prefix so a format change can be rolled
/// out by bumping the version instead of flushing the cluster.
pub const CACHE_KEY_VERSION: &str = "v1";

// average for all commands is <10ms, check grafana
const REDIS_TIMEOUT_MILLISECS: u64 = 100;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("redis command timed out")]
    Timeout,
    #[error("redis error: {0}")]
    Client(#[from] redis::RedisError),
}

pub type CacheResult<T> = Result<T, CacheError>;

pub fn versioned_key(key: &str) -> String {
    format!("{}:{}", CACHE_KEY_VERSION, key)
}

/// The shared cache tier. One implementation talks to Redis; the in-memory
/// implementation backs unit tests.
///
/// `set_nx_ex` is the atomic conditional-set primitive required both by the
/// dedup "seen" set and by job guards: check and set happen as one command,
/// never as a read followed by a write.
#[async_trait]
pub trait SharedCacheClient: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Set only if the key does not exist, with a TTL. Returns true when
    /// this call created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    async fn del(&self, key: &str) -> CacheResult<()>;

    /// SCAN-based pattern delete (no blocking KEYS). Returns the number of
    /// keys removed.
    async fn del_matching(&self, pattern: &str) -> CacheResult<usize>;
}

#[async_trait]
impl<T: SharedCacheClient + ?Sized> SharedCacheClient for Arc<T> {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        (**self).get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        (**self).set_ex(key, value, ttl).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        (**self).set_nx_ex(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        (**self).del(key).await
    }

    async fn del_matching(&self, pattern: &str) -> CacheResult<usize> {
        (**self).del_matching(pattern).await
    }
}

pub struct RedisCacheClient {
    client: redis::Client,
}

impl RedisCacheClient {
    pub fn new(addr: &str) -> anyhow::Result<RedisCacheClient> {
        let client = redis::Client::open(addr)?;

        Ok(RedisCacheClient { client })
    }

    async fn connection(&self) -> CacheResult<redis::aio::Connection> {
        let conn = timeout(
            Duration::from_millis(REDIS_TIMEOUT_MILLISECS),
            self.client.get_async_connection(),
        )
        .await
        .map_err(|_| CacheError::Timeout)??;

        Ok(conn)
    }
}

#[async_trait]
impl SharedCacheClient for RedisCacheClient {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.connection().await?;

        let fut = conn.get(key);
        let value = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), fut)
            .await
            .map_err(|_| CacheError::Timeout)??;

        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.connection().await?;

        let fut = conn.set_ex::<_, _, ()>(key, value, ttl.as_secs() as usize);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), fut)
            .await
            .map_err(|_| CacheError::Timeout)??;

        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.connection().await?;

        // SET key value NX EX ttl is a single atomic command; the reply is
        // "OK" when the key was created and nil when it already existed.
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1));
        let fut = cmd.query_async::<_, Option<String>>(&mut conn);
        let reply = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), fut)
            .await
            .map_err(|_| CacheError::Timeout)??;

        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.connection().await?;

        let fut = conn.del::<_, ()>(key);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), fut)
            .await
            .map_err(|_| CacheError::Timeout)??;

        Ok(())
    }

    async fn del_matching(&self, pattern: &str) -> CacheResult<usize> {
        let mut conn = self.connection().await?;

        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        if keys.is_empty() {
            return Ok(0);
        }

        let deleted = keys.len();
        let fut = conn.del::<_, ()>(keys);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), fut)
            .await
            .map_err(|_| CacheError::Timeout)??;

        Ok(deleted)
    }
}

/// In-memory stand-in for the shared tier. Implements real SETNX and TTL
/// semantics (expiry checked lazily on access) so dedup-window and
/// single-flight tests run without a Redis server.
#[derive(Clone, Default)]
pub struct MemoryCacheClient {
    entries: Arc<Mutex<HashMap<String, (String, Option<Instant>)>>>,
}

impl MemoryCacheClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, (String, Option<Instant>)>,
        key: &str,
    ) -> Option<&'a String> {
        if let Some((_, Some(expires_at))) = entries.get(key) {
            if *expires_at <= Instant::now() {
                entries.remove(key);
                return None;
            }
        }
        entries.get(key).map(|(value, _)| value)
    }
}

#[async_trait]
impl SharedCacheClient for MemoryCacheClient {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key).cloned())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_owned(),
            (value.to_owned(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut entries = self.entries.lock().await;
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            (value.to_owned(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> CacheResult<()> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }

    async fn del_matching(&self, pattern: &str) -> CacheResult<usize> {
        // Supports trailing-star patterns only, which is all we emit.
        let prefix = pattern.trim_end_matches('*');
        let mut entries = self.entries.lock().await;
        let keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            entries.remove(key);
        }
        Ok(keys.len())
    }
}
