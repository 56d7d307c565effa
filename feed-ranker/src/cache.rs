use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache as MokaCache;
use rand::Rng;
use tracing::warn;

use feed_common::cache::{CacheResult, SharedCacheClient};

/// Shared-tier TTLs are jittered so entries written together do not expire
/// together.
fn jittered(ttl: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    ttl.mul_f64(factor)
}

/// Two cache tiers behind one interface: a small in-process `moka` tier in
/// front of the shared Redis tier.
///
/// Reads check local first, then shared (populating local on a hit). Writes
/// go to both. Shared-tier failures on the read path degrade to a miss
/// rather than an error. `get_or_compute` is the single-flight entry point:
/// concurrent misses on one key run the computation exactly once, everyone
/// else awaits that result.
pub struct CacheOrchestrator<C> {
    local: MokaCache<String, String>,
    shared: C,
}

impl<C: SharedCacheClient> CacheOrchestrator<C> {
    pub fn new(shared: C, local_capacity: u64, local_ttl: Duration) -> Self {
        let local = MokaCache::builder()
            .max_capacity(local_capacity)
            .time_to_live(local_ttl)
            .support_invalidation_closures()
            .build();

        Self { local, shared }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.local.get(key).await {
            metrics::counter!("cache_local_hits_total").increment(1);
            return Some(value);
        }

        match self.shared.get(key).await {
            Ok(Some(value)) => {
                metrics::counter!("cache_shared_hits_total").increment(1);
                self.local.insert(key.to_owned(), value.clone()).await;
                Some(value)
            }
            Ok(None) => {
                metrics::counter!("cache_misses_total").increment(1);
                None
            }
            Err(error) => {
                warn!(key, "shared cache read failed, treating as miss: {}", error);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.local.insert(key.to_owned(), value.to_owned()).await;
        self.shared.set_ex(key, value, jittered(ttl)).await
    }

    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.local.invalidate(key).await;
        self.shared.del(key).await
    }

    /// Evicts every key starting with `prefix` from both tiers.
    pub async fn invalidate_pattern(&self, prefix: &str) -> CacheResult<usize> {
        let owned_prefix = prefix.to_owned();
        if let Err(error) = self
            .local
            .invalidate_entries_if(move |key, _| key.starts_with(&owned_prefix))
        {
            warn!(prefix, "local pattern invalidation failed: {}", error);
        }

        self.shared.del_matching(&format!("{}*", prefix)).await
    }

    /// Read-through with single-flight recomputation. The local tier's
    /// per-key coalescing guarantees at most one concurrent `compute` per
    /// key; `ttl` applies to the shared tier only (the local tier keeps its
    /// own short expiry).
    pub async fn get_or_compute<E, F>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<String, Arc<E>>
    where
        E: Send + Sync + 'static,
        F: Future<Output = Result<String, E>>,
    {
        self.local
            .try_get_with(key.to_owned(), async {
                match self.shared.get(key).await {
                    Ok(Some(value)) => {
                        metrics::counter!("cache_shared_hits_total").increment(1);
                        return Ok(value);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(key, "shared cache read failed, recomputing: {}", error);
                    }
                }

                metrics::counter!("cache_recomputations_total").increment(1);
                let value = compute.await?;

                if let Err(error) = self.shared.set_ex(key, &value, jittered(ttl)).await {
                    warn!(key, "shared cache write-back failed: {}", error);
                }

                Ok(value)
            })
            .await
    }
}
