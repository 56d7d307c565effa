use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use feed_common::cache::SharedCacheClient;
use feed_ranker::cache::CacheOrchestrator;
use feed_ranker::candidates::CandidateStore;
use feed_ranker::ranking::trending_cache_key;

use crate::error::JobError;
use crate::runner::Job;

/// Precomputes the trending candidate set so live ranking requests read a
/// warm key instead of running the aggregation query.
pub struct TrendingGenerator<S, C> {
    store: S,
    cache: Arc<CacheOrchestrator<C>>,
    window: Duration,
    cap: i64,
    ttl: Duration,
}

impl<S, C> TrendingGenerator<S, C> {
    pub fn new(
        store: S,
        cache: Arc<CacheOrchestrator<C>>,
        window: Duration,
        cap: i64,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            window,
            cap,
            ttl,
        }
    }
}

#[async_trait]
impl<S, C> Job for TrendingGenerator<S, C>
where
    S: CandidateStore + 'static,
    C: SharedCacheClient + 'static,
{
    fn name(&self) -> &'static str {
        "trending_generator"
    }

    async fn run(&self) -> Result<(), JobError> {
        let candidates = self.store.trending_posts(self.window, self.cap).await?;
        metrics::gauge!("trending_set_size").set(candidates.len() as f64);

        let serialized = serde_json::to_string(&candidates)?;
        self.cache
            .set(&trending_cache_key(self.window), &serialized, self.ttl)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use feed_common::cache::MemoryCacheClient;
    use feed_ranker::candidates::{CandidateSource, FeedCandidate, RawSignals};
    use feed_ranker::test_utils::MemoryCandidateStore;

    use super::*;

    #[tokio::test]
    async fn test_trending_set_is_written_through_the_orchestrator() {
        let store = MemoryCandidateStore::new();
        let post_id = Uuid::now_v7();
        store.push_trending(FeedCandidate {
            post_id,
            author_id: Uuid::now_v7(),
            created_at: Utc::now(),
            source: CandidateSource::Trending,
            signals: RawSignals {
                likes: 50,
                ..Default::default()
            },
        });

        let shared = MemoryCacheClient::new();
        let cache = Arc::new(CacheOrchestrator::new(
            shared.clone(),
            1000,
            Duration::from_secs(60),
        ));
        let job = TrendingGenerator::new(
            store,
            cache.clone(),
            Duration::from_secs(24 * 3600),
            100,
            Duration::from_secs(120),
        );

        job.run().await.unwrap();

        let key = trending_cache_key(Duration::from_secs(24 * 3600));
        assert_eq!(key, "v1:trending:24h");

        // present in both tiers
        let local = cache.get(&key).await.expect("local tier warm");
        let shared_copy = shared.get(&key).await.unwrap().expect("shared tier warm");
        assert_eq!(local, shared_copy);

        let cached: Vec<FeedCandidate> = serde_json::from_str(&shared_copy).unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].post_id, post_id);
    }
}
