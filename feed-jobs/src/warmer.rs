use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use feed_common::cache::SharedCacheClient;
use feed_ranker::candidates::CandidateStore;
use feed_ranker::ranking::RankingEngine;

use crate::error::JobError;
use crate::runner::Job;

/// Materializes the first feed page for the most active users before they
/// ask for it, so their request path is a cache hit.
pub struct CacheWarmer<S, C> {
    engine: Arc<RankingEngine<S, C>>,
    store: S,
    activity_window: Duration,
    user_limit: i64,
}

impl<S, C> CacheWarmer<S, C> {
    pub fn new(
        engine: Arc<RankingEngine<S, C>>,
        store: S,
        activity_window: Duration,
        user_limit: i64,
    ) -> Self {
        Self {
            engine,
            store,
            activity_window,
            user_limit,
        }
    }
}

#[async_trait]
impl<S, C> Job for CacheWarmer<S, C>
where
    S: CandidateStore + 'static,
    C: SharedCacheClient + 'static,
{
    fn name(&self) -> &'static str {
        "cache_warmer"
    }

    async fn run(&self) -> Result<(), JobError> {
        let since = Utc::now()
            - chrono::Duration::from_std(self.activity_window)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let users = self.store.most_active_users(since, self.user_limit).await?;

        let page_size = self.engine.config().page_size;
        let mut warmed = 0u64;
        for user_id in users {
            let page = self.engine.get_feed(user_id, 0, page_size).await;
            if !page.degraded {
                warmed += 1;
            }
            debug!(user_id = %user_id, degraded = page.degraded, "warmed feed page");
        }

        metrics::counter!("warmer_feeds_warmed_total").increment(warmed);
        Ok(())
    }
}
