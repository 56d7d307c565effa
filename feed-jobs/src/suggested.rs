use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use feed_common::cache::{versioned_key, SharedCacheClient};
use feed_ranker::cache::CacheOrchestrator;
use feed_ranker::candidates::CandidateStore;

use crate::error::JobError;
use crate::runner::Job;

/// Per-user suggested authors: high-affinity authors the user does not
/// already follow, ranked by interaction strength. Computed for the
/// currently active users, cached per user.
pub struct SuggestedAuthorsGenerator<S, C> {
    store: S,
    cache: Arc<CacheOrchestrator<C>>,
    activity_window: Duration,
    affinity_window: Duration,
    user_limit: i64,
    per_user_limit: i64,
    ttl: Duration,
}

impl<S, C> SuggestedAuthorsGenerator<S, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: S,
        cache: Arc<CacheOrchestrator<C>>,
        activity_window: Duration,
        affinity_window: Duration,
        user_limit: i64,
        per_user_limit: i64,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            activity_window,
            affinity_window,
            user_limit,
            per_user_limit,
            ttl,
        }
    }

    pub fn cache_key(user_id: Uuid) -> String {
        versioned_key(&format!("suggested:{}", user_id))
    }
}

#[async_trait]
impl<S, C> Job for SuggestedAuthorsGenerator<S, C>
where
    S: CandidateStore + 'static,
    C: SharedCacheClient + 'static,
{
    fn name(&self) -> &'static str {
        "suggested_authors_generator"
    }

    async fn run(&self) -> Result<(), JobError> {
        let since = Utc::now()
            - chrono::Duration::from_std(self.activity_window)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let users = self.store.most_active_users(since, self.user_limit).await?;

        for user_id in users {
            let suggested = self
                .store
                .suggested_authors(user_id, self.affinity_window, self.per_user_limit)
                .await?;
            if suggested.is_empty() {
                continue;
            }

            let serialized = serde_json::to_string(&suggested)?;
            self.cache
                .set(&Self::cache_key(user_id), &serialized, self.ttl)
                .await?;
            metrics::counter!("suggested_lists_written_total").increment(1);
        }

        Ok(())
    }
}
