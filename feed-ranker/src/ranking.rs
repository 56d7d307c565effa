use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use feed_common::cache::{versioned_key, CacheResult, SharedCacheClient};

use crate::cache::CacheOrchestrator;
use crate::candidates::{CandidateStore, FeedCandidate};
use crate::config::RankingConfig;
use crate::error::RankingError;

/// One entry of a ranked feed. `rank` is the position in the full ranked
/// list, not within the requested page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFeedEntry {
    pub post_id: Uuid,
    pub combined_score: f64,
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedPage {
    pub entries: Vec<RankedFeedEntry>,
    /// Set when every candidate source failed and the page is served from
    /// nothing rather than computed.
    pub degraded: bool,
}

impl FeedPage {
    fn degraded_empty() -> Self {
        Self {
            entries: Vec::new(),
            degraded: true,
        }
    }
}

struct ScoredCandidate {
    candidate: FeedCandidate,
    score: f64,
}

/// Key under which the precomputed trending set lives. The generator job
/// writes it; the trending candidate source reads it before falling back to
/// the store query.
pub fn trending_cache_key(window: Duration) -> String {
    versioned_key(&format!("trending:{}h", window.as_secs() / 3600))
}

/// Stateless per-request ranking over the three candidate sources, fronted
/// by the cache orchestrator. The full ranked list (bounded length) is
/// cached per user; pagination slices the cached list.
pub struct RankingEngine<S, C> {
    store: S,
    cache: Arc<CacheOrchestrator<C>>,
    config: RankingConfig,
}

impl<S, C> RankingEngine<S, C>
where
    S: CandidateStore,
    C: SharedCacheClient,
{
    pub fn new(store: S, cache: Arc<CacheOrchestrator<C>>, config: RankingConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    fn feed_key(user_id: Uuid) -> String {
        versioned_key(&format!("feed:{}:full", user_id))
    }

    /// Never fails: partial source failure narrows the candidate set, and
    /// only when all three sources fail does the caller see a degraded page.
    pub async fn get_feed(&self, user_id: Uuid, offset: usize, limit: usize) -> FeedPage {
        let started = Instant::now();
        let key = Self::feed_key(user_id);

        let outcome = self
            .cache
            .get_or_compute(&key, self.config.feed_ttl, self.compute_ranked_feed(user_id))
            .await;

        let page = match outcome {
            Ok(serialized) => match serde_json::from_str::<Vec<RankedFeedEntry>>(&serialized) {
                Ok(entries) => {
                    let entries = entries
                        .into_iter()
                        .skip(offset)
                        .take(limit)
                        .collect();
                    FeedPage {
                        entries,
                        degraded: false,
                    }
                }
                Err(error) => {
                    warn!(user_id = %user_id, "cached feed is unreadable: {}", error);
                    // evict the poison entry, otherwise every request until
                    // TTL expiry serves this degraded page
                    if let Err(error) = self.cache.invalidate(&key).await {
                        warn!(user_id = %user_id, "failed to evict unreadable feed: {}", error);
                    }
                    metrics::counter!("ranker_degraded_pages_total").increment(1);
                    FeedPage::degraded_empty()
                }
            },
            Err(error) => {
                warn!(user_id = %user_id, "feed computation failed, serving degraded page: {}", error);
                metrics::counter!("ranker_degraded_pages_total").increment(1);
                FeedPage::degraded_empty()
            }
        };

        metrics::histogram!("ranker_feed_latency_seconds").record(started.elapsed().as_secs_f64());
        page
    }

    /// Evicts the user's feed from both cache tiers. The next `get_feed`
    /// recomputes.
    pub async fn invalidate_feed(&self, user_id: Uuid) -> CacheResult<usize> {
        self.cache
            .invalidate_pattern(&versioned_key(&format!("feed:{}", user_id)))
            .await
    }

    async fn compute_ranked_feed(&self, user_id: Uuid) -> Result<String, RankingError> {
        let candidates = self.gather_candidates(user_id).await?;
        let entries = self.rank(candidates, Utc::now());
        Ok(serde_json::to_string(&entries)?)
    }

    /// Concurrent fan-out with a per-query timeout. A failed or timed-out
    /// source is dropped from the merge; only all three failing is an error.
    async fn gather_candidates(&self, user_id: Uuid) -> Result<Vec<FeedCandidate>, RankingError> {
        let cfg = &self.config;

        let (followed, trending, affinity) = tokio::join!(
            timeout(
                cfg.query_timeout,
                self.store
                    .followed_posts(user_id, cfg.followed_lookback, cfg.followed_cap),
            ),
            timeout(cfg.query_timeout, self.trending_candidates()),
            timeout(
                cfg.query_timeout,
                self.store.affinity_posts(
                    user_id,
                    cfg.affinity_recency,
                    cfg.affinity_window,
                    cfg.affinity_cap,
                ),
            ),
        );

        let mut batches = Vec::with_capacity(3);
        for (source, outcome) in [
            ("followed", unwrap_query(followed)),
            ("trending", unwrap_query(trending)),
            ("affinity", unwrap_query(affinity)),
        ] {
            match outcome {
                Ok(batch) => batches.push(batch),
                Err(error) => {
                    metrics::counter!("ranker_candidate_query_failures_total", "source" => source)
                        .increment(1);
                    warn!(source, "candidate query dropped from merge: {}", error);
                }
            }
        }

        if batches.is_empty() {
            return Err(RankingError::AllSourcesFailed);
        }

        Ok(merge_candidates(batches))
    }

    /// The trending source is shared across users, so the generator job
    /// precomputes it; the store query is the fallback for a cold or
    /// unreadable key.
    async fn trending_candidates(&self) -> Result<Vec<FeedCandidate>, RankingError> {
        let key = trending_cache_key(self.config.trending_window);
        if let Some(serialized) = self.cache.get(&key).await {
            match serde_json::from_str::<Vec<FeedCandidate>>(&serialized) {
                Ok(batch) => {
                    metrics::counter!("ranker_trending_cache_hits_total").increment(1);
                    return Ok(batch);
                }
                Err(error) => {
                    warn!("precomputed trending set is unreadable, querying: {}", error);
                }
            }
        }

        self.store
            .trending_posts(self.config.trending_window, self.config.trending_cap)
            .await
    }

    fn rank(&self, candidates: Vec<FeedCandidate>, now: DateTime<Utc>) -> Vec<RankedFeedEntry> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|candidate| ScoredCandidate {
                score: self.score(&candidate, now),
                candidate,
            })
            .collect();

        // score desc, then source priority, then post_id: fully
        // deterministic, and equal scores resolve in favor of the
        // higher-priority source so followed content leads mixed pages
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.candidate.source.cmp(&b.candidate.source))
                .then_with(|| a.candidate.post_id.cmp(&b.candidate.post_id))
        });

        let saturated = apply_saturation(scored, self.config.page_size, self.config.author_saturation);

        saturated
            .into_iter()
            .take(self.config.max_feed_length)
            .enumerate()
            .map(|(rank, entry)| RankedFeedEntry {
                post_id: entry.candidate.post_id,
                combined_score: entry.score,
                rank,
            })
            .collect()
    }

    fn score(&self, candidate: &FeedCandidate, now: DateTime<Utc>) -> f64 {
        let cfg = &self.config;

        let age_hours = (now - candidate.created_at).num_seconds().max(0) as f64 / 3600.0;
        let freshness = (-cfg.decay_lambda * age_hours).exp();

        // impressions guard: rollups only learn impressions from correction
        // events, so a zero denominator is the common case
        let impressions = candidate.signals.impressions.max(1) as f64;
        let engagement = (candidate.signals.weighted_interactions() as f64 / impressions).ln_1p();

        let affinity = (candidate.signals.affinity_interactions as f64).ln_1p();

        cfg.weight_freshness * freshness
            + cfg.weight_engagement * engagement
            + cfg.weight_affinity * affinity
    }
}

fn unwrap_query(
    outcome: Result<Result<Vec<FeedCandidate>, RankingError>, tokio::time::error::Elapsed>,
) -> Result<Vec<FeedCandidate>, RankingError> {
    match outcome {
        Ok(inner) => inner,
        Err(_) => Err(RankingError::QueryTimeout),
    }
}

/// Dedup by post_id: the highest-priority source wins the tag, raw signals
/// are unioned across all sightings.
fn merge_candidates(batches: Vec<Vec<FeedCandidate>>) -> Vec<FeedCandidate> {
    let mut merged: HashMap<Uuid, FeedCandidate> = HashMap::new();

    for candidate in batches.into_iter().flatten() {
        match merged.entry(candidate.post_id) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.signals.union(&candidate.signals);
                if candidate.source < existing.source {
                    existing.source = candidate.source;
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(candidate);
            }
        }
    }

    merged.into_values().collect()
}

/// Enforces the per-author cap per page-sized window. Entries over the cap
/// are deferred to a later window, never dropped; relative order among the
/// survivors of each window is preserved. Windows are fixed (tumbling), so
/// a span straddling a window boundary can see up to twice the cap from one
/// author; the invariant holds for pages aligned to `window`.
fn apply_saturation(
    mut pending: Vec<ScoredCandidate>,
    window: usize,
    cap: usize,
) -> Vec<ScoredCandidate> {
    let window = window.max(1);
    let cap = cap.max(1);
    let mut result = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let mut chunk = Vec::with_capacity(window);
        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        let mut deferred = Vec::new();

        for entry in pending.drain(..) {
            let count = counts.entry(entry.candidate.author_id).or_insert(0);
            if chunk.len() < window && *count < cap {
                *count += 1;
                chunk.push(entry);
            } else {
                deferred.push(entry);
            }
        }

        result.append(&mut chunk);
        pending = deferred;
    }

    result
}


#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use feed_common::cache::MemoryCacheClient;

    use super::*;
    use crate::candidates::{CandidateSource, RawSignals};
    use crate::test_utils::MemoryCandidateStore;

    fn candidate(
        author_id: Uuid,
        source: CandidateSource,
        created_at: DateTime<Utc>,
        signals: RawSignals,
    ) -> FeedCandidate {
        FeedCandidate {
            post_id: Uuid::now_v7(),
            author_id,
            created_at,
            source,
            signals,
        }
    }

    fn engine(
        store: MemoryCandidateStore,
        config: RankingConfig,
    ) -> RankingEngine<MemoryCandidateStore, MemoryCacheClient> {
        let cache = Arc::new(CacheOrchestrator::new(
            MemoryCacheClient::new(),
            1000,
            Duration::from_secs(60),
        ));
        RankingEngine::new(store, cache, config)
    }

    #[tokio::test]
    async fn test_scenario_followed_outrank_equally_fresh_trending() {
        let store = MemoryCandidateStore::new();
        let posted_at = Utc::now() - chrono::Duration::hours(2);

        let mut followed_ids = Vec::new();
        for _ in 0..5 {
            let c = candidate(
                Uuid::now_v7(),
                CandidateSource::Followed,
                posted_at,
                RawSignals::default(),
            );
            followed_ids.push(c.post_id);
            store.push_followed(c);
        }
        for _ in 0..10 {
            store.push_trending(candidate(
                Uuid::now_v7(),
                CandidateSource::Trending,
                posted_at,
                RawSignals::default(),
            ));
        }

        let engine = engine(store, RankingConfig::default());
        let page = engine.get_feed(Uuid::now_v7(), 0, 20).await;

        assert!(!page.degraded);
        assert_eq!(page.entries.len(), 15);
        let head: HashSet<Uuid> = page.entries[..5].iter().map(|e| e.post_id).collect();
        for id in followed_ids {
            assert!(head.contains(&id), "followed post ranked below trending");
        }
    }

    #[tokio::test]
    async fn test_saturation_caps_author_per_window_without_dropping() {
        let store = MemoryCandidateStore::new();
        let prolific = Uuid::now_v7();
        let now = Utc::now();

        // the prolific author's posts are freshest, so unsaturated ranking
        // would fill the first page with them
        let mut prolific_ids = HashSet::new();
        for i in 0..8 {
            let c = candidate(
                prolific,
                CandidateSource::Followed,
                now - chrono::Duration::minutes(i),
                RawSignals::default(),
            );
            prolific_ids.insert(c.post_id);
            store.push_followed(c);
        }
        for i in 0..12 {
            store.push_followed(candidate(
                Uuid::now_v7(),
                CandidateSource::Followed,
                now - chrono::Duration::hours(5 + i),
                RawSignals::default(),
            ));
        }

        let config = RankingConfig {
            page_size: 5,
            author_saturation: 2,
            ..RankingConfig::default()
        };
        let engine = engine(store, config);
        let page = engine.get_feed(Uuid::now_v7(), 0, 100).await;

        assert_eq!(page.entries.len(), 20, "saturation must never drop entries");

        let unique: HashSet<Uuid> = page.entries.iter().map(|e| e.post_id).collect();
        assert_eq!(unique.len(), 20);

        for window in page.entries.chunks(5) {
            let from_prolific = window
                .iter()
                .filter(|e| prolific_ids.contains(&e.post_id))
                .count();
            assert!(from_prolific <= 2, "author over cap in a page window");
        }
    }

    #[tokio::test]
    async fn test_ordering_is_deterministic_across_recomputes() {
        let store = MemoryCandidateStore::new();
        let now = Utc::now();
        for i in 0..30 {
            store.push_trending(candidate(
                Uuid::now_v7(),
                CandidateSource::Trending,
                now - chrono::Duration::hours(i % 7),
                RawSignals {
                    likes: i,
                    ..Default::default()
                },
            ));
        }

        let engine = engine(store, RankingConfig::default());
        let user = Uuid::now_v7();

        let first = engine.get_feed(user, 0, 30).await;
        engine.invalidate_feed(user).await.unwrap();
        let second = engine.get_feed(user, 0, 30).await;

        assert_eq!(first.entries.len(), second.entries.len());
        for (a, b) in first.entries.iter().zip(second.entries.iter()) {
            assert_eq!(a.post_id, b.post_id);
            assert_eq!(a.rank, b.rank);
        }
    }

    #[tokio::test]
    async fn test_partial_failure_narrows_instead_of_failing() {
        let store = MemoryCandidateStore::new();
        store.push_trending(candidate(
            Uuid::now_v7(),
            CandidateSource::Trending,
            Utc::now() - chrono::Duration::hours(1),
            RawSignals::default(),
        ));
        store.fail_followed(true);
        store.fail_affinity(true);

        let engine = engine(store, RankingConfig::default());
        let page = engine.get_feed(Uuid::now_v7(), 0, 20).await;

        assert!(!page.degraded);
        assert_eq!(page.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_all_sources_down_serves_bounded_degraded_page() {
        let store = MemoryCandidateStore::new();
        store.fail_followed(true);
        store.fail_trending(true);
        store.fail_affinity(true);

        let config = RankingConfig {
            query_timeout: Duration::from_millis(50),
            ..RankingConfig::default()
        };
        let engine = engine(store, config);

        let page = tokio::time::timeout(
            Duration::from_secs(1),
            engine.get_feed(Uuid::now_v7(), 0, 20),
        )
        .await
        .expect("degraded path must not hang");

        assert!(page.degraded);
        assert!(page.entries.is_empty());
    }

    #[tokio::test]
    async fn test_slow_source_is_timed_out_and_narrowed() {
        let store = MemoryCandidateStore::new();
        let now = Utc::now();
        store.push_trending(candidate(
            Uuid::now_v7(),
            CandidateSource::Trending,
            now - chrono::Duration::hours(1),
            RawSignals::default(),
        ));
        store.push_followed(candidate(
            Uuid::now_v7(),
            CandidateSource::Followed,
            now - chrono::Duration::hours(1),
            RawSignals::default(),
        ));
        store.delay_followed(Duration::from_millis(200));

        let config = RankingConfig {
            query_timeout: Duration::from_millis(50),
            ..RankingConfig::default()
        };
        let engine = engine(store, config);
        let page = engine.get_feed(Uuid::now_v7(), 0, 20).await;

        assert!(!page.degraded);
        assert_eq!(page.entries.len(), 1, "slow source should be dropped");
    }

    #[tokio::test]
    async fn test_concurrent_requests_compute_once() {
        let store = MemoryCandidateStore::new();
        store.push_trending(candidate(
            Uuid::now_v7(),
            CandidateSource::Trending,
            Utc::now() - chrono::Duration::hours(1),
            RawSignals::default(),
        ));

        let engine = Arc::new(engine(store.clone(), RankingConfig::default()));
        let user = Uuid::now_v7();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.get_feed(user, 0, 20).await }));
        }
        for handle in handles {
            assert!(!handle.await.unwrap().degraded);
        }

        // one computation = one round of three candidate queries
        assert_eq!(store.query_count(), 3);
    }

    #[tokio::test]
    async fn test_invalidation_forces_fresh_feed() {
        let store = MemoryCandidateStore::new();
        store.push_trending(candidate(
            Uuid::now_v7(),
            CandidateSource::Trending,
            Utc::now() - chrono::Duration::hours(1),
            RawSignals::default(),
        ));

        let engine = engine(store.clone(), RankingConfig::default());
        let user = Uuid::now_v7();

        let before = engine.get_feed(user, 0, 20).await;
        assert_eq!(before.entries.len(), 1);

        let fresh = candidate(
            Uuid::now_v7(),
            CandidateSource::Trending,
            Utc::now() - chrono::Duration::minutes(1),
            RawSignals::default(),
        );
        let fresh_id = fresh.post_id;
        store.push_trending(fresh);

        // still cached
        assert_eq!(engine.get_feed(user, 0, 20).await.entries.len(), 1);

        engine.invalidate_feed(user).await.unwrap();
        let after = engine.get_feed(user, 0, 20).await;

        assert_eq!(after.entries.len(), 2);
        assert!(after.entries.iter().any(|e| e.post_id == fresh_id));
    }

    #[tokio::test]
    async fn test_precomputed_trending_set_is_read_before_the_store() {
        let store = MemoryCandidateStore::new();
        let cache = Arc::new(CacheOrchestrator::new(
            MemoryCacheClient::new(),
            1000,
            Duration::from_secs(60),
        ));
        let config = RankingConfig::default();

        let warm = vec![candidate(
            Uuid::now_v7(),
            CandidateSource::Trending,
            Utc::now() - chrono::Duration::hours(1),
            RawSignals {
                likes: 30,
                ..Default::default()
            },
        )];
        let warm_id = warm[0].post_id;
        cache
            .set(
                &trending_cache_key(config.trending_window),
                &serde_json::to_string(&warm).unwrap(),
                Duration::from_secs(120),
            )
            .await
            .unwrap();

        let engine = RankingEngine::new(store.clone(), cache, config);
        let page = engine.get_feed(Uuid::now_v7(), 0, 20).await;

        assert!(!page.degraded);
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].post_id, warm_id);

        // only followed and affinity hit the store
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_cached_feed_is_evicted_and_recomputed() {
        let store = MemoryCandidateStore::new();
        store.push_trending(candidate(
            Uuid::now_v7(),
            CandidateSource::Trending,
            Utc::now() - chrono::Duration::hours(1),
            RawSignals::default(),
        ));

        let cache = Arc::new(CacheOrchestrator::new(
            MemoryCacheClient::new(),
            1000,
            Duration::from_secs(60),
        ));
        let user = Uuid::now_v7();
        let key = RankingEngine::<MemoryCandidateStore, MemoryCacheClient>::feed_key(user);
        cache
            .set(&key, "not a feed", Duration::from_secs(600))
            .await
            .unwrap();

        let engine = RankingEngine::new(store, cache, RankingConfig::default());

        let first = engine.get_feed(user, 0, 20).await;
        assert!(first.degraded);

        // the corrupt entry was evicted, so the next request recomputes
        let second = engine.get_feed(user, 0, 20).await;
        assert!(!second.degraded);
        assert_eq!(second.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_pagination_slices_the_cached_list() {
        let store = MemoryCandidateStore::new();
        let now = Utc::now();
        for i in 0..10 {
            store.push_trending(candidate(
                Uuid::now_v7(),
                CandidateSource::Trending,
                now - chrono::Duration::hours(i),
                RawSignals::default(),
            ));
        }

        let engine = engine(store.clone(), RankingConfig::default());
        let user = Uuid::now_v7();

        let full = engine.get_feed(user, 0, 10).await;
        let second_page = engine.get_feed(user, 4, 3).await;

        assert_eq!(second_page.entries.len(), 3);
        assert_eq!(second_page.entries[0].post_id, full.entries[4].post_id);
        assert_eq!(second_page.entries[2].post_id, full.entries[6].post_id);

        let past_end = engine.get_feed(user, 100, 10).await;
        assert!(past_end.entries.is_empty());
        assert!(!past_end.degraded);

        // all three pages came from one computation
        assert_eq!(store.query_count(), 3);
    }

    #[tokio::test]
    async fn test_engagement_and_affinity_lift_scores() {
        let store = MemoryCandidateStore::new();
        let posted_at = Utc::now() - chrono::Duration::hours(3);

        let plain = candidate(
            Uuid::now_v7(),
            CandidateSource::Trending,
            posted_at,
            RawSignals::default(),
        );
        let plain_id = plain.post_id;
        store.push_trending(plain);
        store.push_trending(candidate(
            Uuid::now_v7(),
            CandidateSource::Trending,
            posted_at,
            RawSignals {
                likes: 10,
                comments: 5,
                shares: 2,
                ..Default::default()
            },
        ));
        store.push_affinity(candidate(
            Uuid::now_v7(),
            CandidateSource::Affinity,
            posted_at,
            RawSignals {
                affinity_interactions: 40,
                ..Default::default()
            },
        ));

        let engine = engine(store, RankingConfig::default());
        let page = engine.get_feed(Uuid::now_v7(), 0, 10).await;

        assert_eq!(page.entries.len(), 3);
        assert_eq!(
            page.entries[2].post_id, plain_id,
            "unsignalled post ranks last"
        );
        assert!(page.entries[0].combined_score > page.entries[2].combined_score);
    }

    #[test]
    fn test_merge_prefers_higher_priority_source_and_unions_signals() {
        let shared_id = Uuid::now_v7();
        let author = Uuid::now_v7();
        let created_at = Utc::now();

        let trending = FeedCandidate {
            post_id: shared_id,
            author_id: author,
            created_at,
            source: CandidateSource::Trending,
            signals: RawSignals {
                likes: 7,
                ..Default::default()
            },
        };
        let followed = FeedCandidate {
            post_id: shared_id,
            author_id: author,
            created_at,
            source: CandidateSource::Followed,
            signals: RawSignals::default(),
        };
        let affinity = FeedCandidate {
            post_id: shared_id,
            author_id: author,
            created_at,
            source: CandidateSource::Affinity,
            signals: RawSignals {
                affinity_interactions: 9,
                ..Default::default()
            },
        };

        let merged = merge_candidates(vec![vec![trending], vec![followed], vec![affinity]]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, CandidateSource::Followed);
        assert_eq!(merged[0].signals.likes, 7);
        assert_eq!(merged[0].signals.affinity_interactions, 9);
    }
}
