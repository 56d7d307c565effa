use std::time::Duration;

/// Knobs of the ranking formula and candidate queries. The weight triple and
/// λ are illustrative defaults, meant to be tuned from real traffic, so every
/// one of them is injected rather than hard-coded at the call sites.
#[derive(Debug, Clone)]
pub struct RankingConfig {
    pub weight_freshness: f64,
    pub weight_engagement: f64,
    pub weight_affinity: f64,
    /// Decay constant for `freshness = exp(-λ · age_hours)`.
    pub decay_lambda: f64,

    /// Lookback for posts by followed authors.
    pub followed_lookback: Duration,
    /// Engagement window for the trending source.
    pub trending_window: Duration,
    /// Post-recency window for the affinity source.
    pub affinity_recency: Duration,
    /// Rolling window inside which affinity interactions count.
    pub affinity_window: Duration,

    pub followed_cap: i64,
    pub trending_cap: i64,
    pub affinity_cap: i64,

    /// K: max entries one author contributes per page-sized window.
    pub author_saturation: usize,
    pub page_size: usize,
    /// Upper bound on the ranked list cached per user.
    pub max_feed_length: usize,

    pub query_timeout: Duration,
    pub feed_ttl: Duration,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            weight_freshness: 0.30,
            weight_engagement: 0.40,
            weight_affinity: 0.30,
            decay_lambda: 0.1,
            followed_lookback: Duration::from_secs(72 * 3600),
            trending_window: Duration::from_secs(24 * 3600),
            affinity_recency: Duration::from_secs(14 * 24 * 3600),
            affinity_window: Duration::from_secs(90 * 24 * 3600),
            followed_cap: 200,
            trending_cap: 100,
            affinity_cap: 100,
            author_saturation: 3,
            page_size: 20,
            max_feed_length: 500,
            query_timeout: Duration::from_millis(500),
            feed_ttl: Duration::from_secs(300),
        }
    }
}
