use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::error::RankingError;

/// Where a candidate came from. Declaration order is priority order: when a
/// post is reachable through several sources the earliest variant wins.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CandidateSource {
    Followed,
    Trending,
    Affinity,
}

/// Engagement and affinity counters attached to a candidate. Unioning two
/// sightings of the same post keeps the field-wise maximum, so a source that
/// happens to carry no rollup data never erases another source's signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSignals {
    pub impressions: i64,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    pub affinity_interactions: i64,
}

impl RawSignals {
    pub fn union(&mut self, other: &RawSignals) {
        self.impressions = self.impressions.max(other.impressions);
        self.likes = self.likes.max(other.likes);
        self.comments = self.comments.max(other.comments);
        self.shares = self.shares.max(other.shares);
        self.affinity_interactions = self.affinity_interactions.max(other.affinity_interactions);
    }

    pub fn weighted_interactions(&self) -> i64 {
        self.likes + 2 * self.comments + 3 * self.shares
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedCandidate {
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub source: CandidateSource,
    pub signals: RawSignals,
}

/// Read side of the aggregation store: the three parametrized candidate
/// queries plus the two listings the background jobs need.
#[async_trait]
pub trait CandidateStore: Send + Sync {
    /// Posts by authors the user follows, newest first.
    async fn followed_posts(
        &self,
        user_id: Uuid,
        lookback: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError>;

    /// Top posts by weighted engagement inside the window, follow graph
    /// ignored.
    async fn trending_posts(
        &self,
        window: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError>;

    /// Recent posts by the user's high-affinity authors (followed or not).
    async fn affinity_posts(
        &self,
        user_id: Uuid,
        recency: Duration,
        affinity_window: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError>;

    /// Users with the most interactions since `since`, for cache warming.
    async fn most_active_users(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, RankingError>;

    /// High-affinity authors the user does not already follow, strongest
    /// first, with their interaction counts.
    async fn suggested_authors(
        &self,
        user_id: Uuid,
        affinity_window: Duration,
        limit: i64,
    ) -> Result<Vec<(Uuid, i64)>, RankingError>;
}

#[async_trait]
impl<T: CandidateStore + ?Sized> CandidateStore for std::sync::Arc<T> {
    async fn followed_posts(
        &self,
        user_id: Uuid,
        lookback: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError> {
        (**self).followed_posts(user_id, lookback, cap).await
    }

    async fn trending_posts(
        &self,
        window: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError> {
        (**self).trending_posts(window, cap).await
    }

    async fn affinity_posts(
        &self,
        user_id: Uuid,
        recency: Duration,
        affinity_window: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError> {
        (**self)
            .affinity_posts(user_id, recency, affinity_window, cap)
            .await
    }

    async fn most_active_users(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, RankingError> {
        (**self).most_active_users(since, limit).await
    }

    async fn suggested_authors(
        &self,
        user_id: Uuid,
        affinity_window: Duration,
        limit: i64,
    ) -> Result<Vec<(Uuid, i64)>, RankingError> {
        (**self)
            .suggested_authors(user_id, affinity_window, limit)
            .await
    }
}

type CandidateRow = (Uuid, Uuid, DateTime<Utc>, i64, i64, i64, i64);

fn cutoff(window: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
}

pub struct PostgresCandidateStore {
    pool: PgPool,
}

impl PostgresCandidateStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, RankingError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(RankingError::from_sqlx)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandidateStore for PostgresCandidateStore {
    async fn followed_posts(
        &self,
        user_id: Uuid,
        lookback: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError> {
        let rows: Vec<CandidateRow> = sqlx::query_as(
            r#"
SELECT p.id, p.author_id, p.created_at,
       COALESCE(e.impressions, 0), COALESCE(e.likes, 0),
       COALESCE(e.comments, 0), COALESCE(e.shares, 0)
FROM posts p
JOIN follows f ON f.followee_id = p.author_id AND f.follower_id = $1
LEFT JOIN (
    SELECT post_id,
           SUM(impressions) AS impressions, SUM(likes) AS likes,
           SUM(comments) AS comments, SUM(shares) AS shares
    FROM engagement_rollups
    GROUP BY post_id
) e ON e.post_id = p.id
WHERE p.created_at >= $2 AND p.author_id <> $1
ORDER BY p.created_at DESC
LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(cutoff(lookback))
        .bind(cap)
        .fetch_all(&self.pool)
        .await
        .map_err(RankingError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| candidate(row, CandidateSource::Followed, 0))
            .collect())
    }

    async fn trending_posts(
        &self,
        window: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError> {
        let rows: Vec<CandidateRow> = sqlx::query_as(
            r#"
SELECT p.id, p.author_id, p.created_at,
       SUM(r.impressions), SUM(r.likes), SUM(r.comments), SUM(r.shares)
FROM engagement_rollups r
JOIN posts p ON p.id = r.post_id
WHERE r.bucket >= $1
GROUP BY p.id, p.author_id, p.created_at
ORDER BY SUM(r.likes) + 2 * SUM(r.comments) + 3 * SUM(r.shares) DESC, p.id
LIMIT $2
            "#,
        )
        .bind(cutoff(window))
        .bind(cap)
        .fetch_all(&self.pool)
        .await
        .map_err(RankingError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| candidate(row, CandidateSource::Trending, 0))
            .collect())
    }

    async fn affinity_posts(
        &self,
        user_id: Uuid,
        recency: Duration,
        affinity_window: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError> {
        let rows: Vec<(Uuid, Uuid, DateTime<Utc>, i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
SELECT p.id, p.author_id, p.created_at,
       COALESCE(e.impressions, 0), COALESCE(e.likes, 0),
       COALESCE(e.comments, 0), COALESCE(e.shares, 0),
       a.interaction_count
FROM affinity_scores a
JOIN posts p ON p.author_id = a.author_id
LEFT JOIN (
    SELECT post_id,
           SUM(impressions) AS impressions, SUM(likes) AS likes,
           SUM(comments) AS comments, SUM(shares) AS shares
    FROM engagement_rollups
    GROUP BY post_id
) e ON e.post_id = p.id
WHERE a.user_id = $1
  AND a.last_interaction_at >= $2
  AND p.created_at >= $3
ORDER BY a.interaction_count DESC, p.created_at DESC
LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(cutoff(affinity_window))
        .bind(cutoff(recency))
        .bind(cap)
        .fetch_all(&self.pool)
        .await
        .map_err(RankingError::from_sqlx)?;

        Ok(rows
            .into_iter()
            .map(
                |(post_id, author_id, created_at, impressions, likes, comments, shares, count)| {
                    candidate(
                        (post_id, author_id, created_at, impressions, likes, comments, shares),
                        CandidateSource::Affinity,
                        count,
                    )
                },
            )
            .collect())
    }

    async fn most_active_users(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, RankingError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
SELECT actor_id
FROM raw_events
WHERE occurred_at >= $1
GROUP BY actor_id
ORDER BY COUNT(*) DESC
LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(RankingError::from_sqlx)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn suggested_authors(
        &self,
        user_id: Uuid,
        affinity_window: Duration,
        limit: i64,
    ) -> Result<Vec<(Uuid, i64)>, RankingError> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
SELECT a.author_id, a.interaction_count
FROM affinity_scores a
WHERE a.user_id = $1
  AND a.last_interaction_at >= $2
  AND NOT EXISTS (
      SELECT 1 FROM follows f
      WHERE f.follower_id = $1 AND f.followee_id = a.author_id
  )
ORDER BY a.interaction_count DESC, a.author_id
LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(cutoff(affinity_window))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(RankingError::from_sqlx)?;

        Ok(rows)
    }
}

fn candidate(row: CandidateRow, source: CandidateSource, affinity: i64) -> FeedCandidate {
    let (post_id, author_id, created_at, impressions, likes, comments, shares) = row;
    FeedCandidate {
        post_id,
        author_id,
        created_at,
        source,
        signals: RawSignals {
            impressions,
            likes,
            comments,
            shares,
            affinity_interactions: affinity,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_priority_is_declaration_order() {
        assert!(CandidateSource::Followed < CandidateSource::Trending);
        assert!(CandidateSource::Trending < CandidateSource::Affinity);
    }

    #[test]
    fn test_signal_union_is_fieldwise_max() {
        let mut left = RawSignals {
            impressions: 100,
            likes: 5,
            comments: 0,
            shares: 1,
            affinity_interactions: 0,
        };
        let right = RawSignals {
            impressions: 80,
            likes: 5,
            comments: 3,
            shares: 0,
            affinity_interactions: 12,
        };

        left.union(&right);

        assert_eq!(left.impressions, 100);
        assert_eq!(left.comments, 3);
        assert_eq!(left.shares, 1);
        assert_eq!(left.affinity_interactions, 12);
    }

    #[test]
    fn test_weighted_interactions() {
        let signals = RawSignals {
            impressions: 0,
            likes: 4,
            comments: 3,
            shares: 2,
            affinity_interactions: 0,
        };

        assert_eq!(signals.weighted_interactions(), 4 + 6 + 6);
    }
}
