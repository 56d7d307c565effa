use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::QueryBuilder;
use uuid::Uuid;

use feed_common::event::{DomainEvent, EventType};

use crate::error::AggregationError;

/// Additive counters applied to one `(post, hour bucket)` rollup row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngagementDelta {
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
}

impl EngagementDelta {
    pub fn for_event(event_type: EventType) -> Self {
        match event_type {
            EventType::Liked => Self {
                likes: 1,
                ..Default::default()
            },
            EventType::Commented => Self {
                comments: 1,
                ..Default::default()
            },
            EventType::Shared => Self {
                shares: 1,
                ..Default::default()
            },
            _ => Self::default(),
        }
    }

    pub fn merge(&mut self, other: EngagementDelta) {
        self.likes += other.likes;
        self.comments += other.comments;
        self.shares += other.shares;
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Rollup rows are bucketed per hour so recency decay can be computed from
/// coarse buckets instead of raw events.
pub fn hour_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::hours(1)).unwrap_or(at)
}

/// Durable side of aggregation: the append-only event log plus the derived
/// tables the ranker reads (posts, follows, engagement rollups, affinity).
///
/// Every write is idempotent or additive so the worker can retry a batch
/// without keeping transactional state across process restarts.
#[async_trait]
pub trait AggregationStore: Send + Sync {
    async fn append_events(&self, events: &[DomainEvent]) -> Result<(), AggregationError>;

    async fn record_post(
        &self,
        post_id: Uuid,
        author_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<(), AggregationError>;

    async fn increment_engagement(
        &self,
        post_id: Uuid,
        bucket: DateTime<Utc>,
        delta: EngagementDelta,
    ) -> Result<(), AggregationError>;

    /// Bumps the actor's affinity towards the author of `post_id`.
    /// Self-interactions are ignored.
    async fn increment_affinity(
        &self,
        user_id: Uuid,
        post_id: Uuid,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), AggregationError>;

    async fn upsert_follow(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<(), AggregationError>;

    async fn remove_follow(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<(), AggregationError>;

    async fn post_author(&self, post_id: Uuid) -> Result<Option<Uuid>, AggregationError>;

    /// Capped follower listing used for feed-invalidation fan-out.
    async fn follower_ids(
        &self,
        author_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Uuid>, AggregationError>;
}

pub struct PostgresAggregationStore {
    pool: PgPool,
}

impl PostgresAggregationStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, AggregationError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(AggregationError::from_sqlx)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AggregationStore for PostgresAggregationStore {
    async fn append_events(&self, events: &[DomainEvent]) -> Result<(), AggregationError> {
        if events.is_empty() {
            return Ok(());
        }

        // ON CONFLICT DO NOTHING keeps the log idempotent: a replayed batch
        // inserts only the ids the first attempt missed.
        let mut builder = QueryBuilder::new(
            "INSERT INTO raw_events (event_id, event_type, actor_id, target_id, occurred_at, payload) ",
        );
        builder.push_values(events, |mut row, event| {
            row.push_bind(event.event_id)
                .push_bind(event.event_type.as_str())
                .push_bind(event.actor_id)
                .push_bind(event.target_id)
                .push_bind(event.occurred_at)
                .push_bind(&event.payload);
        });
        builder.push(" ON CONFLICT (event_id) DO NOTHING");

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(AggregationError::from_sqlx)?;

        Ok(())
    }

    async fn record_post(
        &self,
        post_id: Uuid,
        author_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<(), AggregationError> {
        sqlx::query(
            r#"
INSERT INTO posts (id, author_id, created_at)
VALUES ($1, $2, $3)
ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(post_id)
        .bind(author_id)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(AggregationError::from_sqlx)?;

        Ok(())
    }

    async fn increment_engagement(
        &self,
        post_id: Uuid,
        bucket: DateTime<Utc>,
        delta: EngagementDelta,
    ) -> Result<(), AggregationError> {
        if delta.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
INSERT INTO engagement_rollups (post_id, bucket, likes, comments, shares)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (post_id, bucket)
DO UPDATE SET
    likes = engagement_rollups.likes + EXCLUDED.likes,
    comments = engagement_rollups.comments + EXCLUDED.comments,
    shares = engagement_rollups.shares + EXCLUDED.shares
            "#,
        )
        .bind(post_id)
        .bind(bucket)
        .bind(delta.likes)
        .bind(delta.comments)
        .bind(delta.shares)
        .execute(&self.pool)
        .await
        .map_err(AggregationError::from_sqlx)?;

        Ok(())
    }

    async fn increment_affinity(
        &self,
        user_id: Uuid,
        post_id: Uuid,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), AggregationError> {
        // The author is resolved inside the statement; an interaction with an
        // unknown post (post row not materialized yet) is a no-op and will be
        // counted when the interaction is replayed or simply dropped.
        sqlx::query(
            r#"
INSERT INTO affinity_scores (user_id, author_id, interaction_count, last_interaction_at)
SELECT $1, p.author_id, 1, $3
FROM posts p
WHERE p.id = $2 AND p.author_id <> $1
ON CONFLICT (user_id, author_id)
DO UPDATE SET
    interaction_count = affinity_scores.interaction_count + 1,
    last_interaction_at = GREATEST(affinity_scores.last_interaction_at, EXCLUDED.last_interaction_at)
            "#,
        )
        .bind(user_id)
        .bind(post_id)
        .bind(occurred_at)
        .execute(&self.pool)
        .await
        .map_err(AggregationError::from_sqlx)?;

        Ok(())
    }

    async fn upsert_follow(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<(), AggregationError> {
        sqlx::query(
            r#"
INSERT INTO follows (follower_id, followee_id, created_at)
VALUES ($1, $2, $3)
ON CONFLICT (follower_id, followee_id) DO NOTHING
            "#,
        )
        .bind(follower_id)
        .bind(followee_id)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(AggregationError::from_sqlx)?;

        Ok(())
    }

    async fn remove_follow(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<(), AggregationError> {
        sqlx::query("DELETE FROM follows WHERE follower_id = $1 AND followee_id = $2")
            .bind(follower_id)
            .bind(followee_id)
            .execute(&self.pool)
            .await
            .map_err(AggregationError::from_sqlx)?;

        Ok(())
    }

    async fn post_author(&self, post_id: Uuid) -> Result<Option<Uuid>, AggregationError> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT author_id FROM posts WHERE id = $1")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AggregationError::from_sqlx)?;

        Ok(row.map(|(author_id,)| author_id))
    }

    async fn follower_ids(
        &self,
        author_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Uuid>, AggregationError> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT follower_id FROM follows WHERE followee_id = $1 LIMIT $2")
                .bind(author_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(AggregationError::from_sqlx)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
