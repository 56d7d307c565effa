use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use feed_common::event::DomainEvent;

use crate::error::AggregationError;
use crate::store::{AggregationStore, EngagementDelta};

#[derive(Default)]
struct Inner {
    events: HashMap<Uuid, DomainEvent>,
    posts: HashMap<Uuid, (Uuid, DateTime<Utc>)>,
    rollups: HashMap<(Uuid, DateTime<Utc>), EngagementDelta>,
    affinity: HashMap<(Uuid, Uuid), i64>,
    follows: HashSet<(Uuid, Uuid)>,
}

/// In-memory `AggregationStore` mirroring the Postgres semantics closely
/// enough for idempotence tests: keyed event log, additive rollups,
/// affinity resolved through the post author.
#[derive(Clone, Default)]
pub struct MemoryAggregationStore {
    inner: Arc<Mutex<Inner>>,
    fail_next: Arc<AtomicU32>,
}

impl MemoryAggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` writes fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), AggregationError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(AggregationError::TransientStore(
                "injected failure".to_owned(),
            ));
        }
        Ok(())
    }

    pub async fn event_count(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    pub async fn engagement(&self, post_id: Uuid, bucket: DateTime<Utc>) -> EngagementDelta {
        self.inner
            .lock()
            .await
            .rollups
            .get(&(post_id, bucket))
            .copied()
            .unwrap_or_default()
    }

    pub async fn affinity(&self, user_id: Uuid, author_id: Uuid) -> i64 {
        self.inner
            .lock()
            .await
            .affinity
            .get(&(user_id, author_id))
            .copied()
            .unwrap_or(0)
    }

    pub async fn has_follow(&self, follower_id: Uuid, followee_id: Uuid) -> bool {
        self.inner
            .lock()
            .await
            .follows
            .contains(&(follower_id, followee_id))
    }
}

#[async_trait]
impl AggregationStore for MemoryAggregationStore {
    async fn append_events(&self, events: &[DomainEvent]) -> Result<(), AggregationError> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        for event in events {
            inner.events.entry(event.event_id).or_insert(event.clone());
        }
        Ok(())
    }

    async fn record_post(
        &self,
        post_id: Uuid,
        author_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<(), AggregationError> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        inner.posts.entry(post_id).or_insert((author_id, created_at));
        Ok(())
    }

    async fn increment_engagement(
        &self,
        post_id: Uuid,
        bucket: DateTime<Utc>,
        delta: EngagementDelta,
    ) -> Result<(), AggregationError> {
        self.check_failure()?;
        if delta.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        inner
            .rollups
            .entry((post_id, bucket))
            .or_default()
            .merge(delta);
        Ok(())
    }

    async fn increment_affinity(
        &self,
        user_id: Uuid,
        post_id: Uuid,
        _occurred_at: DateTime<Utc>,
    ) -> Result<(), AggregationError> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        let author_id = match inner.posts.get(&post_id) {
            Some((author_id, _)) if *author_id != user_id => *author_id,
            _ => return Ok(()),
        };
        *inner.affinity.entry((user_id, author_id)).or_insert(0) += 1;
        Ok(())
    }

    async fn upsert_follow(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
        _created_at: DateTime<Utc>,
    ) -> Result<(), AggregationError> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        inner.follows.insert((follower_id, followee_id));
        Ok(())
    }

    async fn remove_follow(
        &self,
        follower_id: Uuid,
        followee_id: Uuid,
    ) -> Result<(), AggregationError> {
        self.check_failure()?;
        let mut inner = self.inner.lock().await;
        inner.follows.remove(&(follower_id, followee_id));
        Ok(())
    }

    async fn post_author(&self, post_id: Uuid) -> Result<Option<Uuid>, AggregationError> {
        let inner = self.inner.lock().await;
        Ok(inner.posts.get(&post_id).map(|(author_id, _)| *author_id))
    }

    async fn follower_ids(
        &self,
        author_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Uuid>, AggregationError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .follows
            .iter()
            .filter(|(_, followee)| *followee == author_id)
            .take(limit as usize)
            .map(|(follower, _)| *follower)
            .collect())
    }
}
