use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::candidates::{CandidateStore, FeedCandidate};
use crate::error::RankingError;

#[derive(Default)]
struct Data {
    followed: Vec<FeedCandidate>,
    trending: Vec<FeedCandidate>,
    affinity: Vec<FeedCandidate>,
    active_users: Vec<Uuid>,
    suggested: Vec<(Uuid, i64)>,
}

/// Scriptable in-memory `CandidateStore`: fixed candidate sets, per-source
/// failure injection, an optional per-source delay for timeout tests, and a
/// query counter for single-flight assertions.
#[derive(Clone, Default)]
pub struct MemoryCandidateStore {
    data: Arc<Mutex<Data>>,
    fail_followed: Arc<AtomicBool>,
    fail_trending: Arc<AtomicBool>,
    fail_affinity: Arc<AtomicBool>,
    followed_delay: Arc<Mutex<Option<Duration>>>,
    queries: Arc<AtomicU32>,
}

impl MemoryCandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_followed(&self, candidate: FeedCandidate) {
        self.data.lock().unwrap().followed.push(candidate);
    }

    pub fn push_trending(&self, candidate: FeedCandidate) {
        self.data.lock().unwrap().trending.push(candidate);
    }

    pub fn push_affinity(&self, candidate: FeedCandidate) {
        self.data.lock().unwrap().affinity.push(candidate);
    }

    pub fn set_active_users(&self, users: Vec<Uuid>) {
        self.data.lock().unwrap().active_users = users;
    }

    pub fn set_suggested(&self, suggested: Vec<(Uuid, i64)>) {
        self.data.lock().unwrap().suggested = suggested;
    }

    pub fn fail_followed(&self, fail: bool) {
        self.fail_followed.store(fail, Ordering::SeqCst);
    }

    pub fn fail_trending(&self, fail: bool) {
        self.fail_trending.store(fail, Ordering::SeqCst);
    }

    pub fn fail_affinity(&self, fail: bool) {
        self.fail_affinity.store(fail, Ordering::SeqCst);
    }

    pub fn delay_followed(&self, delay: Duration) {
        *self.followed_delay.lock().unwrap() = Some(delay);
    }

    pub fn query_count(&self) -> u32 {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandidateStore for MemoryCandidateStore {
    async fn followed_posts(
        &self,
        _user_id: Uuid,
        _lookback: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let delay = *self.followed_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_followed.load(Ordering::SeqCst) {
            return Err(RankingError::DownstreamUnavailable);
        }
        let data = self.data.lock().unwrap();
        Ok(data.followed.iter().take(cap as usize).cloned().collect())
    }

    async fn trending_posts(
        &self,
        _window: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_trending.load(Ordering::SeqCst) {
            return Err(RankingError::DownstreamUnavailable);
        }
        let data = self.data.lock().unwrap();
        Ok(data.trending.iter().take(cap as usize).cloned().collect())
    }

    async fn affinity_posts(
        &self,
        _user_id: Uuid,
        _recency: Duration,
        _affinity_window: Duration,
        cap: i64,
    ) -> Result<Vec<FeedCandidate>, RankingError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_affinity.load(Ordering::SeqCst) {
            return Err(RankingError::DownstreamUnavailable);
        }
        let data = self.data.lock().unwrap();
        Ok(data.affinity.iter().take(cap as usize).cloned().collect())
    }

    async fn most_active_users(
        &self,
        _since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, RankingError> {
        let data = self.data.lock().unwrap();
        Ok(data.active_users.iter().take(limit as usize).copied().collect())
    }

    async fn suggested_authors(
        &self,
        _user_id: Uuid,
        _affinity_window: Duration,
        limit: i64,
    ) -> Result<Vec<(Uuid, i64)>, RankingError> {
        let data = self.data.lock().unwrap();
        Ok(data.suggested.iter().take(limit as usize).copied().collect())
    }
}
