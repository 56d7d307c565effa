use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use feed_common::cache::{versioned_key, SharedCacheClient};
use feed_common::event::{DomainEvent, EventType};
use feed_common::retry::RetryPolicy;

use crate::dedup::EventSeenSet;
use crate::error::AggregationError;
use crate::store::{hour_bucket, AggregationStore, EngagementDelta};

/// Applies the derived-event stream to the aggregation store.
///
/// Events pass the dedup gate one by one and accumulate into a batch; the
/// batch is flushed once it reaches `max_batch_size` (or when the consumer
/// loop decides, e.g. before committing offsets). A flush that exhausts its
/// retries unmarks the batch in the seen set so redelivery can take another
/// run at it.
pub struct Aggregator<S, C> {
    seen: EventSeenSet<C>,
    store: S,
    cache: C,
    retry_policy: RetryPolicy,
    max_batch_size: usize,
    follower_fanout_limit: i64,
    buffer: Vec<DomainEvent>,
}

impl<S, C> Aggregator<S, C>
where
    S: AggregationStore,
    C: SharedCacheClient + Clone,
{
    pub fn new(
        seen: EventSeenSet<C>,
        store: S,
        cache: C,
        retry_policy: RetryPolicy,
        max_batch_size: usize,
        follower_fanout_limit: i64,
    ) -> Self {
        Self {
            seen,
            store,
            cache,
            retry_policy,
            max_batch_size,
            follower_fanout_limit,
            buffer: Vec::new(),
        }
    }

    pub async fn process(&mut self, event: DomainEvent) -> Result<(), AggregationError> {
        validate(&event)?;

        if !self.check_seen(event.event_id).await? {
            metrics::counter!("aggregator_duplicate_events_total").increment(1);
            debug!(event_id = %event.event_id, "dropping duplicate event");
            return Ok(());
        }

        self.buffer.push(event);
        if self.buffer.len() >= self.max_batch_size {
            self.flush().await?;
        }

        Ok(())
    }

    /// The dedup gate rides the same bounded backoff as the store writes: a
    /// Redis blip must not take the worker down.
    async fn check_seen(&self, event_id: Uuid) -> Result<bool, AggregationError> {
        let mut attempt = 0;
        loop {
            match self.seen.check_and_set(event_id).await {
                Ok(fresh) => return Ok(fresh),
                Err(error) if self.retry_policy.should_retry(attempt) => {
                    let backoff = self.retry_policy.time_until_next_retry(attempt);
                    attempt += 1;
                    warn!(
                        event_id = %event_id,
                        attempt,
                        "seen-set check failed, retrying in {:?}: {}", backoff, error
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => {
                    metrics::counter!("aggregator_seen_set_failures_total").increment(1);
                    return Err(error.into());
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub async fn flush(&mut self) -> Result<(), AggregationError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);

        let mut attempt = 0;
        let touched_authors = loop {
            match self.apply(&batch).await {
                Ok(authors) => break authors,
                Err(error) if error.is_retryable() && self.retry_policy.should_retry(attempt) => {
                    let backoff = self.retry_policy.time_until_next_retry(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        "transient failure applying batch, retrying in {:?}: {}", backoff, error
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => {
                    // The batch is lost to this worker. Unmark so the
                    // redelivered copies are not discarded as duplicates.
                    metrics::counter!("aggregator_flush_failures_total").increment(1);
                    for event in &batch {
                        if let Err(unmark_error) = self.seen.unmark(event.event_id).await {
                            warn!(
                                event_id = %event.event_id,
                                "failed to unmark event after flush failure: {}", unmark_error
                            );
                        }
                    }
                    return Err(error);
                }
            }
        };

        metrics::counter!("aggregator_events_applied_total").increment(batch.len() as u64);
        self.invalidate_feeds(&touched_authors).await;

        Ok(())
    }

    /// One pass over the batch: event log first, then posts (so affinity
    /// lookups within the same batch resolve), then grouped counters.
    async fn apply(&self, batch: &[DomainEvent]) -> Result<HashSet<Uuid>, AggregationError> {
        self.store.append_events(batch).await?;

        let mut touched_authors = HashSet::new();

        for event in batch {
            if event.event_type == EventType::PostCreated {
                self.store
                    .record_post(event.target_id, event.actor_id, event.occurred_at)
                    .await?;
                touched_authors.insert(event.actor_id);
            }
        }

        let mut deltas: HashMap<(Uuid, DateTime<Utc>), EngagementDelta> = HashMap::new();
        for event in batch {
            if event.event_type.is_post_interaction() {
                deltas
                    .entry((event.target_id, hour_bucket(event.occurred_at)))
                    .or_default()
                    .merge(EngagementDelta::for_event(event.event_type));
            }
        }
        for ((post_id, bucket), delta) in deltas {
            self.store.increment_engagement(post_id, bucket, delta).await?;
            if let Some(author_id) = self.store.post_author(post_id).await? {
                touched_authors.insert(author_id);
            }
        }

        for event in batch {
            match event.event_type {
                _ if event.event_type.is_post_interaction() => {
                    self.store
                        .increment_affinity(event.actor_id, event.target_id, event.occurred_at)
                        .await?;
                }
                EventType::Followed => {
                    self.store
                        .upsert_follow(event.actor_id, event.target_id, event.occurred_at)
                        .await?;
                    touched_authors.insert(event.target_id);
                }
                EventType::Unfollowed => {
                    self.store
                        .remove_follow(event.actor_id, event.target_id)
                        .await?;
                    touched_authors.insert(event.target_id);
                }
                _ => {}
            }
        }

        Ok(touched_authors)
    }

    /// Best-effort fan-out: stale feed pages fall back to their TTL if this
    /// fails, so errors are logged and swallowed.
    async fn invalidate_feeds(&self, authors: &HashSet<Uuid>) {
        for author_id in authors {
            let followers = match self
                .store
                .follower_ids(*author_id, self.follower_fanout_limit)
                .await
            {
                Ok(followers) => followers,
                Err(error) => {
                    warn!(author_id = %author_id, "follower lookup for invalidation failed: {}", error);
                    continue;
                }
            };

            for follower_id in followers {
                let pattern = format!("{}*", versioned_key(&format!("feed:{}", follower_id)));
                if let Err(error) = self.cache.del_matching(&pattern).await {
                    warn!(user_id = %follower_id, "feed invalidation failed: {}", error);
                } else {
                    metrics::counter!("aggregator_feed_invalidations_total").increment(1);
                }
            }
        }
    }
}

fn validate(event: &DomainEvent) -> Result<(), AggregationError> {
    if event.actor_id.is_nil() || event.target_id.is_nil() {
        return Err(AggregationError::MalformedEvent(format!(
            "event {} has a nil actor or target",
            event.event_id
        )));
    }
    Ok(())
}
