use std::time::Duration;

use uuid::Uuid;

use feed_common::cache::{versioned_key, CacheResult, SharedCacheClient};

/// Sliding dedup window over event ids, backed by the shared cache tier.
///
/// `check_and_set` is a single atomic `SET NX EX`: under concurrent delivery
/// of the same event to two workers exactly one observes `true`. An id that
/// falls out of the window becomes eligible again, which is why the window
/// must comfortably exceed the upstream redelivery horizon.
pub struct EventSeenSet<C> {
    cache: C,
    window: Duration,
}

impl<C: SharedCacheClient> EventSeenSet<C> {
    pub fn new(cache: C, window: Duration) -> Self {
        Self { cache, window }
    }

    fn key(event_id: Uuid) -> String {
        versioned_key(&format!("seen:{}", event_id))
    }

    /// Returns true when the event has not been seen inside the window,
    /// atomically marking it as seen.
    pub async fn check_and_set(&self, event_id: Uuid) -> CacheResult<bool> {
        self.cache
            .set_nx_ex(&Self::key(event_id), "1", self.window)
            .await
    }

    /// Drops the seen marker. Used to give an event back to redelivery when
    /// it was marked but its aggregation could not be persisted.
    pub async fn unmark(&self, event_id: Uuid) -> CacheResult<()> {
        self.cache.del(&Self::key(event_id)).await
    }
}
