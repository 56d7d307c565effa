use thiserror::Error;

use feed_common::cache::CacheError;

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("structurally invalid event: {0}")]
    MalformedEvent(String),

    #[error("transient aggregation-store error: {0}")]
    TransientStore(String),

    #[error("aggregation store unavailable")]
    DownstreamUnavailable,

    #[error("seen-set error: {0}")]
    SeenSet(#[from] CacheError),
}

impl AggregationError {
    /// Transient errors are retried with backoff; everything else either
    /// dead-letters (malformed) or aborts the worker. Seen-set errors are
    /// transient by nature: the client caps every command at 100ms, so a
    /// slow Redis surfaces here as a timeout.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AggregationError::TransientStore(_)
                | AggregationError::DownstreamUnavailable
                | AggregationError::SeenSet(_)
        )
    }

    pub fn from_sqlx(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                AggregationError::DownstreamUnavailable
            }
            other => AggregationError::TransientStore(other.to_string()),
        }
    }
}
