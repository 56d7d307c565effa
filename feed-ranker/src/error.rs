use thiserror::Error;

use feed_common::cache::CacheError;

#[derive(Error, Debug)]
pub enum RankingError {
    #[error("candidate query timed out")]
    QueryTimeout,

    #[error("candidate query failed: {0}")]
    QueryFailed(String),

    #[error("aggregation store unavailable")]
    DownstreamUnavailable,

    #[error("all candidate sources failed")]
    AllSourcesFailed,

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("feed serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RankingError {
    pub fn from_sqlx(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                RankingError::DownstreamUnavailable
            }
            other => RankingError::QueryFailed(other.to_string()),
        }
    }
}
