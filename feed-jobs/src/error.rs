use thiserror::Error;

use feed_common::cache::CacheError;
use feed_ranker::error::RankingError;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("store query failed: {0}")]
    Ranking(#[from] RankingError),

    #[error("cache write failed: {0}")]
    Cache(#[from] CacheError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}
