use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;

/// Enumeration of errors for operations with the checkpoint store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// Durable, exclusive owner of consumer progress. Positions are committed
/// only after the derived event has been published, so a crash replays from
/// the last published record (at-least-once).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn commit(&self, topic: &str, partition: i32, position: i64)
        -> Result<(), CheckpointError>;

    async fn load(&self, topic: &str, partition: i32) -> Result<Option<i64>, CheckpointError>;
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        position: i64,
    ) -> Result<(), CheckpointError> {
        (**self).commit(topic, partition, position).await
    }

    async fn load(&self, topic: &str, partition: i32) -> Result<Option<i64>, CheckpointError> {
        (**self).load(topic, partition).await
    }
}

/// Checkpoints persisted in a PostgreSQL table, one row per topic-partition.
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, CheckpointError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|error| CheckpointError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        position: i64,
    ) -> Result<(), CheckpointError> {
        // GREATEST keeps the row monotonic even if two workers race on the
        // same partition during a rebalance.
        sqlx::query(
            r#"
INSERT INTO consumer_offsets (topic, partition, committed_position, updated_at)
VALUES ($1, $2, $3, NOW())
ON CONFLICT (topic, partition)
DO UPDATE SET
    committed_position = GREATEST(consumer_offsets.committed_position, EXCLUDED.committed_position),
    updated_at = NOW()
            "#,
        )
        .bind(topic)
        .bind(partition)
        .bind(position)
        .execute(&self.pool)
        .await
        .map_err(|error| CheckpointError::QueryError {
            command: "UPSERT consumer_offsets".to_owned(),
            error,
        })?;

        Ok(())
    }

    async fn load(&self, topic: &str, partition: i32) -> Result<Option<i64>, CheckpointError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
SELECT committed_position
FROM consumer_offsets
WHERE topic = $1 AND partition = $2
            "#,
        )
        .bind(topic)
        .bind(partition)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| CheckpointError::QueryError {
            command: "SELECT consumer_offsets".to_owned(),
            error,
        })?;

        Ok(row.map(|(position,)| position))
    }
}

/// In-memory checkpoints for tests.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    offsets: Arc<Mutex<HashMap<(String, i32), i64>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        position: i64,
    ) -> Result<(), CheckpointError> {
        let mut offsets = self.offsets.lock().await;
        let entry = offsets.entry((topic.to_owned(), partition)).or_insert(position);
        *entry = (*entry).max(position);
        Ok(())
    }

    async fn load(&self, topic: &str, partition: i32) -> Result<Option<i64>, CheckpointError> {
        let offsets = self.offsets.lock().await;
        Ok(offsets.get(&(topic.to_owned(), partition)).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCheckpointStore::new();

        assert_eq!(store.load("changes.posts", 0).await.unwrap(), None);

        store.commit("changes.posts", 0, 10).await.unwrap();
        assert_eq!(store.load("changes.posts", 0).await.unwrap(), Some(10));

        // partitions are tracked independently
        assert_eq!(store.load("changes.posts", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_commits_never_move_backwards() {
        let store = MemoryCheckpointStore::new();

        store.commit("changes.likes", 3, 100).await.unwrap();
        store.commit("changes.likes", 3, 90).await.unwrap();

        assert_eq!(store.load("changes.likes", 3).await.unwrap(), Some(100));
    }
}
