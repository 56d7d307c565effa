use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Row-level operation observed on the upstream OLTP store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One committed row change from the upstream change stream.
///
/// Emitted once per upstream write, but may be redelivered physically;
/// downstream consumers compensate with event-id dedup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeRecord {
    pub source_table: String,
    pub operation: ChangeOperation,
    pub primary_key: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub log_position: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum EventType {
    PostCreated,
    Liked,
    Commented,
    Shared,
    Followed,
    Unfollowed,
}

impl EventType {
    /// Interaction events feed the per-post engagement rollup.
    pub fn is_post_interaction(&self) -> bool {
        matches!(self, EventType::Liked | EventType::Commented | EventType::Shared)
    }

    /// Graph events change who a user follows.
    pub fn is_graph_change(&self) -> bool {
        matches!(self, EventType::Followed | EventType::Unfollowed)
    }

    /// Stable name used in storage and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PostCreated => "post_created",
            EventType::Liked => "liked",
            EventType::Commented => "commented",
            EventType::Shared => "shared",
            EventType::Followed => "followed",
            EventType::Unfollowed => "unfollowed",
        }
    }
}

/// A typed domain event derived from a `ChangeRecord`.
///
/// `event_id` is the dedup key: two events carrying the same id are the
/// same event no matter how many times they are delivered.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub actor_id: Uuid,
    pub target_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl DomainEvent {
    /// Kafka partition key. Keyed by target so all interactions with one
    /// post (or one author, for graph events) stay ordered per partition.
    pub fn key(&self) -> String {
        self.target_id.to_string()
    }
}
