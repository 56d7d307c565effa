use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use feed_common::event::{ChangeOperation, ChangeRecord, DomainEvent, EventType};

use crate::error::CaptureError;

/// Namespace for deriving event ids from change-log coordinates. A
/// redelivered change record must map to the same event_id, otherwise the
/// downstream dedup gate cannot recognize the replay.
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x14, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30,
    0xc8,
]);

fn derived_event_id(record: &ChangeRecord) -> Uuid {
    let name = format!(
        "{}:{}:{}",
        record.source_table, record.primary_key, record.log_position
    );
    Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes())
}

fn require_uuid(image: &Value, field: &str) -> Result<Uuid, CaptureError> {
    let raw = image
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| CaptureError::MalformedRecord(format!("missing field {}", field)))?;

    Uuid::parse_str(raw)
        .map_err(|_| CaptureError::MalformedRecord(format!("field {} is not a uuid", field)))
}

fn occurred_at(image: &Value) -> DateTime<Utc> {
    image
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Convert one upstream row change into zero or one domain event.
///
/// Irrelevant tables and operations yield `Ok(None)` and are skipped;
/// structurally broken records yield `MalformedRecord` so the caller can
/// dead-letter them without halting the stream.
pub fn to_domain_event(record: &ChangeRecord) -> Result<Option<DomainEvent>, CaptureError> {
    let event = match (record.source_table.as_str(), record.operation) {
        ("posts", ChangeOperation::Insert) => {
            let after = require_after(record)?;
            DomainEvent {
                event_id: derived_event_id(record),
                event_type: EventType::PostCreated,
                actor_id: require_uuid(after, "author_id")?,
                target_id: require_uuid(after, "id")?,
                occurred_at: occurred_at(after),
                payload: Value::Null,
            }
        }
        ("likes", ChangeOperation::Insert) => {
            interaction_event(record, EventType::Liked)?
        }
        ("comments", ChangeOperation::Insert) => {
            interaction_event(record, EventType::Commented)?
        }
        ("shares", ChangeOperation::Insert) => {
            interaction_event(record, EventType::Shared)?
        }
        ("follows", ChangeOperation::Insert) => {
            let after = require_after(record)?;
            DomainEvent {
                event_id: derived_event_id(record),
                event_type: EventType::Followed,
                actor_id: require_uuid(after, "follower_id")?,
                target_id: require_uuid(after, "followee_id")?,
                occurred_at: occurred_at(after),
                payload: Value::Null,
            }
        }
        ("follows", ChangeOperation::Delete) => {
            let before = record.before.as_ref().ok_or_else(|| {
                CaptureError::MalformedRecord("delete without before image".to_owned())
            })?;
            DomainEvent {
                event_id: derived_event_id(record),
                event_type: EventType::Unfollowed,
                actor_id: require_uuid(before, "follower_id")?,
                target_id: require_uuid(before, "followee_id")?,
                occurred_at: Utc::now(),
                payload: Value::Null,
            }
        }
        // Updates and deletes on content tables carry no feed signal.
        _ => return Ok(None),
    };

    Ok(Some(event))
}

fn require_after(record: &ChangeRecord) -> Result<&Value, CaptureError> {
    record
        .after
        .as_ref()
        .ok_or_else(|| CaptureError::MalformedRecord("insert without after image".to_owned()))
}

fn interaction_event(
    record: &ChangeRecord,
    event_type: EventType,
) -> Result<DomainEvent, CaptureError> {
    let after = require_after(record)?;
    Ok(DomainEvent {
        event_id: derived_event_id(record),
        event_type,
        actor_id: require_uuid(after, "user_id")?,
        target_id: require_uuid(after, "post_id")?,
        occurred_at: occurred_at(after),
        payload: Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(table: &str, operation: ChangeOperation, after: Option<Value>) -> ChangeRecord {
        ChangeRecord {
            source_table: table.to_owned(),
            operation,
            primary_key: "pk-1".to_owned(),
            before: None,
            after,
            log_position: 42,
        }
    }

    #[test]
    fn test_post_insert_becomes_post_created() {
        let author = Uuid::now_v7();
        let post = Uuid::now_v7();
        let rec = record(
            "posts",
            ChangeOperation::Insert,
            Some(json!({
                "id": post.to_string(),
                "author_id": author.to_string(),
                "created_at": "2024-05-01T10:00:00Z",
            })),
        );

        let event = to_domain_event(&rec).unwrap().expect("event expected");
        assert_eq!(event.event_type, EventType::PostCreated);
        assert_eq!(event.actor_id, author);
        assert_eq!(event.target_id, post);
    }

    #[test]
    fn test_like_insert_becomes_liked() {
        let user = Uuid::now_v7();
        let post = Uuid::now_v7();
        let rec = record(
            "likes",
            ChangeOperation::Insert,
            Some(json!({
                "user_id": user.to_string(),
                "post_id": post.to_string(),
            })),
        );

        let event = to_domain_event(&rec).unwrap().expect("event expected");
        assert_eq!(event.event_type, EventType::Liked);
        assert_eq!(event.actor_id, user);
        assert_eq!(event.target_id, post);
    }

    #[test]
    fn test_follow_delete_uses_before_image() {
        let follower = Uuid::now_v7();
        let followee = Uuid::now_v7();
        let rec = ChangeRecord {
            source_table: "follows".to_owned(),
            operation: ChangeOperation::Delete,
            primary_key: "pk-9".to_owned(),
            before: Some(json!({
                "follower_id": follower.to_string(),
                "followee_id": followee.to_string(),
            })),
            after: None,
            log_position: 7,
        };

        let event = to_domain_event(&rec).unwrap().expect("event expected");
        assert_eq!(event.event_type, EventType::Unfollowed);
        assert_eq!(event.actor_id, follower);
        assert_eq!(event.target_id, followee);
    }

    #[test]
    fn test_irrelevant_changes_are_filtered() {
        let rec = record(
            "posts",
            ChangeOperation::Update,
            Some(json!({"id": Uuid::now_v7().to_string()})),
        );
        assert!(to_domain_event(&rec).unwrap().is_none());

        let rec = record("media_assets", ChangeOperation::Insert, Some(json!({})));
        assert!(to_domain_event(&rec).unwrap().is_none());
    }

    #[test]
    fn test_malformed_record_is_an_error() {
        let rec = record("likes", ChangeOperation::Insert, Some(json!({"user_id": "not-a-uuid"})));
        let err = to_domain_event(&rec).unwrap_err();
        assert!(err.is_malformed());

        let rec = record("posts", ChangeOperation::Insert, None);
        assert!(to_domain_event(&rec).unwrap_err().is_malformed());
    }

    #[test]
    fn test_event_id_is_stable_across_redelivery() {
        let user = Uuid::now_v7();
        let post = Uuid::now_v7();
        let after = json!({
            "user_id": user.to_string(),
            "post_id": post.to_string(),
        });

        let first = record("likes", ChangeOperation::Insert, Some(after.clone()));
        let replayed = record("likes", ChangeOperation::Insert, Some(after));

        let a = to_domain_event(&first).unwrap().unwrap();
        let b = to_domain_event(&replayed).unwrap().unwrap();
        assert_eq!(a.event_id, b.event_id);

        // a different log position is a different event
        let mut third = record("likes", ChangeOperation::Insert, None);
        third.after = first.after.clone();
        third.log_position = 43;
        let c = to_domain_event(&third).unwrap().unwrap();
        assert_ne!(a.event_id, c.event_id);
    }
}
