use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{info, warn};

use feed_common::event::ChangeRecord;

use crate::change::to_domain_event;
use crate::checkpoint::CheckpointStore;
use crate::error::CaptureError;
use crate::sink::EventSink;

/// One raw record pulled off the change stream, tagged with its durable
/// commit position.
pub struct SourcedRecord {
    pub topic: String,
    pub partition: i32,
    pub position: i64,
    pub payload: Vec<u8>,
}

/// An ordered, replayable stream of change records for one partition.
#[async_trait]
pub trait ChangeSource: Send {
    /// Next record in log order. `None` means the stream is exhausted,
    /// which only in-memory test sources ever report.
    async fn recv(&mut self) -> Result<Option<SourcedRecord>, CaptureError>;
}

/// Best-effort sink for records that cannot be processed.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn send(&self, raw: &[u8], reason: &str);
}

#[async_trait]
impl DeadLetterQueue for crate::sink::DeadLetterSink {
    async fn send(&self, raw: &[u8], reason: &str) {
        crate::sink::DeadLetterSink::send(self, raw, reason).await;
    }
}

/// The per-partition worker: converts change records to domain events,
/// publishes them, and commits the checkpoint only after a successful
/// publish. Restarting replays from the last committed position, which the
/// downstream dedup gate compensates for.
pub struct ChangeConsumer<S, K, C, D> {
    source: S,
    sink: K,
    checkpoints: C,
    dead_letters: D,
}

impl<S, K, C, D> ChangeConsumer<S, K, C, D>
where
    S: ChangeSource,
    K: EventSink,
    C: CheckpointStore,
    D: DeadLetterQueue,
{
    pub fn new(source: S, sink: K, checkpoints: C, dead_letters: D) -> Self {
        Self {
            source,
            sink,
            checkpoints,
            dead_letters,
        }
    }

    /// Run until the source is exhausted (tests) or an unrecoverable error
    /// surfaces. A malformed record is dead-lettered and skipped; only
    /// exhausted-retry publish failures abort the worker so it can restart
    /// from the checkpoint.
    pub async fn run(&mut self) -> Result<(), CaptureError> {
        while let Some(record) = self.source.recv().await? {
            self.process_record(record).await?;
        }

        Ok(())
    }

    async fn process_record(&mut self, record: SourcedRecord) -> Result<(), CaptureError> {
        let change: ChangeRecord = match serde_json::from_slice(&record.payload) {
            Ok(change) => change,
            Err(e) => {
                warn!(
                    topic = record.topic,
                    partition = record.partition,
                    position = record.position,
                    "unparseable change record: {}", e
                );
                self.dead_letters
                    .send(&record.payload, "unparseable change record")
                    .await;
                return self.commit(&record).await;
            }
        };

        let event = match to_domain_event(&change) {
            Ok(Some(event)) => event,
            // Filtered: commit and move on.
            Ok(None) => return self.commit(&record).await,
            Err(e) if e.is_malformed() => {
                warn!(
                    table = change.source_table,
                    position = record.position,
                    "malformed change record: {}", e
                );
                self.dead_letters
                    .send(&record.payload, &e.to_string())
                    .await;
                return self.commit(&record).await;
            }
            Err(e) => return Err(e),
        };

        match self.sink.send(event).await {
            Ok(()) => self.commit(&record).await,
            Err(CaptureError::NonRetryablePublishError) => {
                self.dead_letters
                    .send(&record.payload, "event could not be published")
                    .await;
                self.commit(&record).await
            }
            // Retries are exhausted: leave the checkpoint behind so the
            // record is redelivered after restart.
            Err(e) => Err(e),
        }
    }

    async fn commit(&self, record: &SourcedRecord) -> Result<(), CaptureError> {
        self.checkpoints
            .commit(&record.topic, record.partition, record.position)
            .await?;
        metrics::gauge!(
            "capture_committed_position",
            &[
                ("topic", record.topic.clone()),
                ("partition", record.partition.to_string()),
            ]
        )
        .set(record.position as f64);
        Ok(())
    }
}

/// Kafka-backed change source pinned to one topic-partition, resuming from
/// the checkpoint store rather than the broker's consumer-group offsets.
pub struct KafkaChangeSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaChangeSource {
    pub async fn assign<C: CheckpointStore>(
        kafka_hosts: &str,
        kafka_tls: bool,
        group_id: &str,
        topic: &str,
        partition: i32,
        checkpoints: &C,
    ) -> Result<Self, CaptureError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", group_id)
            // The checkpoint store is the source of truth for progress, so
            // the broker must never auto-commit or auto-store offsets.
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        if kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| CaptureError::SourceError(e.to_string()))?;

        let start = match checkpoints.load(topic, partition).await? {
            Some(position) => Offset::Offset(position + 1),
            None => Offset::Beginning,
        };

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, start)
            .map_err(|e| CaptureError::SourceError(e.to_string()))?;
        consumer
            .assign(&assignment)
            .map_err(|e| CaptureError::SourceError(e.to_string()))?;

        info!(topic, partition, "assigned change partition from {:?}", start);

        Ok(Self {
            consumer,
            topic: topic.to_owned(),
        })
    }

    /// Number of partitions for a change topic, used at startup to spawn
    /// one worker per partition.
    pub fn partition_count(
        kafka_hosts: &str,
        kafka_tls: bool,
        topic: &str,
    ) -> Result<usize, CaptureError> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", kafka_hosts);
        if kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        client_config.set("group.id", "metadata-probe");

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| CaptureError::SourceError(e.to_string()))?;
        let metadata = consumer
            .client()
            .fetch_metadata(Some(topic), std::time::Duration::from_secs(10))
            .map_err(|e| CaptureError::SourceError(e.to_string()))?;

        let partitions = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .map(|t| t.partitions().len())
            .unwrap_or(0);

        Ok(partitions)
    }
}

#[async_trait]
impl ChangeSource for KafkaChangeSource {
    async fn recv(&mut self) -> Result<Option<SourcedRecord>, CaptureError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| CaptureError::SourceError(e.to_string()))?;

        Ok(Some(SourcedRecord {
            topic: self.topic.clone(),
            partition: message.partition(),
            position: message.offset(),
            payload: message.payload().unwrap_or_default().to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    use feed_common::event::DomainEvent;

    use crate::checkpoint::MemoryCheckpointStore;

    struct MemorySource {
        records: VecDeque<SourcedRecord>,
    }

    impl MemorySource {
        fn new(payloads: Vec<(i64, String)>) -> Self {
            Self {
                records: payloads
                    .into_iter()
                    .map(|(position, payload)| SourcedRecord {
                        topic: "changes.likes".to_owned(),
                        partition: 0,
                        position,
                        payload: payload.into_bytes(),
                    })
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl ChangeSource for MemorySource {
        async fn recv(&mut self) -> Result<Option<SourcedRecord>, CaptureError> {
            Ok(self.records.pop_front())
        }
    }

    #[derive(Clone, Default)]
    struct MemorySink {
        published: Arc<Mutex<Vec<DomainEvent>>>,
        fail_attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl EventSink for MemorySink {
        async fn send(&self, event: DomainEvent) -> Result<(), CaptureError> {
            if self.fail_attempts.load(Ordering::SeqCst) > 0 {
                self.fail_attempts.fetch_sub(1, Ordering::SeqCst);
                return Err(CaptureError::RetryablePublishError);
            }
            self.published.lock().await.push(event);
            Ok(())
        }

        async fn send_batch(&self, events: Vec<DomainEvent>) -> Result<(), CaptureError> {
            for event in events {
                self.send(event).await?;
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MemoryDeadLetters {
        entries: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DeadLetterQueue for MemoryDeadLetters {
        async fn send(&self, _raw: &[u8], reason: &str) {
            self.entries.lock().await.push(reason.to_owned());
        }
    }

    fn like_payload(position: i64) -> (i64, String) {
        let payload = serde_json::json!({
            "source_table": "likes",
            "operation": "insert",
            "primary_key": format!("like-{position}"),
            "before": null,
            "after": {
                "user_id": Uuid::now_v7().to_string(),
                "post_id": Uuid::now_v7().to_string(),
            },
            "log_position": position,
        })
        .to_string();
        (position, payload)
    }

    #[tokio::test]
    async fn test_events_published_then_checkpoint_committed() {
        let source = MemorySource::new(vec![like_payload(5), like_payload(6), like_payload(7)]);
        let sink = MemorySink::default();
        let checkpoints = MemoryCheckpointStore::new();
        let dead_letters = MemoryDeadLetters::default();

        let mut consumer = ChangeConsumer::new(
            source,
            sink.clone(),
            checkpoints.clone(),
            dead_letters.clone(),
        );
        consumer.run().await.expect("run succeeds");

        assert_eq!(sink.published.lock().await.len(), 3);
        assert_eq!(checkpoints.load("changes.likes", 0).await.unwrap(), Some(7));
        assert!(dead_letters.entries.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_checkpoint_behind() {
        let source = MemorySource::new(vec![like_payload(5), like_payload(6)]);
        let sink = MemorySink::default();
        let checkpoints = MemoryCheckpointStore::new();
        let dead_letters = MemoryDeadLetters::default();

        // First record goes through; then make the sink fail forever.
        struct FlakySink {
            inner: MemorySink,
            fail_from: usize,
            sent: AtomicU32,
        }

        #[async_trait]
        impl EventSink for FlakySink {
            async fn send(&self, event: DomainEvent) -> Result<(), CaptureError> {
                let n = self.sent.fetch_add(1, Ordering::SeqCst) as usize;
                if n >= self.fail_from {
                    return Err(CaptureError::RetryablePublishError);
                }
                self.inner.send(event).await
            }

            async fn send_batch(&self, _events: Vec<DomainEvent>) -> Result<(), CaptureError> {
                unreachable!("batch path unused in this test")
            }
        }

        let flaky = FlakySink {
            inner: sink.clone(),
            fail_from: 1,
            sent: AtomicU32::new(0),
        };

        let mut consumer =
            ChangeConsumer::new(source, flaky, checkpoints.clone(), dead_letters.clone());
        let result = consumer.run().await;

        assert!(result.is_err());
        // Only the published record's position is durable; position 6 will
        // be redelivered after restart.
        assert_eq!(checkpoints.load("changes.likes", 0).await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_poison_record_is_dead_lettered_and_skipped() {
        let source = MemorySource::new(vec![
            like_payload(1),
            (2, "{not json".to_owned()),
            like_payload(3),
        ]);
        let sink = MemorySink::default();
        let checkpoints = MemoryCheckpointStore::new();
        let dead_letters = MemoryDeadLetters::default();

        let mut consumer = ChangeConsumer::new(
            source,
            sink.clone(),
            checkpoints.clone(),
            dead_letters.clone(),
        );
        consumer.run().await.expect("one poison record never halts the pipeline");

        assert_eq!(sink.published.lock().await.len(), 2);
        assert_eq!(dead_letters.entries.lock().await.len(), 1);
        assert_eq!(checkpoints.load("changes.likes", 0).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_filtered_records_still_commit() {
        let payload = serde_json::json!({
            "source_table": "posts",
            "operation": "update",
            "primary_key": "p-1",
            "before": null,
            "after": {"id": Uuid::now_v7().to_string()},
            "log_position": 9,
        })
        .to_string();

        let source = MemorySource::new(vec![(9, payload)]);
        let sink = MemorySink::default();
        let checkpoints = MemoryCheckpointStore::new();
        let dead_letters = MemoryDeadLetters::default();

        let mut consumer = ChangeConsumer::new(
            source,
            sink.clone(),
            checkpoints.clone(),
            dead_letters.clone(),
        );
        consumer.run().await.expect("run succeeds");

        assert!(sink.published.lock().await.is_empty());
        assert!(dead_letters.entries.lock().await.is_empty());
        assert_eq!(checkpoints.load("changes.likes", 0).await.unwrap(), Some(9));
    }
}
