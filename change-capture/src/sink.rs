use async_trait::async_trait;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::producer::future_producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio::task::JoinSet;
use tracing::{error, warn};

use feed_common::event::DomainEvent;
use feed_common::kafka::KafkaContext;
use feed_common::retry::RetryPolicy;

use crate::error::CaptureError;

/// Where converted domain events go. The Kafka implementation publishes to
/// the derived-events topic; `PrintSink` exists for local runs.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: DomainEvent) -> Result<(), CaptureError>;
    async fn send_batch(&self, events: Vec<DomainEvent>) -> Result<(), CaptureError>;
}

pub struct PrintSink {}

#[async_trait]
impl EventSink for PrintSink {
    async fn send(&self, event: DomainEvent) -> Result<(), CaptureError> {
        tracing::info!("single event: {:?}", event);
        metrics::counter!("capture_events_published_total").increment(1);

        Ok(())
    }

    async fn send_batch(&self, events: Vec<DomainEvent>) -> Result<(), CaptureError> {
        metrics::histogram!("capture_event_batch_size").record(events.len() as f64);
        metrics::counter!("capture_events_published_total").increment(events.len() as u64);
        for event in events {
            tracing::info!("event: {:?}", event);
        }

        Ok(())
    }
}

#[derive(Clone)]
pub struct KafkaSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    retry_policy: RetryPolicy,
}

impl KafkaSink {
    pub fn new(
        producer: FutureProducer<KafkaContext>,
        topic: String,
        retry_policy: RetryPolicy,
    ) -> KafkaSink {
        KafkaSink {
            producer,
            topic,
            retry_policy,
        }
    }

    async fn produce_once(&self, payload: &str, key: &str) -> Result<(), CaptureError> {
        let delivery = self
            .producer
            .send(
                FutureRecord {
                    topic: self.topic.as_str(),
                    payload: Some(payload),
                    partition: None,
                    key: Some(key),
                    timestamp: None,
                    headers: None,
                },
                Timeout::Never,
            )
            .await;

        match delivery {
            Ok(_) => Ok(()),
            Err((e, _)) => match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::MessageSizeTooLarge) => {
                    metrics::counter!("capture_events_dropped_too_big").increment(1);
                    Err(CaptureError::NonRetryablePublishError)
                }
                _ => {
                    error!("failed to produce event: {}", e);
                    Err(CaptureError::RetryablePublishError)
                }
            },
        }
    }

    /// Publish one event, retrying transient failures with bounded backoff.
    async fn kafka_send(&self, event: DomainEvent) -> Result<(), CaptureError> {
        let payload = serde_json::to_string(&event).map_err(|e| {
            error!("failed to serialize event: {}", e);
            CaptureError::NonRetryablePublishError
        })?;
        let key = event.key();

        let mut attempt = 0;
        loop {
            match self.produce_once(&payload, &key).await {
                Ok(()) => {
                    metrics::counter!("capture_events_published_total").increment(1);
                    return Ok(());
                }
                Err(CaptureError::RetryablePublishError)
                    if self.retry_policy.should_retry(attempt) =>
                {
                    let backoff = self.retry_policy.time_until_next_retry(attempt);
                    warn!(
                        event_id = %event.event_id,
                        attempt,
                        "transient publish failure, retrying in {:?}", backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    metrics::counter!("capture_events_publish_failed_total").increment(1);
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl EventSink for KafkaSink {
    async fn send(&self, event: DomainEvent) -> Result<(), CaptureError> {
        self.kafka_send(event).await
    }

    async fn send_batch(&self, events: Vec<DomainEvent>) -> Result<(), CaptureError> {
        let mut set = JoinSet::new();

        for event in events {
            let sink = self.clone();
            set.spawn(async move { sink.kafka_send(event).await });
        }

        // Await on all the produce promises, surfacing the first error.
        let mut result = Ok(());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(_) => result = Err(CaptureError::RetryablePublishError),
            }
        }

        result
    }
}

/// Sink for records that cannot be processed. Carries the original bytes
/// plus a reason so the poison message can be replayed after a fix.
#[derive(Clone)]
pub struct DeadLetterSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl DeadLetterSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }

    pub async fn send(&self, raw: &[u8], reason: &str) {
        let envelope = serde_json::json!({
            "reason": reason,
            "payload": String::from_utf8_lossy(raw),
        })
        .to_string();

        let delivery = self
            .producer
            .send(
                FutureRecord::<str, str>::to(self.topic.as_str()).payload(&envelope),
                Timeout::Never,
            )
            .await;

        metrics::counter!("capture_events_dead_lettered_total").increment(1);
        if let Err((e, _)) = delivery {
            // Dead-lettering is best-effort: losing the envelope is logged,
            // never propagated into the consume loop.
            error!("failed to dead-letter record: {}", e);
        }
    }
}
