use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

use feed_common::cache::SharedCacheClient;
use feed_common::event::DomainEvent;
use feed_common::kafka::KafkaContext;

use crate::aggregator::Aggregator;
use crate::error::AggregationError;
use crate::store::AggregationStore;

/// Consumer-group subscription over the derived-event topic. Offsets are
/// stored manually after a successful flush and auto-committed from there,
/// so a crash replays at most one un-flushed batch.
pub fn subscribe_events(
    kafka_hosts: &str,
    kafka_tls: bool,
    consumer_group: &str,
    topic: &str,
) -> Result<StreamConsumer, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", kafka_hosts)
        .set("group.id", consumer_group)
        .set("statistics.interval.ms", "10000")
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false");

    if kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }

    let consumer: StreamConsumer = client_config.create()?;
    consumer.subscribe(&[topic])?;

    Ok(consumer)
}

/// Terminal parking spot for events this worker will never be able to apply.
/// Publishing is best-effort: losing a dead letter only loses diagnostics.
pub struct DeadLetters {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl DeadLetters {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: String) -> Self {
        Self { producer, topic }
    }

    pub async fn publish(&self, reason: &str, payload: &[u8]) {
        let envelope = json!({
            "reason": reason,
            "payload": String::from_utf8_lossy(payload),
        })
        .to_string();

        metrics::counter!("aggregator_dead_letters_total").increment(1);

        if let Err((kafka_error, _)) = self
            .producer
            .send(
                FutureRecord::<(), _>::to(&self.topic).payload(&envelope),
                Timeout::After(Duration::from_secs(5)),
            )
            .await
        {
            error!("failed to publish dead letter: {}", kafka_error);
        }
    }
}

pub async fn run_event_loop<S, C>(
    consumer: &StreamConsumer,
    aggregator: &mut Aggregator<S, C>,
    dead_letters: &DeadLetters,
    flush_interval: Duration,
) -> eyre::Result<()>
where
    S: AggregationStore,
    C: SharedCacheClient + Clone,
{
    let mut pending_offsets: HashMap<(String, i32), i64> = HashMap::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                aggregator.flush().await?;
                store_offsets(consumer, &mut pending_offsets)?;
            }
            message = consumer.recv() => {
                let message = message?;
                let payload = message.payload().unwrap_or_default();

                match serde_json::from_slice::<DomainEvent>(payload) {
                    Ok(event) => match aggregator.process(event).await {
                        Ok(()) => {}
                        Err(AggregationError::MalformedEvent(reason)) => {
                            warn!(reason, "dead-lettering malformed event");
                            dead_letters.publish(&reason, payload).await;
                        }
                        Err(error) => return Err(error.into()),
                    },
                    Err(parse_error) => {
                        metrics::counter!("aggregator_unparseable_events_total").increment(1);
                        dead_letters.publish(&parse_error.to_string(), payload).await;
                    }
                }

                pending_offsets.insert(
                    (message.topic().to_owned(), message.partition()),
                    message.offset(),
                );

                // A full buffer flushes inside process(); once nothing is
                // pending every received offset is safe to store.
                if aggregator.pending() == 0 {
                    store_offsets(consumer, &mut pending_offsets)?;
                }
            }
        }
    }
}

fn store_offsets(
    consumer: &StreamConsumer,
    pending: &mut HashMap<(String, i32), i64>,
) -> Result<(), KafkaError> {
    for ((topic, partition), offset) in pending.drain() {
        consumer.store_offset(&topic, partition, offset)?;
    }
    Ok(())
}
