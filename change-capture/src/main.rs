use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tokio::task::JoinSet;
use tracing::{error, info};

use change_capture::checkpoint::PostgresCheckpointStore;
use change_capture::config::Config;
use change_capture::consumer::{ChangeConsumer, KafkaChangeSource};
use change_capture::sink::{DeadLetterSink, KafkaSink};
use feed_common::kafka::create_kafka_producer;
use feed_common::metrics::{serve, setup_metrics_router};
use feed_common::retry::RetryPolicy;

async fn consume_partitions(config: Config) -> Result<()> {
    let producer = create_kafka_producer(&config.kafka).await?;
    let checkpoints = std::sync::Arc::new(
        PostgresCheckpointStore::new(&config.database_url, config.max_pg_connections).await?,
    );

    let mut workers = JoinSet::new();

    for topic in config.change_topics() {
        let partitions = KafkaChangeSource::partition_count(
            &config.kafka.kafka_hosts,
            config.kafka.kafka_tls,
            &topic,
        )?;
        info!(topic, partitions, "starting change partition workers");

        for partition in 0..partitions as i32 {
            let source = KafkaChangeSource::assign(
                &config.kafka.kafka_hosts,
                config.kafka.kafka_tls,
                &config.consumer_group,
                &topic,
                partition,
                checkpoints.as_ref(),
            )
            .await?;

            let sink = KafkaSink::new(
                producer.clone(),
                config.events_topic.clone(),
                RetryPolicy::default(),
            );
            let dead_letters =
                DeadLetterSink::new(producer.clone(), config.dead_letter_topic.clone());
            let checkpoints = checkpoints.clone();

            workers.spawn(async move {
                let mut consumer = ChangeConsumer::new(source, sink, checkpoints, dead_letters);
                consumer.run().await
            });
        }
    }

    // Partition workers are independent; one failing worker brings the
    // process down so the orchestrator restarts it from the checkpoints.
    while let Some(joined) = workers.join_next().await {
        joined??;
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let bind = config.bind();

    let router = setup_metrics_router("change-capture");
    let http_server = Box::pin(serve(router, &bind));
    let consumers = Box::pin(consume_partitions(config));

    match select(http_server, consumers).await {
        Either::Left((listen_result, _)) => {
            if let Err(e) = listen_result {
                error!("failed to start change-capture http server: {}", e);
            }
        }
        Either::Right((consume_result, _)) => {
            if let Err(e) = consume_result {
                error!("change-capture consumer exited: {}", e);
            }
        }
    };
}
