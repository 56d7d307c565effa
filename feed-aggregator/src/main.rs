use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tracing::error;

use feed_aggregator::aggregator::Aggregator;
use feed_aggregator::config::Config;
use feed_aggregator::consumer::{run_event_loop, subscribe_events, DeadLetters};
use feed_aggregator::dedup::EventSeenSet;
use feed_aggregator::store::PostgresAggregationStore;
use feed_common::cache::RedisCacheClient;
use feed_common::kafka::create_kafka_producer;
use feed_common::metrics::{serve, setup_metrics_router};
use feed_common::retry::RetryPolicy;

async fn consume_events(config: Config) -> Result<()> {
    let cache = Arc::new(RedisCacheClient::new(&config.redis_url).map_err(|e| eyre::eyre!(e))?);
    let store =
        PostgresAggregationStore::new(&config.database_url, config.max_pg_connections).await?;

    let producer = create_kafka_producer(&config.kafka).await?;
    let dead_letters = DeadLetters::new(producer, config.dead_letter_topic.clone());

    let consumer = subscribe_events(
        &config.kafka.kafka_hosts,
        config.kafka.kafka_tls,
        &config.consumer_group,
        &config.events_topic,
    )?;

    let mut aggregator = Aggregator::new(
        EventSeenSet::new(cache.clone(), config.seen_window()),
        store,
        cache,
        RetryPolicy::default(),
        config.max_batch_size,
        config.follower_fanout_limit,
    );

    run_event_loop(
        &consumer,
        &mut aggregator,
        &dead_letters,
        config.flush_interval(),
    )
    .await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let bind = config.bind();

    let router = setup_metrics_router("feed-aggregator");
    let http_server = Box::pin(serve(router, &bind));
    let worker = Box::pin(consume_events(config));

    match select(http_server, worker).await {
        Either::Left((listen_result, _)) => {
            if let Err(e) = listen_result {
                error!("failed to start feed-aggregator http server: {}", e);
            }
        }
        Either::Right((consume_result, _)) => {
            if let Err(e) = consume_result {
                error!("feed-aggregator worker exited: {}", e);
            }
        }
    };
}
