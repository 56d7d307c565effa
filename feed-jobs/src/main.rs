use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tracing::error;

use feed_common::cache::RedisCacheClient;
use feed_common::metrics::{serve, setup_metrics_router};
use feed_jobs::config::Config;
use feed_jobs::runner::JobRunner;
use feed_jobs::suggested::SuggestedAuthorsGenerator;
use feed_jobs::trending::TrendingGenerator;
use feed_jobs::warmer::CacheWarmer;
use feed_ranker::cache::CacheOrchestrator;
use feed_ranker::candidates::PostgresCandidateStore;
use feed_ranker::ranking::RankingEngine;

async fn run_jobs(config: Config) -> Result<()> {
    let ranking = config.ranking();

    let store = Arc::new(
        PostgresCandidateStore::new(&config.database_url, config.max_pg_connections).await?,
    );
    let shared = Arc::new(RedisCacheClient::new(&config.redis_url).map_err(|e| eyre::eyre!(e))?);
    let cache = Arc::new(CacheOrchestrator::new(
        shared,
        config.local_cache_capacity,
        config.local_cache_ttl(),
    ));
    let engine = Arc::new(RankingEngine::new(
        store.clone(),
        cache.clone(),
        ranking.clone(),
    ));

    let trending = JobRunner::new(
        TrendingGenerator::new(
            store.clone(),
            cache.clone(),
            ranking.trending_window,
            ranking.trending_cap,
            config.trending_ttl(),
        ),
        config.trending_interval(),
        config.max_jitter(),
    );

    let warmer = JobRunner::new(
        CacheWarmer::new(
            engine,
            store.clone(),
            config.activity_window(),
            config.active_user_limit,
        ),
        config.warmer_interval(),
        config.max_jitter(),
    );

    let suggested = JobRunner::new(
        SuggestedAuthorsGenerator::new(
            store,
            cache,
            config.activity_window(),
            ranking.affinity_window,
            config.active_user_limit,
            config.suggested_per_user,
            config.suggested_ttl(),
        ),
        config.suggested_interval(),
        config.max_jitter(),
    );

    tokio::join!(
        trending.run_forever(),
        warmer.run_forever(),
        suggested.run_forever(),
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let bind = config.bind();

    let router = setup_metrics_router("feed-jobs");
    let http_server = Box::pin(serve(router, &bind));
    let jobs = Box::pin(run_jobs(config));

    match select(http_server, jobs).await {
        Either::Left((listen_result, _)) => {
            if let Err(e) = listen_result {
                error!("failed to start feed-jobs http server: {}", e);
            }
        }
        Either::Right((jobs_result, _)) => {
            if let Err(e) = jobs_result {
                error!("feed-jobs runner exited: {}", e);
            }
        }
    };
}
