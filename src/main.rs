//! Herald worker - project event to notification bridge.
//!
//! Consumes project lifecycle events from a Redis stream consumer group,
//! dispatches each through the notification builders, publishes the results
//! to the general and role streams and settles every delivery.
//!
//! ## Configuration
//!
//! See [`herald::config`] for the full list. The essentials:
//! - `REDIS_URL`: Redis connection string (default: `redis://localhost:6379`)
//! - `HERALD_CONFIG`: optional TOML file (default: `config/herald.toml`)
//! - `HERALD_REPOST_INTERVAL_MS`: repost interval (default: 10000)
//! - `RUST_LOG`: Logging level (default: "info")

use deadpool_redis::{Config, Runtime};
use herald::audience::AudienceResolver;
use herald::broker::{Delivery, RedisConsumer, RedisPublisher};
use herald::builders::BuilderContext;
use herald::config::HeraldConfig;
use herald::fetcher::HttpRecordFetcher;
use herald::shutdown::ShutdownSignal;
use herald::{Dispatcher, RepostScheduler, Settlement};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long a stream read blocks waiting for new events (in milliseconds)
const READ_BLOCK_MS: usize = 2000;

/// Back-off after a failed stream read
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Stats {
    acked: u64,
    nacked: u64,
    settle_errors: u64,
}

/// Process one batch concurrently and wait until every delivery is settled.
async fn process_batch(dispatcher: &Arc<Dispatcher>, deliveries: Vec<Delivery>, stats: &mut Stats) {
    let mut tasks = JoinSet::new();

    for delivery in deliveries {
        let dispatcher = dispatcher.clone();
        tasks.spawn(async move {
            let id = delivery.id.clone();
            (id, dispatcher.process(delivery).await)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, Ok(Settlement::Acked))) => {
                debug!(id = %id, "Delivery acked");
                stats.acked += 1;
            }
            Ok((id, Ok(Settlement::Nacked))) => {
                debug!(id = %id, "Delivery nacked");
                stats.nacked += 1;
            }
            Ok((id, Err(e))) => {
                error!(id = %id, error = %e, "Failed to settle delivery");
                stats.settle_errors += 1;
            }
            Err(e) => {
                error!(error = %e, "Dispatch task panicked");
                stats.settle_errors += 1;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = HeraldConfig::load()?;
    let worker_name = config.worker_name();

    info!(
        worker_name = %worker_name,
        consumer_group = %config.broker.consumer_group,
        source_stream = %config.broker.source_stream,
        "Herald worker starting"
    );

    let pool = Config::from_url(&config.broker.url).create_pool(Some(Runtime::Tokio1))?;

    let publisher = Arc::new(RedisPublisher::new(pool.clone()));
    let resolver = AudienceResolver::new(&config.destinations);
    let scheduler =
        RepostScheduler::with_interval(publisher.clone(), resolver.clone(), config.repost.interval());
    let ctx = BuilderContext::new(
        Arc::new(HttpRecordFetcher::from_config(&config.api)),
        config.audience.pools(),
        &config.slack.project_url,
    );
    let dispatcher = Arc::new(Dispatcher::new(ctx, resolver, publisher, scheduler.clone()));

    let consumer = RedisConsumer::new(pool, &config.broker, &worker_name);
    consumer.ensure_group().await?;

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen());

    let reclaim_every = Duration::from_millis(config.broker.claim_idle_ms);
    let mut last_reclaim: Option<Instant> = None;
    let mut stats = Stats::default();

    info!(stream = %config.broker.source_stream, "Listening for events");

    loop {
        let reclaim_due = last_reclaim.map_or(true, |at| at.elapsed() >= reclaim_every);

        let batch = tokio::select! {
            _ = shutdown.triggered() => break,
            batch = async {
                if reclaim_due {
                    consumer.reclaim().await
                } else {
                    consumer.receive(READ_BLOCK_MS).await
                }
            } => batch,
        };

        if reclaim_due {
            last_reclaim = Some(Instant::now());
        }

        let deliveries = match batch {
            Ok(deliveries) => deliveries,
            Err(e) => {
                warn!(error = %e, "Stream read error");
                tokio::time::sleep(READ_ERROR_BACKOFF).await;
                continue;
            }
        };

        if deliveries.is_empty() {
            continue;
        }

        process_batch(&dispatcher, deliveries, &mut stats).await;

        let total = stats.acked + stats.nacked;
        if total > 0 && total % 100 == 0 {
            info!(
                acked = stats.acked,
                nacked = stats.nacked,
                settle_errors = stats.settle_errors,
                "Worker statistics"
            );
        }
    }

    scheduler.shutdown().await;

    info!(
        acked = stats.acked,
        nacked = stats.nacked,
        settle_errors = stats.settle_errors,
        "Worker shutdown complete"
    );
    Ok(())
}
