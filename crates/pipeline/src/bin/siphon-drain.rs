//! Drain worker: Redis stream → batched PostgreSQL writes.
//!
//! Runs as a member of the stream's consumer group, so any number of
//! drain workers can share the backlog. Entries are acknowledged only
//! after their batch commits; a crashed worker's entries are
//! redelivered and the store's conflict handling absorbs the overlap.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use siphon_core::config::{load_dotenv, Config};
use siphon_pipeline::sink::StorageSink;
use siphon_pipeline::{
    connect_with_retry, spawn_signal_listener, PipelineMetrics, ReconnectPolicy, ShutdownToken,
    Supervisor,
};
use siphon_queue::RedisStreamQueue;
use siphon_storage::PgWriter;

#[derive(Parser, Debug)]
#[command(name = "siphon-drain", about = "Queue drain worker")]
struct Args {
    /// Consumer name within the group; defaults to the generated
    /// REDIS_CONSUMER value.
    #[arg(long, env = "SIPHON_CONSUMER")]
    consumer: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(consumer) = args.consumer {
        config.redis.consumer = consumer;
    }
    config.log_summary();
    info!(consumer = %config.redis.consumer, "starting drain worker");

    let metrics = PipelineMetrics::new();
    let shutdown = ShutdownToken::new();
    spawn_signal_listener(shutdown.clone());

    let reporter = tokio::spawn(
        metrics
            .clone()
            .run_reporter(config.pipeline.metrics_interval(), shutdown.clone()),
    );

    let supervisor = Arc::new(Supervisor::new(
        &config.pipeline,
        metrics.clone(),
        shutdown.clone(),
    ));
    let policy = ReconnectPolicy::new(
        config.pipeline.reconnect_delay(),
        config.pipeline.retry_max_delay(),
    );

    let redis = config.redis.clone();
    let Some(queue) = connect_with_retry("redis", &shutdown, policy, move || {
        let redis = redis.clone();
        async move { RedisStreamQueue::connect(&redis).await }
    })
    .await
    else {
        return Ok(());
    };

    let pg = config.postgres.clone();
    let Some(writer) = connect_with_retry("postgres", &shutdown, policy, move || {
        let pg = pg.clone();
        async move { PgWriter::connect(&pg).await }
    })
    .await
    else {
        return Ok(());
    };

    let sink = StorageSink::new(writer);
    supervisor.run_drain_loop(&queue, &sink).await;
    sink.close().await;

    shutdown.trigger();
    reporter.await?;
    info!("drain worker stopped");
    Ok(())
}
