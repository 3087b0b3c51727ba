//! Subscriber worker: MQTT broker → batched sink.
//!
//! In `direct` mode batches go straight into PostgreSQL. In `queue`
//! mode they are pushed onto the Redis stream for drain workers
//! (`siphon-drain`) to persist, decoupling ingest rate from storage.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use siphon_core::config::{load_dotenv, Config};
use siphon_pipeline::sink::{QueuePushSink, StorageSink};
use siphon_pipeline::{
    connect_with_retry, spawn_signal_listener, BatchSink, PipelineMetrics, ReconnectPolicy,
    ShutdownToken, Supervisor,
};
use siphon_queue::RedisStreamQueue;
use siphon_storage::PgWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Write batches straight to PostgreSQL.
    Direct,
    /// Push batches onto the Redis stream for drain workers.
    Queue,
}

#[derive(Parser, Debug)]
#[command(name = "siphon-subscriber", about = "Telemetry ingestion worker")]
struct Args {
    /// Where completed batches go.
    #[arg(long, value_enum, env = "SIPHON_MODE", default_value = "direct")]
    mode: Mode,
}

async fn run<S: BatchSink>(
    supervisor: Arc<Supervisor>,
    config: &Config,
    sink: &S,
) -> Result<()> {
    let (tx, rx) = mpsc::channel(config.pipeline.channel_capacity);

    let ingest = {
        let supervisor = supervisor.clone();
        let mqtt = config.mqtt.clone();
        tokio::spawn(async move { supervisor.run_ingest(&mqtt, tx).await })
    };

    supervisor.run_flush_loop(rx, sink).await;
    ingest.await?;
    Ok(())
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
    let config = Config::from_env();
    config.log_summary();
    info!(mode = ?args.mode, "starting subscriber");

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

    match args.mode {
        Mode::Direct => {
            let pg = config.postgres.clone();
            let Some(writer) =
                connect_with_retry("postgres", &shutdown, policy, move || {
                    let pg = pg.clone();
                    async move { PgWriter::connect(&pg).await }
                })
                .await
            else {
                return Ok(());
            };
            let sink = StorageSink::new(writer);
            run(supervisor, &config, &sink).await?;
            sink.close().await;
        }
        Mode::Queue => {
            let redis = config.redis.clone();
            let Some(queue) = connect_with_retry("redis", &shutdown, policy, move || {
                let redis = redis.clone();
                async move { RedisStreamQueue::connect(&redis).await }
            })
            .await
            else {
                return Ok(());
            };
            let sink = QueuePushSink::new(queue, metrics.clone());
            run(supervisor, &config, &sink).await?;
        }
    }

    shutdown.trigger();
    reporter.await?;
    info!("subscriber stopped");
    Ok(())
}
