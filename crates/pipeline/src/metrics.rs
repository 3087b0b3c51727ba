//! Process-wide pipeline counters.
//!
//! Plain atomics behind an `Arc`; every task bumps them lock-free and a
//! background reporter logs a JSON snapshot on a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::supervisor::ShutdownToken;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub records_ingested: AtomicU64,
    pub records_malformed: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub records_written: AtomicU64,
    pub flush_failures_transient: AtomicU64,
    pub flush_failures_permanent: AtomicU64,
    pub records_dropped: AtomicU64,
    pub queue_pushed: AtomicU64,
    pub queue_popped: AtomicU64,
    pub queue_acked: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub at: chrono::DateTime<chrono::Utc>,
    pub records_ingested: u64,
    pub records_malformed: u64,
    pub batches_flushed: u64,
    pub records_written: u64,
    pub flush_failures_transient: u64,
    pub flush_failures_permanent: u64,
    pub records_dropped: u64,
    pub queue_pushed: u64,
    pub queue_popped: u64,
    pub queue_acked: u64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            at: chrono::Utc::now(),
            records_ingested: self.records_ingested.load(Ordering::Relaxed),
            records_malformed: self.records_malformed.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            flush_failures_transient: self.flush_failures_transient.load(Ordering::Relaxed),
            flush_failures_permanent: self.flush_failures_permanent.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            queue_pushed: self.queue_pushed.load(Ordering::Relaxed),
            queue_popped: self.queue_popped.load(Ordering::Relaxed),
            queue_acked: self.queue_acked.load(Ordering::Relaxed),
        }
    }

    /// Log snapshots every `interval` until shutdown, then one final
    /// snapshot so the last numbers make it into the logs.
    pub async fn run_reporter(self: Arc<Self>, interval: Duration, shutdown: ShutdownToken) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.log_snapshot();
        }
        self.log_snapshot();
    }

    fn log_snapshot(&self) {
        match serde_json::to_string(&self.snapshot()) {
            Ok(json) => info!(metrics = %json, "pipeline metrics"),
            Err(e) => warn!(error = %e, "failed to serialize metrics snapshot"),
        }
    }
}
