//! Task orchestration: ingest, flush, drain, and shutdown.
//!
//! The subscriber process runs two tasks joined by a bounded channel:
//! ingest (MQTT → channel) and flush (channel → accumulator → sink).
//! The drain process runs a single loop (queue → accumulator → store).
//! All of them watch one [`ShutdownToken`] and finish with a final
//! flush so records in flight are not lost on SIGTERM.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, instrument, warn};

use siphon_core::config::{MqttConfig, PipelineConfig};
use siphon_core::{Batch, Record};
use siphon_queue::QueueAdapter;
use siphon_source::{MqttSource, SourceItem};

use crate::accumulator::BatchAccumulator;
use crate::metrics::PipelineMetrics;
use crate::retry::ReconnectPolicy;
use crate::sink::BatchSink;
use crate::state::{ConnectionGauge, ConnectionState};

// ── Shutdown ──────────────────────────────────────────────────

/// Cooperative shutdown flag shared by every pipeline task.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown is triggered. Safe to call repeatedly and
    /// from any number of tasks.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Trip the token on SIGINT or SIGTERM.
pub fn spawn_signal_listener(shutdown: ShutdownToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cannot install SIGTERM handler, using ctrl-c only");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown signal received");
        shutdown.trigger();
    });
}

// ── Flush outcome ─────────────────────────────────────────────

/// What happened to one batch handed to [`Supervisor::flush_with_retry`].
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Committed; the destination accepted this many records.
    Written(u64),
    /// Permanently rejected; this many records were discarded.
    Dropped(usize),
    /// Shutdown interrupted the retry loop; this many records remain
    /// undelivered (a queue-fed batch stays unacked and is redelivered).
    Abandoned(usize),
}

// ── Supervisor ────────────────────────────────────────────────

pub struct Supervisor {
    metrics: Arc<PipelineMetrics>,
    shutdown: ShutdownToken,
    policy: ReconnectPolicy,
    batch_size: usize,
    flush_interval: Duration,
    pop_max_wait: Duration,
    shutdown_grace: Duration,
    source_gauge: ConnectionGauge,
    queue_gauge: ConnectionGauge,
}

impl Supervisor {
    pub fn new(cfg: &PipelineConfig, metrics: Arc<PipelineMetrics>, shutdown: ShutdownToken) -> Self {
        Self {
            metrics,
            shutdown,
            policy: ReconnectPolicy::new(cfg.reconnect_delay(), cfg.retry_max_delay()),
            batch_size: cfg.batch_size,
            flush_interval: cfg.flush_interval(),
            pop_max_wait: cfg.pop_max_wait(),
            shutdown_grace: cfg.shutdown_grace(),
            source_gauge: ConnectionGauge::new("source"),
            queue_gauge: ConnectionGauge::new("queue"),
        }
    }

    /// Sleep for the policy delay, cut short by shutdown.
    async fn backoff(&self, attempt: u32) {
        let delay = self.policy.delay_for(attempt);
        tokio::select! {
            _ = self.shutdown.wait() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // ── Ingest task ───────────────────────────────────────────

    /// Consume the broker subscription and feed records into `tx`.
    /// The bounded channel is the backpressure point: when the flush
    /// side falls behind, `send` awaits and the broker connection's
    /// own flow control takes over.
    pub async fn run_ingest(&self, cfg: &MqttConfig, tx: mpsc::Sender<Record>) {
        let mut attempt = 0u32;
        while !self.shutdown.is_triggered() {
            self.source_gauge.set(ConnectionState::Connecting);
            let mut source = match MqttSource::connect(cfg).await {
                Ok(source) => source,
                Err(e) => {
                    warn!(error = %e, attempt, "source connect failed");
                    self.source_gauge.set(ConnectionState::Disconnected);
                    self.backoff(attempt).await;
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            loop {
                let item = tokio::select! {
                    _ = self.shutdown.wait() => {
                        source.disconnect().await;
                        self.source_gauge.set(ConnectionState::Closed);
                        return;
                    }
                    item = source.next() => item,
                };
                match item {
                    Ok(item) => {
                        attempt = 0;
                        self.source_gauge.set(ConnectionState::Connected);
                        if let Some(record) = self.accept(item) {
                            if tx.send(record).await.is_err() {
                                // Flush side is gone; nothing left to feed.
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "source connection lost");
                        self.source_gauge.set(ConnectionState::Disconnected);
                        break;
                    }
                }
            }

            self.backoff(attempt).await;
            attempt = attempt.saturating_add(1);
        }
        self.source_gauge.set(ConnectionState::Closed);
    }

    /// Count one source item; malformed payloads are reported and
    /// dropped here, never propagated as pipeline errors.
    pub fn accept(&self, item: SourceItem) -> Option<Record> {
        match item {
            SourceItem::Record(record) => {
                PipelineMetrics::incr(&self.metrics.records_ingested);
                Some(record)
            }
            SourceItem::Malformed { topic, error } => {
                PipelineMetrics::incr(&self.metrics.records_malformed);
                warn!(%topic, %error, "discarding malformed payload");
                None
            }
        }
    }

    // ── Flush task ────────────────────────────────────────────

    /// Accumulate records from `rx` and flush to `sink` on either
    /// trigger. Exits when shutdown fires or the ingest side hangs up,
    /// then flushes the remainder within the grace period.
    pub async fn run_flush_loop<S: BatchSink>(&self, mut rx: mpsc::Receiver<Record>, sink: &S) {
        let mut acc = BatchAccumulator::new(self.batch_size, self.flush_interval);

        loop {
            let wait = acc.time_until_flush();
            tokio::select! {
                _ = self.shutdown.wait() => break,
                received = rx.recv() => match received {
                    Some(record) => {
                        if acc.offer(record) {
                            self.flush(sink, &mut acc).await;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep(wait) => {
                    if acc.should_flush() {
                        self.flush(sink, &mut acc).await;
                    }
                }
            }
        }

        // Drain whatever the channel still holds, flushing each full
        // batch as it fills; the sink never sees more than batch_size
        // records at once even when the channel buffered far more.
        while let Ok(record) = rx.try_recv() {
            if acc.offer(record) {
                self.flush(sink, &mut acc).await;
            }
        }
        self.final_flush(sink, &mut acc).await;
    }

    async fn flush<S: BatchSink>(&self, sink: &S, acc: &mut BatchAccumulator) {
        let batch = acc.take_batch();
        if batch.is_empty() {
            return;
        }
        self.flush_with_retry(sink, batch).await;
    }

    async fn final_flush<S: BatchSink>(&self, sink: &S, acc: &mut BatchAccumulator) {
        if acc.is_empty() {
            return;
        }
        let batch = acc.take_batch();
        let pending = batch.len();
        info!(records = pending, "final flush");
        let flush = self.flush_with_retry(sink, batch);
        if tokio::time::timeout(self.shutdown_grace, flush).await.is_err() {
            error!(records = pending, "final flush exceeded grace period, records lost");
        }
    }

    /// Deliver one batch, retrying transient failures on the backoff
    /// schedule. Permanent failures drop the batch and move on; one
    /// bad batch must not wedge the pipeline.
    #[instrument(name = "flush", skip_all, fields(sink = sink.name(), records = batch.len()))]
    pub async fn flush_with_retry<S: BatchSink>(&self, sink: &S, batch: Batch) -> FlushOutcome {
        let mut attempt = 0u32;
        loop {
            match sink.deliver(&batch).await {
                Ok(written) => {
                    PipelineMetrics::incr(&self.metrics.batches_flushed);
                    PipelineMetrics::add(&self.metrics.records_written, written);
                    info!(
                        sink = sink.name(),
                        records = batch.len(),
                        written,
                        "batch flushed"
                    );
                    return FlushOutcome::Written(written);
                }
                Err(e) if e.is_transient() => {
                    PipelineMetrics::incr(&self.metrics.flush_failures_transient);
                    if self.shutdown.is_triggered() {
                        warn!(sink = sink.name(), error = %e, "abandoning batch at shutdown");
                        return FlushOutcome::Abandoned(batch.len());
                    }
                    warn!(
                        sink = sink.name(),
                        error = %e,
                        attempt,
                        records = batch.len(),
                        "transient flush failure, batch retained"
                    );
                    self.backoff(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    PipelineMetrics::incr(&self.metrics.flush_failures_permanent);
                    PipelineMetrics::add(&self.metrics.records_dropped, batch.len() as u64);
                    error!(
                        sink = sink.name(),
                        error = %e,
                        records = batch.len(),
                        "permanent flush failure, dropping batch"
                    );
                    return FlushOutcome::Dropped(batch.len());
                }
            }
        }
    }

    // ── Drain task ────────────────────────────────────────────

    /// Pop entries from the queue, batch them, commit to `sink`, and
    /// acknowledge only after the commit. Entries in batches that are
    /// abandoned at shutdown stay unacked and are redelivered to the
    /// next worker; the store's conflict handling absorbs any overlap.
    pub async fn run_drain_loop<Q, S>(&self, queue: &Q, sink: &S)
    where
        Q: QueueAdapter,
        S: BatchSink,
    {
        let mut acc = BatchAccumulator::new(self.batch_size, self.flush_interval);
        let mut pending_acks: Vec<String> = Vec::new();
        let mut pop_errors = 0u32;

        while !self.shutdown.is_triggered() {
            let want = self.batch_size.saturating_sub(acc.pending_len()).max(1);
            let wait = acc.time_until_flush().min(self.pop_max_wait);

            let entries = tokio::select! {
                _ = self.shutdown.wait() => break,
                result = queue.pop_batch(want, wait) => match result {
                    Ok(entries) => {
                        pop_errors = 0;
                        self.queue_gauge.set(ConnectionState::Connected);
                        entries
                    }
                    Err(e) => {
                        warn!(error = %e, "queue pop failed");
                        self.queue_gauge.set(ConnectionState::Disconnected);
                        self.backoff(pop_errors).await;
                        pop_errors = pop_errors.saturating_add(1);
                        continue;
                    }
                },
            };

            PipelineMetrics::add(&self.metrics.queue_popped, entries.len() as u64);
            for entry in entries {
                pending_acks.push(entry.id);
                acc.offer(entry.record);
            }

            if acc.should_flush() {
                let batch = acc.take_batch();
                let ids = mem::take(&mut pending_acks);
                self.commit_and_ack(queue, sink, batch, ids).await;

                if let Ok(Some(depth)) = queue.depth().await {
                    debug!(depth, "queue depth after flush");
                }
            }
        }

        if !acc.is_empty() {
            let batch = acc.take_batch();
            let ids = mem::take(&mut pending_acks);
            let pending = batch.len();
            info!(records = pending, "final drain flush");
            let flush = self.commit_and_ack(queue, sink, batch, ids);
            if tokio::time::timeout(self.shutdown_grace, flush).await.is_err() {
                warn!(
                    records = pending,
                    "final drain flush exceeded grace period, entries left for redelivery"
                );
            }
        }
        self.queue_gauge.set(ConnectionState::Closed);
    }

    /// Acks follow the commit: written batches are acked because the
    /// data is safe, dropped batches are acked because redelivering
    /// them would only fail again, abandoned batches are left for
    /// redelivery.
    async fn commit_and_ack<Q, S>(&self, queue: &Q, sink: &S, batch: Batch, ids: Vec<String>)
    where
        Q: QueueAdapter,
        S: BatchSink,
    {
        match self.flush_with_retry(sink, batch).await {
            FlushOutcome::Written(_) | FlushOutcome::Dropped(_) => {
                match queue.ack(&ids).await {
                    Ok(()) => {
                        PipelineMetrics::add(&self.metrics.queue_acked, ids.len() as u64);
                    }
                    Err(e) => {
                        // The data is committed; a redelivery after this
                        // failure is absorbed by the store's conflict
                        // handling, so a warning is enough.
                        warn!(error = %e, entries = ids.len(), "ack failed after commit");
                    }
                }
            }
            FlushOutcome::Abandoned(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!token.is_triggered());
        token.trigger();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter must wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let token = ShutdownToken::new();
        token.trigger();
        tokio::time::timeout(Duration::from_millis(50), token.wait())
            .await
            .expect("already-triggered wait must not block");
    }
}
