//! End-to-end pipeline behavior against in-process backends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use siphon_core::config::PipelineConfig;
use siphon_core::{Batch, Record};
use siphon_pipeline::sink::{BatchSink, SinkError};
use siphon_pipeline::{FlushOutcome, PipelineMetrics, ShutdownToken, Supervisor};
use siphon_queue::{MemoryQueue, QueueAdapter};
use siphon_source::SourceItem;

/// Sink that replays a script of failures before accepting, recording
/// every delivered batch.
struct ScriptedSink {
    failures: Mutex<Vec<SinkError>>,
    delivered: Mutex<Vec<Batch>>,
}

impl ScriptedSink {
    fn accepting() -> Self {
        Self::with_failures(Vec::new())
    }

    fn with_failures(failures: Vec<SinkError>) -> Self {
        Self {
            failures: Mutex::new(failures),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn delivered(&self) -> Vec<Batch> {
        self.delivered.lock().unwrap().clone()
    }

    fn delivered_device_ids(&self) -> Vec<String> {
        self.delivered()
            .iter()
            .flat_map(|b| b.records().iter().map(|r| r.device_id.clone()))
            .collect()
    }
}

#[async_trait]
impl BatchSink for ScriptedSink {
    async fn deliver(&self, batch: &Batch) -> Result<u64, SinkError> {
        if let Some(err) = self.failures.lock().unwrap().pop() {
            return Err(err);
        }
        self.delivered.lock().unwrap().push(batch.clone());
        Ok(batch.len() as u64)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn fast_config(batch_size: usize) -> PipelineConfig {
    PipelineConfig {
        batch_size,
        flush_interval_secs: 60,
        reconnect_delay_secs: 0,
        retry_max_delay_secs: 0,
        channel_capacity: 100,
        pop_max_wait_ms: 20,
        shutdown_grace_secs: 2,
        metrics_interval_secs: 60,
    }
}

fn supervisor(
    cfg: &PipelineConfig,
    shutdown: ShutdownToken,
) -> (Supervisor, Arc<PipelineMetrics>) {
    let metrics = PipelineMetrics::new();
    (Supervisor::new(cfg, metrics.clone(), shutdown), metrics)
}

fn record(i: i64) -> Record {
    Record::new(format!("dev-{i:03}"), 1_718_000_000 + i)
}

fn batch(n: i64) -> Batch {
    Batch::new((0..n).map(record).collect())
}

// ── flush retry ───────────────────────────────────────────────

#[tokio::test]
async fn test_transient_failure_retries_same_batch() {
    let cfg = fast_config(20);
    let (sup, metrics) = supervisor(&cfg, ShutdownToken::new());
    let sink = ScriptedSink::with_failures(vec![
        SinkError::Transient("connection reset".into()),
        SinkError::Transient("connection reset".into()),
    ]);

    let outcome = sup.flush_with_retry(&sink, batch(5)).await;

    assert_eq!(outcome, FlushOutcome::Written(5));
    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1, "same batch, delivered once");
    assert_eq!(delivered[0].len(), 5);

    let snap = metrics.snapshot();
    assert_eq!(snap.flush_failures_transient, 2);
    assert_eq!(snap.records_written, 5);
    assert_eq!(snap.records_dropped, 0);
}

#[tokio::test]
async fn test_permanent_failure_drops_batch_and_advances() {
    let cfg = fast_config(20);
    let (sup, metrics) = supervisor(&cfg, ShutdownToken::new());
    let sink = ScriptedSink::with_failures(vec![SinkError::Permanent("bad column type".into())]);

    let outcome = sup.flush_with_retry(&sink, batch(7)).await;
    assert_eq!(outcome, FlushOutcome::Dropped(7));

    // The pipeline is not wedged: the next batch goes through.
    let outcome = sup.flush_with_retry(&sink, batch(3)).await;
    assert_eq!(outcome, FlushOutcome::Written(3));

    let snap = metrics.snapshot();
    assert_eq!(snap.records_dropped, 7);
    assert_eq!(snap.records_written, 3);
    assert_eq!(snap.flush_failures_permanent, 1);
}

#[tokio::test]
async fn test_shutdown_abandons_retry_loop() {
    let cfg = fast_config(20);
    let shutdown = ShutdownToken::new();
    let (sup, _metrics) = supervisor(&cfg, shutdown.clone());
    let sink = ScriptedSink::with_failures(vec![
        SinkError::Transient("down".into()),
        SinkError::Transient("down".into()),
        SinkError::Transient("down".into()),
    ]);

    shutdown.trigger();
    let outcome = sup.flush_with_retry(&sink, batch(4)).await;
    assert_eq!(outcome, FlushOutcome::Abandoned(4));
    assert!(sink.delivered().is_empty());
}

// ── flush loop ────────────────────────────────────────────────

#[tokio::test]
async fn test_flush_loop_splits_on_size_and_final_flush() {
    let cfg = fast_config(20);
    let shutdown = ShutdownToken::new();
    let (sup, metrics) = supervisor(&cfg, shutdown.clone());
    let sink = ScriptedSink::accepting();

    let (tx, rx) = mpsc::channel(100);
    for i in 0..25 {
        tx.send(record(i)).await.unwrap();
    }
    drop(tx); // ingest side hangs up; loop drains and final-flushes

    sup.run_flush_loop(rx, &sink).await;

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].len(), 20);
    assert_eq!(delivered[1].len(), 5);
    // Arrival order is preserved across the batch boundary.
    assert_eq!(delivered[0].records()[0].device_id, "dev-000");
    assert_eq!(delivered[1].records()[0].device_id, "dev-020");

    assert_eq!(metrics.snapshot().records_written, 25);
    drop(shutdown);
}

#[tokio::test]
async fn test_flush_loop_shutdown_flushes_partial_batch() {
    let cfg = fast_config(20);
    let shutdown = ShutdownToken::new();
    let (sup, _metrics) = supervisor(&cfg, shutdown.clone());
    let sink = ScriptedSink::accepting();

    let (tx, rx) = mpsc::channel(100);
    for i in 0..3 {
        tx.send(record(i)).await.unwrap();
    }

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.trigger();
    });

    sup.run_flush_loop(rx, &sink).await;

    let delivered = sink.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].len(), 3);
}

#[tokio::test]
async fn test_shutdown_drain_flushes_in_capped_batches() {
    // Records buffered in the channel at shutdown must still go out in
    // batch_size chunks, not as one oversized insert.
    let cfg = fast_config(20);
    let shutdown = ShutdownToken::new();
    let (sup, metrics) = supervisor(&cfg, shutdown.clone());
    let sink = ScriptedSink::accepting();

    let (tx, rx) = mpsc::channel(100);
    for i in 0..100 {
        tx.send(record(i)).await.unwrap();
    }
    shutdown.trigger();

    sup.run_flush_loop(rx, &sink).await;

    let sizes: Vec<usize> = sink.delivered().iter().map(|b| b.len()).collect();
    assert!(
        sizes.iter().all(|&s| s <= 20),
        "no batch may exceed the cap: {sizes:?}"
    );
    assert_eq!(sizes.iter().sum::<usize>(), 100, "nothing lost in the drain");
    assert_eq!(metrics.snapshot().records_written, 100);
    drop(tx);
}

#[tokio::test]
async fn test_malformed_payload_between_valid_ones() {
    let cfg = fast_config(20);
    let shutdown = ShutdownToken::new();
    let (sup, metrics) = supervisor(&cfg, shutdown.clone());
    let sink = ScriptedSink::accepting();

    let decode = |payload: &[u8]| match Record::decode(payload) {
        Ok(record) => SourceItem::Record(record),
        Err(error) => SourceItem::Malformed {
            topic: "sensors/test".into(),
            error,
        },
    };
    let payloads: [&[u8]; 3] = [
        br#"{"device_id":"dev-a","timestamp":1,"temperature":20.0}"#,
        b"garbage",
        br#"{"device_id":"dev-b","timestamp":2,"temperature":21.0}"#,
    ];

    let (tx, rx) = mpsc::channel(10);
    for payload in payloads {
        if let Some(record) = sup.accept(decode(payload)) {
            tx.send(record).await.unwrap();
        }
    }
    drop(tx);

    sup.run_flush_loop(rx, &sink).await;

    let ids = sink.delivered_device_ids();
    assert_eq!(ids, ["dev-a", "dev-b"], "valid neighbors still stored");

    let snap = metrics.snapshot();
    assert_eq!(snap.records_ingested, 2);
    assert_eq!(snap.records_malformed, 1);
}

// ── drain loop ────────────────────────────────────────────────

#[tokio::test]
async fn test_drain_delivers_everything_exactly_once_and_acks() {
    let cfg = fast_config(20);
    let shutdown = ShutdownToken::new();
    let (sup, metrics) = supervisor(&cfg, shutdown.clone());
    let queue = MemoryQueue::new(1000);
    let sink = ScriptedSink::accepting();

    for i in 0..25 {
        queue.push(&record(i)).await.unwrap();
    }

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.trigger();
    });

    sup.run_drain_loop(&queue, &sink).await;

    let ids = sink.delivered_device_ids();
    assert_eq!(ids.len(), 25);
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), 25, "no record delivered twice");

    assert!(queue.is_empty());
    assert_eq!(queue.unacked_len(), 0, "everything acked after commit");
    assert_eq!(metrics.snapshot().queue_acked, 25);
}

#[tokio::test]
async fn test_drain_acks_permanently_failed_batch() {
    // A batch the store will never accept must not be redelivered
    // forever; it is dropped and its entries acked.
    let cfg = fast_config(5);
    let shutdown = ShutdownToken::new();
    let (sup, metrics) = supervisor(&cfg, shutdown.clone());
    let queue = MemoryQueue::new(100);
    let sink = ScriptedSink::with_failures(vec![SinkError::Permanent("constraint".into())]);

    for i in 0..5 {
        queue.push(&record(i)).await.unwrap();
    }

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();
    });

    sup.run_drain_loop(&queue, &sink).await;

    assert_eq!(queue.unacked_len(), 0, "dropped batch still acked");
    assert_eq!(metrics.snapshot().records_dropped, 5);
}

#[tokio::test]
async fn test_drain_abandoned_batch_left_unacked() {
    // Transient failure at shutdown: the batch is abandoned and its
    // entries stay unacked for redelivery to the next worker.
    let cfg = PipelineConfig {
        shutdown_grace_secs: 1,
        ..fast_config(5)
    };
    let shutdown = ShutdownToken::new();
    let (sup, _metrics) = supervisor(&cfg, shutdown.clone());
    let queue = MemoryQueue::new(100);
    let sink = ScriptedSink::with_failures(vec![
        SinkError::Transient("down".into()),
        SinkError::Transient("down".into()),
    ]);

    for i in 0..3 {
        queue.push(&record(i)).await.unwrap();
    }
    // Let the loop pop the entries, then shut down while the sink is
    // still failing.
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();
    });

    sup.run_drain_loop(&queue, &sink).await;

    assert!(sink.delivered().is_empty());
    assert_eq!(queue.unacked_len(), 3, "abandoned entries await redelivery");
}
