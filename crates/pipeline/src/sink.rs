//! Batch destinations behind one trait.
//!
//! The flush loop is destination-agnostic: direct mode writes batches
//! to PostgreSQL, queue mode pushes the same batches into the buffering
//! queue for a drain worker to persist later. Both report failures in
//! the transient/permanent taxonomy the retry loop acts on.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use siphon_core::Batch;
use siphon_queue::{QueueAdapter, QueueError};
use siphon_storage::{PgWriter, StorageError};

use crate::metrics::PipelineMetrics;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Worth retrying the same batch after a delay.
    #[error("transient sink error: {0}")]
    Transient(String),
    /// Retrying the same batch would fail forever.
    #[error("permanent sink error: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

impl From<StorageError> for SinkError {
    fn from(err: StorageError) -> Self {
        if err.is_transient() {
            SinkError::Transient(err.to_string())
        } else {
            SinkError::Permanent(err.to_string())
        }
    }
}

/// Where a completed batch goes.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Deliver the whole batch, returning how many records the
    /// destination accepted.
    async fn deliver(&self, batch: &Batch) -> Result<u64, SinkError>;

    fn name(&self) -> &'static str;
}

/// Direct-to-PostgreSQL sink.
pub struct StorageSink {
    writer: PgWriter,
}

impl StorageSink {
    pub fn new(writer: PgWriter) -> Self {
        Self { writer }
    }

    pub async fn close(&self) {
        self.writer.close().await;
    }
}

#[async_trait]
impl BatchSink for StorageSink {
    async fn deliver(&self, batch: &Batch) -> Result<u64, SinkError> {
        Ok(self.writer.write(batch).await?)
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

/// Queue-buffering sink: each record becomes one queue entry.
///
/// Queue failures are always transient: the queue holds no opinion on
/// record content, so any error is infrastructure trouble and the batch
/// is worth retrying.
pub struct QueuePushSink<Q> {
    queue: Q,
    metrics: Arc<PipelineMetrics>,
}

impl<Q: QueueAdapter> QueuePushSink<Q> {
    pub fn new(queue: Q, metrics: Arc<PipelineMetrics>) -> Self {
        Self { queue, metrics }
    }
}

#[async_trait]
impl<Q: QueueAdapter> BatchSink for QueuePushSink<Q> {
    async fn deliver(&self, batch: &Batch) -> Result<u64, SinkError> {
        let mut pushed = 0u64;
        for record in batch.records() {
            match self.queue.push(record).await {
                Ok(()) => {
                    pushed += 1;
                    PipelineMetrics::incr(&self.metrics.queue_pushed);
                }
                Err(err @ QueueError::Serialize(_)) => {
                    // A record that cannot serialize never will.
                    return Err(SinkError::Permanent(err.to_string()));
                }
                Err(err) => return Err(SinkError::Transient(err.to_string())),
            }
        }
        Ok(pushed)
    }

    fn name(&self) -> &'static str {
        "queue"
    }
}
