//! Queue adapter trait and types.
//!
//! The buffering queue decouples ingestion rate from storage write rate.
//! Backends implement [`QueueAdapter`]; the pipeline only ever talks to
//! the trait, so the drain logic is testable without a live Redis (the
//! in-process [`MemoryQueue`] has identical semantics).
//!
//! [`MemoryQueue`]: crate::memory::MemoryQueue

use std::time::Duration;

use async_trait::async_trait;

use siphon_core::Record;

use crate::error::QueueError;

/// One delivered queue item: the record plus the backend's delivery
/// handle, needed to acknowledge after a successful commit.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Backend-specific entry id (Redis stream entry id).
    pub id: String,
    pub record: Record,
}

/// Trait for queue backends.
///
/// `pop_batch` blocks up to `max_wait` and returns whatever is available,
/// including nothing: a timeout is an empty result, never an error. This
/// is what lets the accumulator's time-based flush trigger operate under
/// low traffic. Competing consumers (disjoint delivery across workers) is
/// a property of the backend, not reimplemented here.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Append one record to the queue.
    async fn push(&self, record: &Record) -> Result<(), QueueError>;

    /// Remove and return up to `max_items` entries, waiting up to
    /// `max_wait` for the first one.
    async fn pop_batch(
        &self,
        max_items: usize,
        max_wait: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    /// Acknowledge processed entries. Called only after the batch they
    /// belong to has committed; unacked entries are redelivered, giving
    /// at-least-once delivery.
    async fn ack(&self, ids: &[String]) -> Result<(), QueueError>;

    /// Approximate number of entries waiting in the queue.
    async fn depth(&self) -> Result<Option<u64>, QueueError> {
        Ok(None)
    }
}
