//! Size- and time-triggered batch accumulation.
//!
//! Records are appended until either the batch is full or the flush
//! interval has elapsed since the last flush. The two triggers are
//! independent: a size flush does not postpone the next timed flush,
//! and the interval clock only resets when a batch is actually taken.

use std::mem;
use std::time::Duration;

use tokio::time::Instant;

use siphon_core::{Batch, Record};

pub struct BatchAccumulator {
    pending: Vec<Record>,
    batch_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            pending: Vec::with_capacity(batch_size),
            batch_size,
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    /// Append one record. Returns true when the size trigger fires.
    pub fn offer(&mut self, record: Record) -> bool {
        self.pending.push(record);
        self.pending.len() >= self.batch_size
    }

    /// Whether either trigger calls for a flush right now. An empty
    /// accumulator never flushes, but it does restart the interval
    /// clock once the deadline passes, so idle periods don't turn the
    /// next single record into an instant flush.
    pub fn should_flush(&mut self) -> bool {
        if self.pending.is_empty() {
            if self.last_flush.elapsed() >= self.flush_interval {
                self.last_flush = Instant::now();
            }
            return false;
        }
        self.pending.len() >= self.batch_size || self.last_flush.elapsed() >= self.flush_interval
    }

    /// Time remaining until the interval trigger would fire.
    pub fn time_until_flush(&self) -> Duration {
        self.flush_interval.saturating_sub(self.last_flush.elapsed())
    }

    /// Snapshot everything pending as one batch and reset the interval
    /// clock. The accumulator is empty afterwards; records arriving
    /// while the snapshot is being written land in the next batch.
    pub fn take_batch(&mut self) -> Batch {
        self.last_flush = Instant::now();
        Batch::new(mem::take(&mut self.pending))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
