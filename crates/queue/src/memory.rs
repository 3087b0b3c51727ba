//! In-process queue backend.
//!
//! Same contract as the Redis backend (bounded capacity, blocking
//! `pop_batch` with timeout, ack bookkeeping) over a plain `VecDeque`.
//! Used by the pipeline tests and by single-process deployments where an
//! external queue is overkill.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use siphon_core::Record;

use crate::adapter::{QueueAdapter, QueueEntry};
use crate::error::QueueError;

#[derive(Default)]
struct State {
    entries: VecDeque<QueueEntry>,
    unacked: HashMap<String, Record>,
    next_id: u64,
}

/// Bounded in-memory queue. Cloning yields another handle onto the same
/// queue, so multiple consumers compete for entries exactly like members
/// of a Redis consumer group.
#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl MemoryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            capacity,
        }
    }

    /// Entries waiting to be popped.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries delivered but not yet acknowledged.
    pub fn unacked_len(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }
}

#[async_trait]
impl QueueAdapter for MemoryQueue {
    async fn push(&self, record: &Record) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.entries.len() >= self.capacity {
                return Err(QueueError::Push(format!(
                    "queue full ({} entries)",
                    self.capacity
                )));
            }
            let id = format!("{}-0", state.next_id);
            state.next_id += 1;
            state.entries.push_back(QueueEntry {
                id,
                record: record.clone(),
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop_batch(
        &self,
        max_items: usize,
        max_wait: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let deadline = Instant::now() + max_wait;

        loop {
            // Register interest before checking state so a push racing
            // this check cannot be missed.
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().unwrap();
                if !state.entries.is_empty() {
                    let n = max_items.min(state.entries.len());
                    let mut popped = Vec::with_capacity(n);
                    while popped.len() < n {
                        if let Some(entry) = state.entries.pop_front() {
                            state.unacked.insert(entry.id.clone(), entry.record.clone());
                            popped.push(entry);
                        }
                    }
                    return Ok(popped);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn ack(&self, ids: &[String]) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            state.unacked.remove(id);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<Option<u64>, QueueError> {
        Ok(Some(self.len() as u64))
    }
}
