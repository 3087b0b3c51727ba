//! Redis Streams queue backend.
//!
//! Records are appended with `XADD` under an approximate `MAXLEN` cap and
//! drained through a consumer group (`XREADGROUP` with `COUNT`/`BLOCK`,
//! `XACK` after commit). The consumer group gives competing-consumers
//! semantics: each entry is delivered to exactly one worker per group.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use siphon_core::config::RedisConfig;
use siphon_core::Record;

use crate::adapter::{QueueAdapter, QueueEntry};
use crate::error::QueueError;

/// Field name under which the record JSON is stored in each stream entry.
const DATA_FIELD: &str = "data";

/// `BLOCK 0` means "wait forever" to Redis, so a sub-millisecond wait
/// must round up to 1ms to stay a bounded wait.
fn block_millis(max_wait: Duration) -> usize {
    (max_wait.as_millis() as usize).max(1)
}

/// Redis-Streams-backed queue.
pub struct RedisStreamQueue {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
    consumer: String,
    maxlen: u64,
}

impl RedisStreamQueue {
    /// Connect and ensure the consumer group exists (MKSTREAM creates the
    /// stream on first use; BUSYGROUP means another worker got there first).
    pub async fn connect(cfg: &RedisConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(cfg.url())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&cfg.stream, &cfg.group, "0")
            .await;
        match created {
            Ok(()) => info!(stream = %cfg.stream, group = %cfg.group, "created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %cfg.stream, group = %cfg.group, "consumer group already exists");
            }
            Err(e) => return Err(QueueError::Connection(e.to_string())),
        }

        info!(
            stream = %cfg.stream,
            group = %cfg.group,
            consumer = %cfg.consumer,
            "redis stream queue ready"
        );

        Ok(Self {
            conn,
            stream: cfg.stream.clone(),
            group: cfg.group.clone(),
            consumer: cfg.consumer.clone(),
            maxlen: cfg.maxlen,
        })
    }
}

#[async_trait]
impl QueueAdapter for RedisStreamQueue {
    async fn push(&self, record: &Record) -> Result<(), QueueError> {
        let json = serde_json::to_string(record)
            .map_err(|e| QueueError::Serialize(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _id: String = conn
            .xadd_maxlen(
                &self.stream,
                StreamMaxlen::Approx(self.maxlen as usize),
                "*",
                &[(DATA_FIELD, json.as_str())],
            )
            .await
            .map_err(|e| QueueError::Push(e.to_string()))?;

        Ok(())
    }

    async fn pop_batch(
        &self,
        max_items: usize,
        max_wait: Duration,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max_items)
            .block(block_millis(max_wait));

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await
            .map_err(|e| QueueError::Pop(e.to_string()))?;

        let mut entries = Vec::new();
        let mut poison_ids = Vec::new();

        for key in reply.keys {
            for item in key.ids {
                let raw: Option<String> = item
                    .map
                    .get(DATA_FIELD)
                    .and_then(|v| redis::from_redis_value(v).ok());

                let decoded = raw
                    .as_deref()
                    .map(|json| serde_json::from_str::<Record>(json));

                match decoded {
                    Some(Ok(record)) => entries.push(QueueEntry {
                        id: item.id.clone(),
                        record,
                    }),
                    other => {
                        // Undecodable entries would redeliver forever if left
                        // unacked. Drop them at the queue boundary instead.
                        warn!(
                            entry_id = %item.id,
                            decodable = other.is_some(),
                            "dropping malformed stream entry"
                        );
                        poison_ids.push(item.id.clone());
                    }
                }
            }
        }

        if !poison_ids.is_empty() {
            self.ack(&poison_ids).await?;
        }

        Ok(entries)
    }

    async fn ack(&self, ids: &[String]) -> Result<(), QueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _acked: u64 = conn
            .xack(&self.stream, &self.group, ids)
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))?;
        Ok(())
    }

    async fn depth(&self) -> Result<Option<u64>, QueueError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn
            .xlen(&self.stream)
            .await
            .map_err(|e| QueueError::Pop(e.to_string()))?;
        Ok(Some(len))
    }
}
