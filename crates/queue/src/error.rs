//! Queue error types.

use thiserror::Error;

/// Failures of the buffering queue. Everything except `Serialize` is
/// retryable from the pipeline's point of view: the queue is expected
/// to come back, but a record that cannot serialize never will.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("push failed: {0}")]
    Push(String),

    #[error("pop failed: {0}")]
    Pop(String),

    #[error("acknowledge failed: {0}")]
    Ack(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}
