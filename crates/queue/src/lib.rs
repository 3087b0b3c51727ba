pub mod adapter;
pub mod error;
pub mod memory;
pub mod redis_stream;

pub use adapter::{QueueAdapter, QueueEntry};
pub use error::QueueError;
pub use memory::MemoryQueue;
pub use redis_stream::RedisStreamQueue;
