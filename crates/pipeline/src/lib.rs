//! Pipeline assembly: batching, retry, supervision, and metrics.

pub mod accumulator;
pub mod metrics;
pub mod retry;
pub mod sink;
pub mod state;
pub mod supervisor;

pub use accumulator::BatchAccumulator;
pub use metrics::PipelineMetrics;
pub use retry::{connect_with_retry, ReconnectPolicy};
pub use sink::{BatchSink, QueuePushSink, SinkError, StorageSink};
pub use state::{ConnectionGauge, ConnectionState};
pub use supervisor::{spawn_signal_listener, FlushOutcome, ShutdownToken, Supervisor};
