//! Source adapter error types.

use thiserror::Error;

/// Failures of the broker subscription. `Connection` is terminal for the
/// adapter instance: the caller reconnects by constructing a new source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("broker connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("subscribe error: {0}")]
    Subscribe(#[from] rumqttc::ClientError),
}
