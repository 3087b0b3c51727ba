pub mod error;
pub mod mqtt;

pub use error::SourceError;
pub use mqtt::{MqttSource, SourceItem};
