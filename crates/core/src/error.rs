use thiserror::Error;

/// Errors raised while decoding a wire payload into a [`Record`].
///
/// All variants are permanent-class: the payload itself is bad, retrying
/// the decode cannot help. Callers count and drop, never abort.
///
/// [`Record`]: crate::record::Record
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' has wrong type (expected {1})")]
    InvalidField(&'static str, &'static str),
}
