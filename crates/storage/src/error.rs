//! Storage error types and transient/permanent classification.

use thiserror::Error;

/// A failed storage operation, split by whether retrying can help.
///
/// Transient covers infrastructure trouble (connection drops, pool
/// timeouts, deadlocks); the batch is kept and retried. Permanent covers
/// data problems (constraint violations, type mismatches); retrying the
/// same batch would fail forever, so it is reported and dropped.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transient storage error: {0}")]
    Transient(#[source] sqlx::Error),

    #[error("permanent storage error: {0}")]
    Permanent(#[source] sqlx::Error),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Map a sqlx error onto the retry taxonomy.
///
/// SQLSTATE classes: 08 (connection exception), 40 (rollback:
/// serialization failure, deadlock), 53 (insufficient resources) and
/// 57 (operator intervention, e.g. admin shutdown) recover on retry.
/// Everything else data-shaped (23 integrity, 22 data exception, 42
/// syntax/access) does not.
pub fn classify(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StorageError::Transient(err),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code)
                if code.starts_with("08")
                    || code.starts_with("40")
                    || code.starts_with("53")
                    || code.starts_with("57") =>
            {
                StorageError::Transient(err)
            }
            _ => StorageError::Permanent(err),
        },
        _ => StorageError::Permanent(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_transient() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(classify(err).is_transient());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_transient());
        assert!(classify(sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn test_protocol_error_is_transient() {
        assert!(classify(sqlx::Error::Protocol("unexpected frame".into())).is_transient());
    }

    #[test]
    fn test_row_not_found_is_permanent() {
        assert!(!classify(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_column_decode_is_permanent() {
        let err = sqlx::Error::ColumnNotFound("temperature".into());
        assert!(!classify(err).is_transient());
    }
}
