//! Error types for the content store.

use chronoshare_types::ProtocolError;
use thiserror::Error;

/// Errors raised by the object store and its sub-stores.
#[derive(Debug, Error)]
pub enum ContentError {
    /// A database open, prepare, or step failed.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Reading or writing a local file failed.
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    /// A stored segment object could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No sub-store exists for a hash.
    #[error("no object store for hash {hash}")]
    NotFound {
        /// Hex of the missing content hash.
        hash: String,
    },
}

impl From<sqlx::Error> for ContentError {
    fn from(e: sqlx::Error) -> Self {
        ContentError::Database(e)
    }
}

impl From<std::io::Error> for ContentError {
    fn from(e: std::io::Error) -> Self {
        ContentError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ContentError>();
    }
}
