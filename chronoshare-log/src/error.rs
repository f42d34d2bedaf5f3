//! Error types for the log crates.

use chronoshare_types::ProtocolError;
use thiserror::Error;

/// Errors raised by the action log and sync log.
#[derive(Debug, Error)]
pub enum LogError {
    /// A database open, prepare, or step failed. The enclosing transaction
    /// rolls back; persistent state is unaffected.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// A wire object could not be decoded or failed validation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A row that must exist was absent.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for LogError {
    fn from(e: sqlx::Error) -> Self {
        LogError::Database(e)
    }
}
