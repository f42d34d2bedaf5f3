//! Error types for the sync machinery.

use chronoshare_content::ContentError;
use chronoshare_log::LogError;
use chronoshare_types::{Name, ProtocolError};
use thiserror::Error;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum FaceError {
    /// No data arrived within the interest lifetime.
    #[error("interest timed out: {0}")]
    Timeout(Name),

    /// The face (or its hub) is gone.
    #[error("face closed")]
    Closed,

    /// Sending failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Errors raised by a fetcher run.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No segment arrived for longer than the configured no-activity
    /// period; the fetcher is failed and handed back to the manager.
    #[error("no data activity for {0} seconds")]
    NoActivity(u64),

    /// The segment sink rejected a delivered segment.
    #[error("segment sink failed: {0}")]
    Sink(String),

    /// The transport is gone.
    #[error(transparent)]
    Face(#[from] FaceError),
}

/// Errors raised by the sync core and its serving paths.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A journal operation failed.
    #[error(transparent)]
    Log(#[from] LogError),

    /// The content store failed.
    #[error(transparent)]
    Content(#[from] ContentError),

    /// A wire object could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transport failed.
    #[error(transparent)]
    Face(#[from] FaceError),

    /// Reading or writing a local file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The node configuration is unusable.
    #[error(transparent)]
    Config(#[from] crate::ConfigError),
}
