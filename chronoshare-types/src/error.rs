//! Error types for the ChronoShare wire protocol.

use thiserror::Error;

/// Errors that can occur while encoding, decoding, or validating
/// protocol-level objects.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// A name could not be parsed into the expected convention
    #[error("malformed name: {0}")]
    MalformedName(String),

    /// A data object arrived for a different shared folder
    #[error("action belongs to shared folder '{0}', not ours")]
    WrongFolder(String),

    /// Signature over a data object did not verify
    #[error("data object signature mismatch for '{0}'")]
    BadSignature(String),

    /// An action body failed semantic validation
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// A hash string or blob had the wrong length or encoding
    #[error("invalid hash: {0}")]
    InvalidHash(String),
}
