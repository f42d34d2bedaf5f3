//! SHA-256 content digests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::ProtocolError;

/// A 32-byte SHA-256 digest.
///
/// Used both for file content addresses and for digest-tree roots.
/// Displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Compute the SHA-256 digest of a byte slice.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let result = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        Self(out)
    }

    /// Create a hash from raw bytes.
    ///
    /// Returns `None` if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 32 {
            let mut arr = [0u8; 32];
            arr.copy_from_slice(bytes);
            Some(Self(arr))
        } else {
            None
        }
    }

    /// Parse a hash from its 64-character hex representation.
    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidHash(e.to_string()))?;
        Self::from_bytes(&bytes)
            .ok_or_else(|| ProtocolError::InvalidHash(format!("wrong length: {}", bytes.len())))
    }

    /// Get the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_string()[..8])
    }
}
