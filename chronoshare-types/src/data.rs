//! The named, signed, immutable wire unit.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Hash, Name, ProtocolError};

/// An immutable, signed, named blob: the unit satisfying one interest.
///
/// The signature is the SHA-256 digest over `wire(name) ∥ content`
/// (the DigestSha256 signature type). Objects are signed when built and
/// stored verbatim so peers can re-serve the exact bytes without
/// re-signing.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataObject {
    /// The full name of this object.
    pub name: Name,
    /// How long (seconds) a cache may treat this object as fresh.
    /// `None` means no freshness bound.
    pub freshness_secs: Option<u32>,
    /// The payload.
    pub content: Vec<u8>,
    /// SHA-256 over `wire(name) ∥ content`.
    pub signature: Hash,
}

impl DataObject {
    /// Build and sign a data object.
    pub fn new(name: Name, content: Vec<u8>) -> Self {
        let signature = Self::compute_signature(&name, &content);
        Self {
            name,
            freshness_secs: None,
            content,
            signature,
        }
    }

    /// Build and sign a data object with a freshness period.
    pub fn with_freshness(name: Name, content: Vec<u8>, freshness_secs: u32) -> Self {
        let mut data = Self::new(name, content);
        data.freshness_secs = Some(freshness_secs);
        data
    }

    /// Verify the signature against the name and content.
    pub fn verify(&self) -> bool {
        Self::compute_signature(&self.name, &self.content) == self.signature
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(ProtocolError::Serialization)
    }

    /// Deserialize from MessagePack bytes, rejecting objects whose
    /// signature does not verify.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let data: Self = rmp_serde::from_slice(bytes).map_err(ProtocolError::Deserialization)?;
        if !data.verify() {
            return Err(ProtocolError::BadSignature(data.name.to_string()));
        }
        Ok(data)
    }

    fn compute_signature(name: &Name, content: &[u8]) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(name.wire_encode());
        hasher.update(content);
        let digest = hasher.finalize();
        Hash::from_bytes(&digest).expect("sha256 output is 32 bytes")
    }
}

impl std::fmt::Debug for DataObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataObject")
            .field("name", &self.name)
            .field("freshness_secs", &self.freshness_secs)
            .field("content", &format!("[{} bytes]", self.content.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let data = DataObject::new("/alice/file/0".parse().unwrap(), b"payload".to_vec());
        assert!(data.verify());
    }

    #[test]
    fn tampered_content_fails_verification() {
        let mut data = DataObject::new("/alice/file/0".parse().unwrap(), b"payload".to_vec());
        data.content = b"tampered".to_vec();
        assert!(!data.verify());
    }

    #[test]
    fn tampered_name_fails_verification() {
        let mut data = DataObject::new("/alice/file/0".parse().unwrap(), b"payload".to_vec());
        data.name = "/mallory/file/0".parse().unwrap();
        assert!(!data.verify());
    }

    #[test]
    fn wire_roundtrip() {
        let data = DataObject::with_freshness(
            "/alice/chronoshare/file/abc/3".parse().unwrap(),
            vec![1, 2, 3, 4],
            60,
        );
        let bytes = data.to_bytes().unwrap();
        let restored = DataObject::from_bytes(&bytes).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn from_bytes_rejects_bad_signature() {
        let mut data = DataObject::new("/alice/file/0".parse().unwrap(), b"payload".to_vec());
        data.content = b"tampered".to_vec();
        let bytes = rmp_serde::to_vec(&data).unwrap();
        assert!(matches!(
            DataObject::from_bytes(&bytes),
            Err(ProtocolError::BadSignature(_))
        ));
    }

    #[test]
    fn empty_content_is_signable() {
        let data = DataObject::new("/alice/file/empty/0".parse().unwrap(), Vec::new());
        assert!(data.verify());
        assert!(data.content.is_empty());
    }
}
