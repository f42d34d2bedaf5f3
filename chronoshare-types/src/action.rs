//! Action records - one file-system mutation each.

use serde::{Deserialize, Serialize};

use crate::{Hash, Name, ProtocolError};

/// What an action does to its filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// The file was created or its content/metadata changed.
    Update,
    /// The file was removed.
    Delete,
}

impl ActionKind {
    /// Stable integer encoding used in the database (0 = update, 1 = delete).
    pub fn as_i64(self) -> i64 {
        match self {
            ActionKind::Update => 0,
            ActionKind::Delete => 1,
        }
    }

    /// Decode from the database representation.
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(ActionKind::Update),
            1 => Some(ActionKind::Delete),
            _ => None,
        }
    }
}

/// One mutation record on one filename, as carried on the wire.
///
/// The emitting device wraps the serialized item in a signed [`crate::DataObject`]
/// named `<device>/<app>/action/<shared-folder>/<seq>`; the (device, seq)
/// primary key therefore lives in the name, not the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    /// Update or delete.
    pub kind: ActionKind,
    /// UTF-8 path relative to the shared folder root.
    pub filename: String,
    /// Per-filename monotonic version counter.
    pub version: u64,
    /// UTC wall time of the emitter (unix seconds).
    pub timestamp: i64,
    /// Content hash. Present only for updates.
    pub file_hash: Option<Hash>,
    /// File modification time (unix seconds). Present only for updates.
    pub mtime: Option<i64>,
    /// Unix permission bits. Present only for updates.
    pub mode: Option<u32>,
    /// Number of content segments. Present only for updates.
    pub seg_num: Option<u64>,
    /// The action this one supersedes for the same filename, if any.
    pub parent_device: Option<Name>,
    /// Sequence number of the superseded action.
    pub parent_seq: Option<u64>,
}

impl ActionItem {
    /// Build an update action.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        filename: String,
        version: u64,
        timestamp: i64,
        file_hash: Hash,
        mtime: i64,
        mode: u32,
        seg_num: u64,
        parent: Option<(Name, u64)>,
    ) -> Self {
        let (parent_device, parent_seq) = match parent {
            Some((d, s)) => (Some(d), Some(s)),
            None => (None, None),
        };
        Self {
            kind: ActionKind::Update,
            filename,
            version,
            timestamp,
            file_hash: Some(file_hash),
            mtime: Some(mtime),
            mode: Some(mode),
            seg_num: Some(seg_num),
            parent_device,
            parent_seq,
        }
    }

    /// Build a delete action. Deletes always supersede a prior update.
    pub fn delete(
        filename: String,
        version: u64,
        timestamp: i64,
        parent_device: Name,
        parent_seq: u64,
    ) -> Self {
        Self {
            kind: ActionKind::Delete,
            filename,
            version,
            timestamp,
            file_hash: None,
            mtime: None,
            mode: None,
            seg_num: None,
            parent_device: Some(parent_device),
            parent_seq: Some(parent_seq),
        }
    }

    /// The parent reference, if present.
    pub fn parent(&self) -> Option<(&Name, u64)> {
        match (&self.parent_device, self.parent_seq) {
            (Some(d), Some(s)) => Some((d, s)),
            _ => None,
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(ProtocolError::Serialization)
    }

    /// Deserialize from MessagePack bytes and validate field presence.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let item: Self = rmp_serde::from_slice(bytes).map_err(ProtocolError::Deserialization)?;
        item.validate()?;
        Ok(item)
    }

    /// Check the kind-dependent field invariants.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self.kind {
            ActionKind::Update => {
                if self.file_hash.is_none()
                    || self.mtime.is_none()
                    || self.mode.is_none()
                    || self.seg_num.is_none()
                {
                    return Err(ProtocolError::InvalidAction(format!(
                        "update for '{}' is missing file metadata",
                        self.filename
                    )));
                }
            }
            ActionKind::Delete => {
                if self.parent().is_none() {
                    return Err(ProtocolError::InvalidAction(format!(
                        "delete for '{}' has no parent",
                        self.filename
                    )));
                }
            }
        }
        Ok(())
    }
}
