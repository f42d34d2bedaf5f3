//! Sync-state vector messages.
//!
//! The body of every sync/recovery data object is a [`SyncStateMsg`]:
//! either a delta (the devices whose sequence advanced since the digest
//! named in the interest) or the full vector (recovery).

use serde::{Deserialize, Serialize};

use crate::{Name, ProtocolError};

/// Whether a device entry is being advanced or withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// The device's latest sequence advanced to `seq`.
    Update,
    /// The device left the sync collection.
    Delete,
}

/// One device's entry in the state vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// The device's routable name.
    pub device: Name,
    /// Latest known sequence number for the device.
    pub seq: u64,
    /// Advance or withdraw.
    pub status: DeviceStatus,
}

/// A set of device-state entries, exchanged during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncStateMsg {
    /// The entries, in ascending device order.
    pub states: Vec<DeviceState>,
}

impl SyncStateMsg {
    /// An empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry.
    pub fn push(&mut self, device: Name, seq: u64, status: DeviceStatus) {
        self.states.push(DeviceState {
            device,
            seq,
            status,
        });
    }

    /// Whether the message carries no entries.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(ProtocolError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(ProtocolError::Deserialization)
    }
}
