//! # chronoshare-types
//!
//! Wire format types for the ChronoShare distributed folder-sync protocol.
//!
//! This crate provides the foundational types used across all ChronoShare
//! crates:
//! - [`Name`], [`Component`] - hierarchical NDN-style names
//! - [`Hash`] - SHA-256 content digests
//! - [`DataObject`] - the named, signed, immutable wire unit
//! - [`ActionItem`] - one file-system mutation record (update or delete)
//! - [`SyncStateMsg`] - the per-device latest-sequence vector exchanged
//!   during reconciliation
//! - [`ProtocolError`] - error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod action;
mod data;
mod error;
mod hash;
mod name;
mod state;

pub use action::{ActionItem, ActionKind};
pub use data::DataObject;
pub use error::ProtocolError;
pub use hash::Hash;
pub use name::{Component, Name};
pub use state::{DeviceState, DeviceStatus, SyncStateMsg};
