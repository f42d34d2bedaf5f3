//! # chronoshare-log
//!
//! The persistent journals at the core of ChronoShare:
//!
//! - [`ActionLog`] - the per-device append-only journal of file mutations,
//!   doubling as the conflict-resolution engine over the versioned file tree
//! - [`FileState`] - the derived current-winner view, one row per live file
//! - [`SyncLog`] - the per-device latest-sequence vector, its digest-tree
//!   root, and the recent-state log used to answer recovery requests
//!
//! All three are SQLite-backed (WAL mode). The winner computation runs
//! inside the same transaction that inserts an action, so `FileState` is
//! never observable out of step with `ActionLog`.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod action_log;
mod db;
mod digest;
mod error;
mod file_state;
mod sync_log;

pub use action_log::{ActionLog, LoggedAction, PublishedAction};
pub use digest::state_digest;
pub use error::LogError;
pub use file_state::{FileEvent, FileItem, FileState};
pub use sync_log::SyncLog;
