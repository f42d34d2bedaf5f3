//! # chronoshare-content
//!
//! The segmented, content-hash-addressed store of file bodies.
//!
//! Each file's content lives in its own sub-store ([`ObjectDb`]), a small
//! SQLite file keyed by the content hash and grouped on disk by the first
//! two hex digits of that hash. [`ObjectStore`] slices local files into
//! signed ≤1024-byte segment objects and reassembles fetched segments back
//! into files. [`DbCache`] keeps recently used sub-stores open, evicting
//! ones idle past a configurable lifetime.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
mod error;
mod object_db;
mod store;

pub use cache::{DbCache, DEFAULT_LIFETIME};
pub use error::ContentError;
pub use object_db::ObjectDb;
pub use store::{ObjectStore, MAX_SEGMENT_SIZE};
