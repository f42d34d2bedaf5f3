//! # chronoshare-sync
//!
//! The distributed half of ChronoShare: the digest-driven sync protocol,
//! the pipelined fetch machinery, and the serving side.
//!
//! - [`Face`] - the named-data transport seam, with [`MemoryFace`] /
//!   [`FaceHub`] as the in-process implementation used in tests
//! - [`Scheduler`] - tag-coalescing delayed and periodic tasks
//! - [`SyncCore`] - the digest exchange: steady-state held interests,
//!   deltas out of the state log, randomized-wait recovery
//! - [`Fetcher`] / [`FetchManager`] - windowed retrieval of action and
//!   segment ranges with timeouts, forwarding-hint failover, retry
//!   backoff, and a global in-flight budget
//! - [`ContentServer`] - answers action and file-segment interests out of
//!   the journals, re-wrapping under forwarding hints
//! - [`Dispatcher`] - wires everything over one shared folder
//! - [`Config`] - TOML node configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod core;
mod dispatcher;
mod error;
mod face;
mod fetch_manager;
mod fetcher;
mod scheduler;
mod server;

pub use config::{
    CacheConfig, Config, ConfigError, FetchConfig, ServeConfig, SyncConfig,
};
pub use core::{MissingRangeCallback, SyncCore, SYNC_FRESHNESS};
pub use dispatcher::Dispatcher;
pub use error::{FaceError, FetchError, SyncError};
pub use face::{Face, FaceHub, InterestHandler, MemoryFace};
pub use fetch_manager::{FetchEvent, FetchJob, FetchManager};
pub use fetcher::{FetchOptions, Fetcher, SegmentSink};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use server::ContentServer;
