//! Cache of open segment sub-stores, evicted by idle time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chronoshare_types::Hash;
use tokio::time::interval;

use crate::{ContentError, ObjectDb};

/// Default lifetime before an idle sub-store is closed.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(60);

/// Keeps recently used [`ObjectDb`] handles open, keyed by content hash.
///
/// Shared between the serving path and the fetch path, so the inner map is
/// mutex-guarded; hold times are bounded to map operations (stores are
/// opened outside the lock).
pub struct DbCache {
    db_root: PathBuf,
    lifetime: Duration,
    stores: Mutex<HashMap<Hash, Arc<ObjectDb>>>,
}

impl DbCache {
    /// Create a cache over sub-stores rooted at `db_root`.
    pub fn new(db_root: &Path, lifetime: Duration) -> Self {
        Self {
            db_root: db_root.to_path_buf(),
            lifetime,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// The directory the sub-stores live under.
    pub fn db_root(&self) -> &Path {
        &self.db_root
    }

    /// Get the cached sub-store for `hash`, opening it on a miss.
    pub async fn get_or_open(&self, hash: &Hash) -> Result<Arc<ObjectDb>, ContentError> {
        if let Ok(stores) = self.stores.lock() {
            if let Some(db) = stores.get(hash) {
                return Ok(Arc::clone(db));
            }
        }

        let db = Arc::new(ObjectDb::open(&self.db_root, hash).await?);
        if let Ok(mut stores) = self.stores.lock() {
            // A concurrent open may have raced us; keep one handle either way.
            stores.insert(*hash, Arc::clone(&db));
        }
        Ok(db)
    }

    /// Whether a sub-store for `hash` is currently cached.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.stores
            .lock()
            .map(|s| s.contains_key(hash))
            .unwrap_or(false)
    }

    /// Number of cached sub-stores.
    pub fn len(&self) -> usize {
        self.stores.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every sub-store idle longer than the configured lifetime.
    /// Returns how many were evicted.
    pub fn flush_stale(&self) -> usize {
        let mut evicted = 0;
        if let Ok(mut stores) = self.stores.lock() {
            stores.retain(|_, db| {
                let stale = db.idle_for() >= self.lifetime;
                if stale {
                    evicted += 1;
                }
                !stale
            });
        }
        evicted
    }

    /// Spawn the periodic eviction pass.
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_flush_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut timer = interval(cache.lifetime);
            loop {
                timer.tick().await;
                let evicted = cache.flush_stale();
                if evicted > 0 {
                    tracing::debug!("flushed {} stale object stores", evicted);
                }
            }
        })
    }
}

impl std::fmt::Debug for DbCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCache")
            .field("db_root", &self.db_root)
            .field("lifetime", &self.lifetime)
            .field("len", &self.len())
            .finish()
    }
}
