//! Serving stored actions and file segments to peers.
//!
//! The content server answers interests under the local device prefix and
//! under any registered forwarding hints. Stored objects are served
//! byte-identical; when an interest arrives through a hint, the stored
//! object is re-published wrapped under the interest name, with the
//! configured freshness when one is set.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use chronoshare_content::{DbCache, ObjectDb};
use chronoshare_log::ActionLog;
use chronoshare_types::{DataObject, Hash, Name};

use crate::face::InterestHandler;
use crate::{Face, SyncError};

/// Answers `<device>/<app>/action/<folder>/<seq>` and
/// `<device>/<app>/file/<hash>/<segment>` interests out of the action log
/// and the object sub-stores.
pub struct ContentServer {
    face: Arc<dyn Face>,
    action_log: Arc<ActionLog>,
    db_cache: Arc<DbCache>,
    app_name: String,
    shared_folder: String,
    freshness_secs: i64,
    prefixes: Mutex<HashSet<Name>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl ContentServer {
    /// Create the server and start the periodic sub-store eviction pass.
    ///
    /// `freshness_secs` applies to data re-published through a forwarding
    /// hint; a non-positive value disables it.
    pub fn new(
        face: Arc<dyn Face>,
        action_log: Arc<ActionLog>,
        db_cache: Arc<DbCache>,
        app_name: &str,
        shared_folder: &str,
        freshness_secs: i64,
    ) -> Arc<Self> {
        let flush_task = Arc::clone(&db_cache).spawn_flush_task();
        Arc::new(Self {
            face,
            action_log,
            db_cache,
            app_name: app_name.to_string(),
            shared_folder: shared_folder.to_string(),
            freshness_secs,
            prefixes: Mutex::new(HashSet::new()),
            flush_task: Mutex::new(Some(flush_task)),
        })
    }

    /// Start answering interests under `prefix` - the local device name,
    /// or a forwarding hint through which peers reach us.
    pub async fn register_prefix(self: Arc<Self>, prefix: &Name) -> Result<(), SyncError> {
        tracing::debug!(">> content server: register {}", prefix);
        let weak = Arc::downgrade(&self);
        let registered = prefix.clone();
        let handler: InterestHandler = Arc::new(move |interest| {
            if let Some(server) = weak.upgrade() {
                let registered = registered.clone();
                tokio::spawn(async move {
                    server.serve(registered, interest).await;
                });
            }
        });
        self.face.register_prefix(prefix, handler).await?;
        self.prefixes.lock().unwrap().insert(prefix.clone());
        Ok(())
    }

    /// Stop answering interests under `prefix`.
    pub async fn deregister_prefix(&self, prefix: &Name) -> Result<(), SyncError> {
        tracing::debug!("<< content server: deregister {}", prefix);
        self.face.unregister_prefix(prefix).await?;
        self.prefixes.lock().unwrap().remove(prefix);
        Ok(())
    }

    /// Deregister everything and stop the eviction pass.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let prefixes: Vec<Name> = self.prefixes.lock().unwrap().drain().collect();
        for prefix in prefixes {
            self.face.unregister_prefix(&prefix).await?;
        }
        if let Some(task) = self.flush_task.lock().unwrap().take() {
            task.abort();
        }
        Ok(())
    }

    async fn serve(self: Arc<Self>, registered: Name, interest: Name) {
        // The interest may be the canonical name itself (registered local
        // prefix) or carry the registered prefix as a forwarding hint.
        // Try plain first, then stripped.
        if self.try_serve(&interest, &interest, false).await {
            return;
        }
        if !registered.is_empty() && registered.is_prefix_of(&interest) {
            let stripped =
                interest.sub_name(registered.len(), interest.len() - registered.len());
            self.try_serve(&stripped, &interest, true).await;
        }
    }

    /// Serve `name` (canonical form), publishing under `interest`.
    /// Returns whether data was published.
    async fn try_serve(&self, name: &Name, interest: &Name, hinted: bool) -> bool {
        if name.len() < 5 {
            return false;
        }
        let app = name.component_from_back(3).and_then(|c| c.as_str());
        if app != Some(self.app_name.as_str()) {
            return false;
        }

        let outcome = match name.component_from_back(2).and_then(|c| c.as_str()) {
            Some("action") => self.serve_action(name, interest, hinted).await,
            Some("file") => self.serve_file(name, interest, hinted).await,
            _ => Ok(false),
        };
        match outcome {
            Ok(served) => served,
            Err(e) => {
                tracing::warn!("failed serving {}: {}", interest, e);
                false
            }
        }
    }

    async fn serve_action(
        &self,
        name: &Name,
        interest: &Name,
        hinted: bool,
    ) -> Result<bool, SyncError> {
        let folder = name.component_from_back(1).and_then(|c| c.as_str());
        if folder != Some(self.shared_folder.as_str()) {
            return Ok(false);
        }
        let seq = match name.component_from_back(0).and_then(|c| c.as_number()) {
            Some(seq) => seq,
            None => return Ok(false),
        };
        let device = name.sub_name(0, name.len() - 4);

        match self.action_log.lookup_action_data(&device, seq).await? {
            Some(data) => {
                tracing::debug!("serving action {} (hinted: {})", interest, hinted);
                self.publish(data, interest, hinted).await?;
                Ok(true)
            }
            None => {
                tracing::debug!("no action for {} seq {}", device, seq);
                Ok(false)
            }
        }
    }

    async fn serve_file(
        &self,
        name: &Name,
        interest: &Name,
        hinted: bool,
    ) -> Result<bool, SyncError> {
        let hash = match name
            .component_from_back(1)
            .and_then(|c| Hash::from_bytes(c.as_bytes()))
        {
            Some(hash) => hash,
            None => return Ok(false),
        };
        let segment = match name.component_from_back(0).and_then(|c| c.as_number()) {
            Some(segment) => segment,
            None => return Ok(false),
        };
        let device = name.sub_name(0, name.len() - 4);

        // Don't let a lookup for content we never had create an empty
        // sub-store on disk.
        if !self.db_cache.contains(&hash)
            && !ObjectDb::exists(self.db_cache.db_root(), &device, &hash).await?
        {
            tracing::debug!("no object store for {:?}", hash);
            return Ok(false);
        }

        let db = self.db_cache.get_or_open(&hash).await?;
        match db.fetch_segment(&device, segment).await? {
            Some(data) => {
                tracing::debug!("serving segment {} of {:?}", segment, hash);
                self.publish(data, interest, hinted).await?;
                Ok(true)
            }
            None => {
                tracing::debug!("store for {:?} has no segment {}", hash, segment);
                Ok(false)
            }
        }
    }

    /// Publish a stored object: verbatim when the interest named it
    /// directly, wrapped under the interest name when it came through a
    /// forwarding hint.
    async fn publish(
        &self,
        stored: DataObject,
        interest: &Name,
        hinted: bool,
    ) -> Result<(), SyncError> {
        let data = if hinted {
            let wrapped = stored.to_bytes()?;
            if self.freshness_secs > 0 {
                DataObject::with_freshness(interest.clone(), wrapped, self.freshness_secs as u32)
            } else {
                DataObject::new(interest.clone(), wrapped)
            }
        } else {
            stored
        };
        self.face.put(data).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ContentServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentServer")
            .field("app_name", &self.app_name)
            .field("shared_folder", &self.shared_folder)
            .finish()
    }
}
