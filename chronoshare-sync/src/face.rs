//! Transport abstraction over the named-data substrate.
//!
//! A [`Face`] expresses interests (each satisfied by exactly one data
//! object whose name the interest is a prefix of), publishes data, and
//! registers prefix handlers that are invoked for unsatisfied interests.
//!
//! [`MemoryFace`] is the in-process implementation used by tests: every
//! face attached to one [`FaceHub`] sees the others' published data and
//! registered prefixes, which is enough to run multi-device sync
//! scenarios without a network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use chronoshare_types::{DataObject, Name};

use crate::FaceError;

/// Invoked for each unsatisfied interest under a registered prefix.
///
/// Handlers run on the transport path, so they must be cheap; real work is
/// spawned onto the executor.
pub type InterestHandler = Arc<dyn Fn(Name) + Send + Sync>;

/// A handle onto the named-data substrate.
#[async_trait]
pub trait Face: Send + Sync {
    /// Request the data object for `name`, waiting at most `lifetime`.
    async fn express_interest(&self, name: &Name, lifetime: Duration)
        -> Result<DataObject, FaceError>;

    /// Publish a data object, satisfying any pending matching interests.
    async fn put(&self, data: DataObject) -> Result<(), FaceError>;

    /// Register a handler for interests under `prefix`.
    async fn register_prefix(&self, prefix: &Name, handler: InterestHandler)
        -> Result<(), FaceError>;

    /// Remove every handler registered under `prefix`.
    async fn unregister_prefix(&self, prefix: &Name) -> Result<(), FaceError>;
}

struct StoredData {
    data: DataObject,
    expires: Option<Instant>,
}

#[derive(Default)]
struct HubInner {
    content_store: HashMap<Name, StoredData>,
    pending: HashMap<u64, (Name, oneshot::Sender<DataObject>)>,
    handlers: Vec<(Name, InterestHandler)>,
    next_pending_id: u64,
}

/// The shared in-process substrate connecting [`MemoryFace`]s.
#[derive(Clone, Default)]
pub struct FaceHub {
    inner: Arc<Mutex<HubInner>>,
}

impl FaceHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a face attached to this hub.
    pub fn face(&self) -> MemoryFace {
        MemoryFace { hub: self.clone() }
    }

    /// Number of interests currently held unsatisfied.
    pub fn pending_interests(&self) -> usize {
        self.inner.lock().map(|i| i.pending.len()).unwrap_or(0)
    }

    /// Number of data objects in the content store.
    pub fn stored_objects(&self) -> usize {
        self.inner.lock().map(|i| i.content_store.len()).unwrap_or(0)
    }

    fn lookup_stored(&self, name: &Name) -> Option<DataObject> {
        let mut inner = self.inner.lock().ok()?;
        let now = Instant::now();
        inner
            .content_store
            .retain(|_, stored| stored.expires.map_or(true, |e| e > now));
        inner
            .content_store
            .iter()
            .find(|(stored_name, _)| name.is_prefix_of(stored_name))
            .map(|(_, stored)| stored.data.clone())
    }
}

/// An in-process face. Clones share the hub, mirroring how every handle
/// onto one transport daemon sees the same state.
#[derive(Clone)]
pub struct MemoryFace {
    hub: FaceHub,
}

impl MemoryFace {
    /// The hub this face is attached to.
    pub fn hub(&self) -> &FaceHub {
        &self.hub
    }
}

#[async_trait]
impl Face for MemoryFace {
    async fn express_interest(
        &self,
        name: &Name,
        lifetime: Duration,
    ) -> Result<DataObject, FaceError> {
        // Content store first.
        if let Some(data) = self.hub.lookup_stored(name) {
            return Ok(data);
        }

        // Hold the interest, then poke every matching prefix handler.
        let (tx, rx) = oneshot::channel();
        let (id, handlers) = {
            let mut inner = self.hub.inner.lock().map_err(|_| FaceError::Closed)?;
            let id = inner.next_pending_id;
            inner.next_pending_id += 1;
            inner.pending.insert(id, (name.clone(), tx));
            let handlers: Vec<InterestHandler> = inner
                .handlers
                .iter()
                .filter(|(prefix, _)| prefix.is_prefix_of(name))
                .map(|(_, h)| Arc::clone(h))
                .collect();
            (id, handlers)
        };
        for handler in handlers {
            handler(name.clone());
        }

        match tokio::time::timeout(lifetime, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(FaceError::Closed),
            Err(_) => {
                if let Ok(mut inner) = self.hub.inner.lock() {
                    inner.pending.remove(&id);
                }
                Err(FaceError::Timeout(name.clone()))
            }
        }
    }

    async fn put(&self, data: DataObject) -> Result<(), FaceError> {
        let mut inner = self.hub.inner.lock().map_err(|_| FaceError::Closed)?;

        // Satisfy every pending interest the name matches.
        let satisfied: Vec<u64> = inner
            .pending
            .iter()
            .filter(|(_, (interest, _))| interest.is_prefix_of(&data.name))
            .map(|(&id, _)| id)
            .collect();
        for id in satisfied {
            if let Some((_, tx)) = inner.pending.remove(&id) {
                let _ = tx.send(data.clone());
            }
        }

        let expires = data
            .freshness_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs as u64));
        inner
            .content_store
            .insert(data.name.clone(), StoredData { data, expires });
        Ok(())
    }

    async fn register_prefix(
        &self,
        prefix: &Name,
        handler: InterestHandler,
    ) -> Result<(), FaceError> {
        let mut inner = self.hub.inner.lock().map_err(|_| FaceError::Closed)?;
        inner.handlers.push((prefix.clone(), handler));
        Ok(())
    }

    async fn unregister_prefix(&self, prefix: &Name) -> Result<(), FaceError> {
        let mut inner = self.hub.inner.lock().map_err(|_| FaceError::Closed)?;
        inner.handlers.retain(|(p, _)| p != prefix);
        Ok(())
    }
}
