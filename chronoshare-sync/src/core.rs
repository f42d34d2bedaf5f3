//! The reconciliation protocol over the state digest.
//!
//! Every node keeps one long-lived sync interest outstanding, named by its
//! current root digest. Peers holding the same digest hold the interest
//! (steady state). A peer whose state moved on answers with the delta that
//! turns the named digest into its own; a peer that has never seen the
//! digest schedules a randomized-wait recovery exchange to obtain the full
//! vector. Digests are deterministic, so repeated delivery of any of these
//! messages is harmless.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;

use chronoshare_log::SyncLog;
use chronoshare_types::{DataObject, DeviceStatus, Hash, Name, SyncStateMsg};

use crate::face::InterestHandler;
use crate::scheduler::Scheduler;
use crate::{Face, FaceError, SyncError};

/// Freshness (seconds) on served sync and recovery data.
pub const SYNC_FRESHNESS: u32 = 2;

/// Base wait before probing for recovery after an unknown digest.
const RECOVERY_WAIT: Duration = Duration::from_millis(50);

/// The randomized share added to the recovery wait, spreading out peers
/// that all saw the same unknown digest.
const RECOVERY_RANDOM_PERCENT: f64 = 0.5;

/// Delay used by [`SyncCore::local_state_changed_delayed`] to coalesce
/// bursts of local changes.
const LOCAL_STATE_DELAY: Duration = Duration::from_millis(200);

/// Called for each peer device found to be ahead of the local state:
/// `(device, first_missing_seq, last_missing_seq)`.
pub type MissingRangeCallback = Arc<dyn Fn(Name, u64, u64) + Send + Sync>;

/// The sync protocol engine for one collection.
pub struct SyncCore {
    face: Arc<dyn Face>,
    log: Arc<SyncLog>,
    scheduler: Arc<Scheduler>,
    sync_prefix: Name,
    interest_lifetime: Duration,
    root: Mutex<Hash>,
    root_tx: watch::Sender<Hash>,
    on_missing: MissingRangeCallback,
}

impl SyncCore {
    /// Create the core. Call [`SyncCore::start`] to register the sync
    /// prefix and begin expressing interests.
    pub async fn new(
        face: Arc<dyn Face>,
        log: Arc<SyncLog>,
        scheduler: Arc<Scheduler>,
        sync_prefix: Name,
        interest_lifetime: Duration,
        on_missing: MissingRangeCallback,
    ) -> Result<Arc<Self>, SyncError> {
        let root = log.root_digest().await?;
        let (root_tx, _) = watch::channel(root);
        Ok(Arc::new(Self {
            face,
            log,
            scheduler,
            sync_prefix,
            interest_lifetime,
            root: Mutex::new(root),
            root_tx,
            on_missing,
        }))
    }

    /// Register the sync prefix and start the sync-interest loop.
    pub async fn start(self: Arc<Self>) -> Result<(), SyncError> {
        let weak = Arc::downgrade(&self);
        let handler: InterestHandler = Arc::new(move |name| {
            if let Some(core) = weak.upgrade() {
                tokio::spawn(async move {
                    core.handle_interest(name).await;
                });
            }
        });
        self.face.register_prefix(&self.sync_prefix, handler).await?;

        let weak = Arc::downgrade(&self);
        let root_rx = self.root_tx.subscribe();
        tokio::spawn(run_interest_loop(weak, root_rx));
        Ok(())
    }

    /// The current root digest.
    pub fn root(&self) -> Hash {
        *self.root.lock().unwrap()
    }

    /// Record a new latest sequence for the local device and publish the
    /// resulting state change.
    pub async fn update_local_state(&self, seq: u64) -> Result<(), SyncError> {
        self.log
            .update_device_seq(&self.log.local_name().clone(), seq, DeviceStatus::Update)
            .await?;
        self.local_state_changed().await
    }

    /// Re-hash, answer the held steady-state interest with the delta, and
    /// advertise the new digest.
    pub async fn local_state_changed(&self) -> Result<(), SyncError> {
        let new_root = self.log.root_digest().await?;
        let old_root = {
            let mut root = self.root.lock().unwrap();
            std::mem::replace(&mut *root, new_root)
        };
        if old_root == new_root {
            return Ok(());
        }

        // Whoever is holding a sync interest for our previous digest gets
        // the delta, before the new digest goes out.
        let diff = self.log.find_state_diff(&old_root).await?;
        if !diff.is_empty() {
            let data = DataObject::with_freshness(
                self.sync_data_name(&old_root),
                diff.to_bytes()?,
                SYNC_FRESHNESS,
            );
            self.face.put(data).await?;
        }

        tracing::debug!("root digest {:?} -> {:?}", old_root, new_root);
        let _ = self.root_tx.send(new_root);
        Ok(())
    }

    /// Like [`SyncCore::local_state_changed`], but coalesces bursts: many
    /// calls within the delay produce a single publication.
    pub fn local_state_changed_delayed(self: Arc<Self>) {
        let core = Arc::clone(&self);
        self.scheduler
            .schedule("local-state-changed", LOCAL_STATE_DELAY, async move {
                if let Err(e) = core.local_state_changed().await {
                    tracing::warn!("delayed state publication failed: {}", e);
                }
            });
    }

    /// Apply a received state vector (delta or full): every device ahead
    /// of our record is reported through the missing-range callback.
    pub async fn handle_state_msg(&self, msg: &SyncStateMsg) -> Result<(), SyncError> {
        for entry in &msg.states {
            if &entry.device == self.log.local_name() {
                continue;
            }
            match entry.status {
                DeviceStatus::Update => {
                    let local = self.log.seq(&entry.device).await?;
                    let start = match local {
                        None => 0,
                        Some(have) if entry.seq > have => have + 1,
                        Some(_) => continue,
                    };
                    tracing::debug!(
                        "{} is ahead: missing [{}..{}]",
                        entry.device,
                        start,
                        entry.seq
                    );
                    (self.on_missing)(entry.device.clone(), start, entry.seq);
                }
                DeviceStatus::Delete => {
                    self.log
                        .update_device_seq(&entry.device, entry.seq, DeviceStatus::Delete)
                        .await?;
                    self.local_state_changed().await?;
                }
            }
        }
        Ok(())
    }

    async fn handle_interest(self: Arc<Self>, name: Name) {
        if !self.sync_prefix.is_prefix_of(&name) {
            return;
        }
        let rest = name.sub_name(self.sync_prefix.len(), name.len() - self.sync_prefix.len());

        let outcome = match rest.len() {
            1 => match parse_digest(&rest, 0) {
                Some(digest) => Arc::clone(&self).handle_sync_interest(&name, &digest).await,
                None => {
                    tracing::debug!("unparseable sync interest {}, dropping", name);
                    Ok(())
                }
            },
            2 if rest.component(0).and_then(|c| c.as_str()) == Some("recovery") => {
                match parse_digest(&rest, 1) {
                    Some(digest) => self.handle_recovery_interest(&name, &digest).await,
                    None => {
                        tracing::debug!("unparseable recovery interest {}, dropping", name);
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        };

        if let Err(e) = outcome {
            tracing::warn!("interest {} failed: {}", name, e);
        }
    }

    async fn handle_sync_interest(
        self: Arc<Self>,
        name: &Name,
        digest: &Hash,
    ) -> Result<(), SyncError> {
        let current = self.root();
        if *digest == current {
            // Steady state: hold the interest until our state moves.
            tracing::trace!("holding sync interest for current digest");
            return Ok(());
        }

        if self.log.knows_digest(digest).await? {
            let diff = self.log.find_state_diff(digest).await?;
            let data =
                DataObject::with_freshness(name.clone(), diff.to_bytes()?, SYNC_FRESHNESS);
            self.face.put(data).await?;
            return Ok(());
        }

        // Unknown digest: the sender is on a state we cannot diff against.
        // Probe for recovery after a randomized wait so that a crowd of
        // confused peers does not stampede.
        let digest = *digest;
        let captured_root = current;
        let core = Arc::clone(&self);
        self.scheduler.schedule(
            &format!("recovery-{}", digest),
            recovery_wait(),
            async move {
                core.recover(digest, captured_root).await;
            },
        );
        Ok(())
    }

    async fn recover(self: Arc<Self>, digest: Hash, root_at_schedule: Hash) {
        // Coalesced: our state moved, or the digest resolved meanwhile.
        if self.root() != root_at_schedule {
            return;
        }
        if matches!(self.log.knows_digest(&digest).await, Ok(true)) {
            return;
        }

        let name = self
            .sync_prefix
            .clone()
            .append("recovery")
            .append(&digest.to_string());
        tracing::debug!("sending recovery interest {}", name);
        match self.face.express_interest(&name, self.interest_lifetime).await {
            Ok(data) => {
                if let Err(e) = self.handle_sync_data(&data).await {
                    tracing::warn!("bad recovery data: {}", e);
                }
            }
            Err(e) => tracing::debug!("recovery for {:?} unanswered: {}", digest, e),
        }
    }

    async fn handle_recovery_interest(
        &self,
        name: &Name,
        digest: &Hash,
    ) -> Result<(), SyncError> {
        let known = *digest == self.root() || self.log.knows_digest(digest).await?;
        if !known {
            // Not our place to answer.
            return Ok(());
        }
        let state = self.log.state().await?;
        let data = DataObject::with_freshness(name.clone(), state.to_bytes()?, SYNC_FRESHNESS);
        self.face.put(data).await?;
        Ok(())
    }

    async fn handle_sync_data(&self, data: &DataObject) -> Result<(), SyncError> {
        let msg = SyncStateMsg::from_bytes(&data.content)?;
        self.handle_state_msg(&msg).await
    }

    fn sync_data_name(&self, digest: &Hash) -> Name {
        self.sync_prefix.clone().append(&digest.to_string())
    }
}

impl std::fmt::Debug for SyncCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCore")
            .field("sync_prefix", &self.sync_prefix)
            .field("root", &self.root())
            .finish()
    }
}

/// Keep one sync interest outstanding, re-expressing on timeout and
/// whenever the local digest advances.
async fn run_interest_loop(weak: Weak<SyncCore>, mut root_rx: watch::Receiver<Hash>) {
    loop {
        let Some(core) = weak.upgrade() else { break };
        let root = *root_rx.borrow_and_update();
        let name = core.sync_data_name(&root);
        let lifetime = core.interest_lifetime;
        let face = Arc::clone(&core.face);
        drop(core);

        tokio::select! {
            result = face.express_interest(&name, lifetime) => {
                match result {
                    Ok(data) => {
                        let Some(core) = weak.upgrade() else { break };
                        if let Err(e) = core.handle_sync_data(&data).await {
                            tracing::warn!("bad sync data: {}", e);
                        }
                        drop(core);
                        // The answering data stays fresh briefly; wait for
                        // our own digest to move rather than re-reading it.
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                            _ = root_rx.changed() => {}
                        }
                    }
                    Err(FaceError::Timeout(_)) => {
                        // No change anywhere; express again.
                    }
                    Err(_) => break,
                }
            }
            changed = root_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

fn parse_digest(rest: &Name, index: usize) -> Option<Hash> {
    rest.component(index)
        .and_then(|c| c.as_str())
        .and_then(|s| Hash::from_hex(s).ok())
}

/// `WAIT × (1 + uniform[0, RANDOM_PERCENT))`.
fn recovery_wait() -> Duration {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    let unit = (u64::from_le_bytes(bytes) % 1000) as f64 / 1000.0;
    let millis = RECOVERY_WAIT.as_millis() as f64 * (1.0 + unit * RECOVERY_RANDOM_PERCENT);
    Duration::from_millis(millis as u64)
}
