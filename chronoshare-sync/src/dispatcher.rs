//! Wiring of the journals, the sync core, the fetch pipeline, and the
//! content server into one synchronized folder.
//!
//! The flow through here is the whole system: a local file change becomes
//! segments plus a published action and a new root digest; a peer's delta
//! becomes an action fetch, whose update actions become segment fetches,
//! whose completion assembles files back into the folder.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use chronoshare_content::{DbCache, ObjectStore};
use chronoshare_log::{ActionLog, FileEvent, FileState, PublishedAction, SyncLog};
use chronoshare_types::{ActionKind, DataObject, DeviceStatus, Hash, Name};

use crate::core::{MissingRangeCallback, SyncCore};
use crate::fetch_manager::{FetchEvent, FetchJob, FetchManager};
use crate::fetcher::SegmentSink;
use crate::scheduler::Scheduler;
use crate::server::ContentServer;
use crate::{Config, Face, FetchError, SyncError};

/// One running ChronoShare node: a shared folder kept in sync through a
/// face.
pub struct Dispatcher {
    config: Config,
    root_dir: PathBuf,
    local_name: Name,
    sync_log: Arc<SyncLog>,
    action_log: Arc<ActionLog>,
    object_store: Arc<ObjectStore>,
    core: Arc<SyncCore>,
    content_server: Arc<ContentServer>,
    fetch_manager: Arc<FetchManager>,
    pending_files: Arc<Mutex<HashSet<Hash>>>,
    fetch_events: Mutex<Option<UnboundedReceiver<FetchEvent>>>,
    file_events: Mutex<Option<UnboundedReceiver<FileEvent>>>,
    app_events: Option<UnboundedSender<FileEvent>>,
}

impl Dispatcher {
    /// Build a node over `root_dir` (the shared folder). `app_events`,
    /// when present, receives the file-changed/file-removed
    /// notifications; no errors ever cross that channel.
    pub async fn new(
        root_dir: &Path,
        config: Config,
        face: Arc<dyn Face>,
        app_events: Option<UnboundedSender<FileEvent>>,
    ) -> Result<Arc<Self>, SyncError> {
        config.validate()?;
        let local_name = config.parsed_user_name()?;

        let sync_log = Arc::new(SyncLog::open(root_dir, local_name.clone()).await?);

        let (file_tx, file_rx) = mpsc::unbounded_channel();
        let action_log = Arc::new(
            ActionLog::open(
                root_dir,
                Arc::clone(&sync_log),
                &config.folder,
                &config.app_name,
                Some(file_tx),
            )
            .await?,
        );

        let object_store = Arc::new(ObjectStore::new(root_dir, &config.app_name).await?);
        let db_cache = Arc::new(DbCache::new(object_store.db_root(), config.cache_lifetime()));
        let scheduler = Arc::new(Scheduler::new());

        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let fetch_manager = FetchManager::new(
            Arc::clone(&face),
            Arc::clone(&scheduler),
            config.fetch_options(),
            Some(fetch_tx),
        );

        let pending_files = Arc::new(Mutex::new(HashSet::new()));
        let action_sink: Arc<dyn SegmentSink> = Arc::new(ActionSink {
            action_log: Arc::clone(&action_log),
            object_store: Arc::clone(&object_store),
            db_cache: Arc::clone(&db_cache),
            fetch_manager: Arc::clone(&fetch_manager),
            app_name: config.app_name.clone(),
            pending_files: Arc::clone(&pending_files),
        });

        let on_missing: MissingRangeCallback = {
            let manager = Arc::clone(&fetch_manager);
            let app_name = config.app_name.clone();
            let folder = config.folder.clone();
            Arc::new(move |device, from, to| {
                let base = device
                    .clone()
                    .append(&app_name)
                    .append("action")
                    .append(&folder);
                Arc::clone(&manager).enqueue(FetchJob {
                    base_name: base,
                    min_seq: from,
                    max_seq: to,
                    sink: Arc::clone(&action_sink),
                });
            })
        };

        let core = SyncCore::new(
            Arc::clone(&face),
            Arc::clone(&sync_log),
            Arc::clone(&scheduler),
            config.sync_prefix(),
            config.interest_lifetime(),
            on_missing,
        )
        .await?;

        let content_server = ContentServer::new(
            Arc::clone(&face),
            Arc::clone(&action_log),
            db_cache,
            &config.app_name,
            &config.folder,
            config.serve.freshness_secs,
        );

        Ok(Arc::new(Self {
            config,
            root_dir: root_dir.to_path_buf(),
            local_name,
            sync_log,
            action_log,
            object_store,
            core,
            content_server,
            fetch_manager,
            pending_files,
            fetch_events: Mutex::new(Some(fetch_rx)),
            file_events: Mutex::new(Some(file_rx)),
            app_events,
        }))
    }

    /// Register prefixes, start the sync exchange, and spawn the event
    /// pumps.
    pub async fn start(self: Arc<Self>) -> Result<(), SyncError> {
        Arc::clone(&self.content_server)
            .register_prefix(&self.local_name)
            .await?;
        if let Some(hint) = self.config.parsed_local_prefix() {
            if hint != self.local_name {
                Arc::clone(&self.content_server).register_prefix(&hint).await?;
                self.fetch_manager.set_forwarding_hint(Some(hint));
            }
        }
        Arc::clone(&self.core).start().await?;

        if let Some(rx) = self.fetch_events.lock().unwrap().take() {
            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                dispatcher.run_fetch_events(rx).await;
            });
        }
        if let Some(rx) = self.file_events.lock().unwrap().take() {
            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                dispatcher.run_file_events(rx).await;
            });
        }
        Ok(())
    }

    /// Record a created or modified file (path relative to the shared
    /// folder) and publish the resulting action.
    pub async fn local_file_changed(&self, filename: &str) -> Result<PublishedAction, SyncError> {
        let path = self.root_dir.join(filename);
        let (hash, seg_num) = self
            .object_store
            .segment_file(&path, &self.local_name)
            .await?;

        let metadata = tokio::fs::metadata(&path).await?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mode = file_mode(&metadata);

        let published = self
            .action_log
            .add_local_update(filename, hash, mtime, mode, seg_num)
            .await?;
        self.core.update_local_state(published.seq).await?;
        Ok(published)
    }

    /// Record a deleted file and publish the resulting action. A no-op
    /// for unknown or already-deleted files.
    pub async fn local_file_deleted(
        &self,
        filename: &str,
    ) -> Result<Option<PublishedAction>, SyncError> {
        let published = self.action_log.add_local_delete(filename).await?;
        if let Some(published) = &published {
            self.core.update_local_state(published.seq).await?;
        }
        Ok(published)
    }

    /// The device name this node publishes under.
    pub fn local_name(&self) -> &Name {
        &self.local_name
    }

    /// The action journal.
    pub fn action_log(&self) -> &Arc<ActionLog> {
        &self.action_log
    }

    /// The current-winner view of the folder.
    pub fn file_state(&self) -> FileState {
        self.action_log.file_state()
    }

    /// The sync protocol engine.
    pub fn core(&self) -> &Arc<SyncCore> {
        &self.core
    }

    /// Fetched ranges completing drive the state machine forward: a
    /// finished action range advances the peer's SyncState entry, a
    /// finished segment range assembles the file(s) carrying that hash.
    async fn run_fetch_events(self: Arc<Self>, mut rx: UnboundedReceiver<FetchEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                FetchEvent::Complete {
                    base_name,
                    max_seq,
                    ..
                } => {
                    let kind = base_name.component_from_back(1).and_then(|c| c.as_str());
                    let outcome = match kind {
                        Some("action") => self.finish_action_fetch(&base_name, max_seq).await,
                        Some("file") => self.finish_file_fetch(&base_name).await,
                        _ => Ok(()),
                    };
                    if let Err(e) = outcome {
                        tracing::warn!("post-fetch handling for {} failed: {}", base_name, e);
                    }
                }
                FetchEvent::Failed {
                    base_name,
                    attempts,
                } => {
                    tracing::error!("giving up on {} after {} attempts", base_name, attempts);
                    if let Some(hash) = file_base_hash(&base_name) {
                        self.pending_files.lock().unwrap().remove(&hash);
                    }
                }
            }
        }
    }

    async fn finish_action_fetch(&self, base_name: &Name, max_seq: u64) -> Result<(), SyncError> {
        // <device>/<app>/action/<folder>
        let device = base_name.sub_name(0, base_name.len() - 3);
        let have = self.sync_log.seq(&device).await?;
        if have.map_or(true, |have| max_seq > have) {
            self.sync_log
                .update_device_seq(&device, max_seq, DeviceStatus::Update)
                .await?;
            self.core.local_state_changed().await?;
        }
        Ok(())
    }

    async fn finish_file_fetch(&self, base_name: &Name) -> Result<(), SyncError> {
        // <device>/<app>/file/<hash>
        let Some(hash) = file_base_hash(base_name) else {
            return Ok(());
        };
        let device = base_name.sub_name(0, base_name.len() - 3);
        self.pending_files.lock().unwrap().remove(&hash);

        for file in self.file_state().files_for_hash(&hash).await? {
            let out = self.root_dir.join(&file.filename);
            if self.object_store.assemble_file(&device, &hash, &out).await? {
                tracing::info!("materialized {} ({:?})", file.filename, hash);
            }
        }
        Ok(())
    }

    /// Winner changes flow to the filesystem (removals) and on to the
    /// application.
    async fn run_file_events(self: Arc<Self>, mut rx: UnboundedReceiver<FileEvent>) {
        while let Some(event) = rx.recv().await {
            if let FileEvent::Removed(filename) = &event {
                let path = self.root_dir.join(filename);
                if tokio::fs::remove_file(&path).await.is_ok() {
                    tracing::info!("removed {}", filename);
                }
            }
            if let Some(app) = &self.app_events {
                let _ = app.send(event);
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("local_name", &self.local_name)
            .field("root_dir", &self.root_dir)
            .finish()
    }
}

/// Applies fetched action objects and queues segment fetches for updates
/// whose content is not yet complete locally.
struct ActionSink {
    action_log: Arc<ActionLog>,
    object_store: Arc<ObjectStore>,
    db_cache: Arc<DbCache>,
    fetch_manager: Arc<FetchManager>,
    app_name: String,
    pending_files: Arc<Mutex<HashSet<Hash>>>,
}

#[async_trait]
impl SegmentSink for ActionSink {
    async fn on_segment(&self, _seq: u64, data: DataObject) -> Result<(), FetchError> {
        let item = self
            .action_log
            .add_remote_action(&data)
            .await
            .map_err(|e| FetchError::Sink(e.to_string()))?;

        if item.kind != ActionKind::Update {
            return Ok(());
        }
        let (Some(hash), Some(seg_num)) = (item.file_hash, item.seg_num) else {
            return Ok(());
        };
        let device = data.name.sub_name(0, data.name.len() - 4);

        let complete = self
            .object_store
            .does_complete(&device, &hash)
            .await
            .map_err(|e| FetchError::Sink(e.to_string()))?;
        if complete || seg_num == 0 {
            return Ok(());
        }
        if !self.pending_files.lock().unwrap().insert(hash) {
            // Another action already queued this content.
            return Ok(());
        }

        tracing::debug!("queueing {} segments of {:?}", seg_num, hash);
        Arc::clone(&self.fetch_manager).enqueue(FetchJob {
            base_name: ObjectStore::file_base_name(&device, &self.app_name, &hash),
            min_seq: 0,
            max_seq: seg_num - 1,
            sink: Arc::new(FileSegmentSink {
                db_cache: Arc::clone(&self.db_cache),
                device,
                hash,
            }),
        });
        Ok(())
    }
}

/// Stores fetched file segments into the sub-store for their hash.
struct FileSegmentSink {
    db_cache: Arc<DbCache>,
    device: Name,
    hash: Hash,
}

#[async_trait]
impl SegmentSink for FileSegmentSink {
    async fn on_segment(&self, seq: u64, data: DataObject) -> Result<(), FetchError> {
        let db = self
            .db_cache
            .get_or_open(&self.hash)
            .await
            .map_err(|e| FetchError::Sink(e.to_string()))?;
        db.save_segment(&self.device, seq, &data)
            .await
            .map_err(|e| FetchError::Sink(e.to_string()))
    }
}

/// The hash component of a `<device>/<app>/file/<hash>` base name.
fn file_base_hash(base_name: &Name) -> Option<Hash> {
    Hash::from_bytes(base_name.component_from_back(0)?.as_bytes())
}

fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FaceHub;
    use std::time::Duration;

    async fn make_node(hub: &FaceHub, user: &str) -> (Arc<Dispatcher>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new("shared", user);
        config.sync.interest_interval_secs = 1;
        let dispatcher = Dispatcher::new(dir.path(), config, Arc::new(hub.face()), None)
            .await
            .unwrap();
        Arc::clone(&dispatcher).start().await.unwrap();
        (dispatcher, dir)
    }

    /// Poll `check` until it holds or ~15 s elapse.
    async fn wait_for<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..150 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn file_replicates_to_second_device() {
        let hub = FaceHub::new();
        let (alice, alice_dir) = make_node(&hub, "/alice/laptop").await;
        let (brian, brian_dir) = make_node(&hub, "/brian/laptop").await;

        let content = vec![0x5A; 3000];
        tokio::fs::write(alice_dir.path().join("a.bin"), &content)
            .await
            .unwrap();
        alice.local_file_changed("a.bin").await.unwrap();

        let expected = content.clone();
        let brian_path = brian_dir.path().join("a.bin");
        wait_for("a.bin to appear on brian", || {
            let path = brian_path.clone();
            let expected = expected.clone();
            async move {
                matches!(tokio::fs::read(&path).await, Ok(bytes) if bytes == expected)
            }
        })
        .await;

        // Brian's derived state matches alice's.
        let on_brian = brian.file_state().lookup("a.bin").await.unwrap().unwrap();
        assert_eq!(on_brian.hash, Hash::digest(&content));
        assert_eq!(on_brian.device, *alice.local_name());
        assert_eq!(on_brian.seg_num, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_propagates() {
        let hub = FaceHub::new();
        let (alice, alice_dir) = make_node(&hub, "/alice/laptop").await;
        let (brian, brian_dir) = make_node(&hub, "/brian/laptop").await;

        tokio::fs::write(alice_dir.path().join("doomed.txt"), b"bytes")
            .await
            .unwrap();
        alice.local_file_changed("doomed.txt").await.unwrap();

        let brian_state = brian.file_state();
        wait_for("doomed.txt to reach brian", || {
            let state = brian_state.clone();
            async move { state.lookup("doomed.txt").await.unwrap().is_some() }
        })
        .await;

        tokio::fs::remove_file(alice_dir.path().join("doomed.txt"))
            .await
            .unwrap();
        alice.local_file_deleted("doomed.txt").await.unwrap();

        wait_for("doomed.txt to vanish from brian's state", || {
            let state = brian_state.clone();
            async move { state.lookup("doomed.txt").await.unwrap().is_none() }
        })
        .await;

        // The materialized copy is gone too.
        wait_for("doomed.txt to vanish from brian's folder", || {
            let path = brian_dir.path().join("doomed.txt");
            async move { !path.exists() }
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn catchup_after_partition() {
        let hub = FaceHub::new();
        let (alice, alice_dir) = make_node(&hub, "/alice/laptop").await;

        // Alice works alone: a batch of files, one of them rewritten.
        for i in 0..6 {
            let name = format!("batch/file-{i}.dat");
            let path = alice_dir.path().join(&name);
            tokio::fs::create_dir_all(path.parent().unwrap())
                .await
                .unwrap();
            tokio::fs::write(&path, vec![i as u8; 700 * (i + 1) as usize])
                .await
                .unwrap();
            alice.local_file_changed(&name).await.unwrap();
        }
        tokio::fs::write(
            alice_dir.path().join("batch/file-0.dat"),
            b"rewritten afterwards",
        )
        .await
        .unwrap();
        alice.local_file_changed("batch/file-0.dat").await.unwrap();

        // Brian joins late and has to pull the whole history.
        let (brian, brian_dir) = make_node(&hub, "/brian/laptop").await;

        let brian_state = brian.file_state();
        wait_for("brian to learn all six files", || {
            let state = brian_state.clone();
            async move { state.count().await.unwrap() == 6 }
        })
        .await;

        wait_for("brian to materialize the rewritten file", || {
            let path = brian_dir.path().join("batch/file-0.dat");
            async move {
                matches!(tokio::fs::read(&path).await, Ok(bytes) if bytes == b"rewritten afterwards")
            }
        })
        .await;

        // Every action made it into brian's journal.
        assert_eq!(
            brian.action_log().log_size().await.unwrap(),
            alice.action_log().log_size().await.unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_writers_converge_on_the_winner() {
        let hub = FaceHub::new();
        let (alice, alice_dir) = make_node(&hub, "/alice/laptop").await;
        let (brian, brian_dir) = make_node(&hub, "/brian/laptop").await;

        // A base version everyone agrees on.
        tokio::fs::write(alice_dir.path().join("shared.txt"), b"base")
            .await
            .unwrap();
        alice.local_file_changed("shared.txt").await.unwrap();

        let brian_state = brian.file_state();
        wait_for("base version to reach brian", || {
            let state = brian_state.clone();
            async move { state.lookup("shared.txt").await.unwrap().is_some() }
        })
        .await;

        // Both rewrite concurrently at the same version; the greater
        // device wins on both sides.
        tokio::fs::write(alice_dir.path().join("shared.txt"), b"from alice")
            .await
            .unwrap();
        tokio::fs::write(brian_dir.path().join("shared.txt"), b"from brian")
            .await
            .unwrap();
        let (a, b) = tokio::join!(
            alice.local_file_changed("shared.txt"),
            brian.local_file_changed("shared.txt")
        );
        assert_eq!(a.unwrap().item.version, 1);
        assert_eq!(b.unwrap().item.version, 1);

        let winner = Hash::digest(b"from brian");
        for node in [&alice, &brian] {
            let state = node.file_state();
            let expected = winner;
            wait_for("winner to settle", move || {
                let state = state.clone();
                async move {
                    state
                        .lookup("shared.txt")
                        .await
                        .unwrap()
                        .is_some_and(|f| f.hash == expected)
                }
            })
            .await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn app_events_are_forwarded() {
        let hub = FaceHub::new();
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new("shared", "/alice/laptop");
        config.sync.interest_interval_secs = 1;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(dir.path(), config, Arc::new(hub.face()), Some(tx))
            .await
            .unwrap();
        Arc::clone(&dispatcher).start().await.unwrap();

        tokio::fs::write(dir.path().join("seen.txt"), b"hello")
            .await
            .unwrap();
        dispatcher.local_file_changed("seen.txt").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            FileEvent::AddedOrChanged(item) => assert_eq!(item.filename, "seen.txt"),
            other => panic!("expected AddedOrChanged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_file_round_trips() {
        let hub = FaceHub::new();
        let (alice, alice_dir) = make_node(&hub, "/alice/laptop").await;
        let (brian, brian_dir) = make_node(&hub, "/brian/laptop").await;

        tokio::fs::write(alice_dir.path().join("empty.txt"), b"")
            .await
            .unwrap();
        let published = alice.local_file_changed("empty.txt").await.unwrap();
        assert_eq!(published.item.seg_num, Some(1));

        let brian_path = brian_dir.path().join("empty.txt");
        wait_for("empty file to appear on brian", || {
            let path = brian_path.clone();
            async move {
                matches!(tokio::fs::read(&path).await, Ok(bytes) if bytes.is_empty())
            }
        })
        .await;
        let _ = brian;
    }
}
