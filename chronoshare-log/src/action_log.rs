//! The append-only journal of file-system mutations.
//!
//! Every local or remote action lands here exactly once, keyed by
//! (device, seq). Inserts run a winner check inside the same transaction:
//! the new action takes over the `FileState` row for its filename iff no
//! other logged action for that filename has a strictly greater version,
//! or an equal version from a greater device. Losing actions stay in the
//! log so peers can still fetch them.
//!
//! The signed wire bytes of every action are stored verbatim in
//! `action_blob`, so this node can re-serve another device's actions
//! byte-identical, without re-signing.

use sqlx::sqlite::SqlitePool;
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::UnboundedSender;

use chronoshare_types::{ActionItem, ActionKind, DataObject, Hash, Name, ProtocolError};

use crate::db::{open_memory_pool, open_pool};
use crate::file_state::{FileEvent, FileItem, FileState};
use crate::{LogError, SyncLog};

const INIT_ACTION_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS ActionLog (
    device_name BLOB NOT NULL,
    seq_no      INTEGER NOT NULL,

    action      INTEGER NOT NULL,
    filename    TEXT NOT NULL,

    version     INTEGER NOT NULL,
    action_timestamp INTEGER NOT NULL,

    file_hash   BLOB,
    file_mtime  INTEGER,
    file_mode   INTEGER,
    file_seg_num INTEGER,

    parent_device_name BLOB,
    parent_seq_no      INTEGER,

    action_name TEXT NOT NULL,
    action_blob BLOB NOT NULL,

    PRIMARY KEY (device_name, seq_no),

    FOREIGN KEY (parent_device_name, parent_seq_no)
        REFERENCES ActionLog (device_name, seq_no)
        ON UPDATE RESTRICT
        ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS ActionLog_filename_version
    ON ActionLog (filename, version);
CREATE INDEX IF NOT EXISTS ActionLog_parent
    ON ActionLog (parent_device_name, parent_seq_no);
CREATE INDEX IF NOT EXISTS ActionLog_action_name
    ON ActionLog (action_name);

CREATE TABLE IF NOT EXISTS FileState (
    type        INTEGER NOT NULL,
    filename    TEXT NOT NULL,
    device_name BLOB NOT NULL,
    seq_no      INTEGER NOT NULL,
    file_hash   BLOB NOT NULL,
    file_mtime  INTEGER,
    file_mode   INTEGER,
    file_seg_num INTEGER,

    PRIMARY KEY (type, filename)
);

CREATE INDEX IF NOT EXISTS FileState_device ON FileState (device_name, seq_no);
CREATE INDEX IF NOT EXISTS FileState_hash ON FileState (type, file_hash);
"#;

/// A freshly emitted local action, ready for peers to fetch.
#[derive(Debug, Clone)]
pub struct PublishedAction {
    /// The sequence number allocated to the action.
    pub seq: u64,
    /// The decoded body.
    pub item: ActionItem,
    /// The signed object published under the action name.
    pub data: DataObject,
}

/// One row of the journal, as returned by query operations.
#[derive(Debug, Clone)]
pub struct LoggedAction {
    /// Emitting device.
    pub device: Name,
    /// Sequence number on that device.
    pub seq: u64,
    /// The decoded body.
    pub item: ActionItem,
}

/// The append-only action journal plus its in-transaction winner trigger.
pub struct ActionLog {
    pool: SqlitePool,
    sync_log: Arc<SyncLog>,
    shared_folder: String,
    app_name: String,
    events: Option<UnboundedSender<FileEvent>>,
}

struct LatestAction {
    version: u64,
    device: Name,
    seq: u64,
    kind: ActionKind,
}

#[derive(sqlx::FromRow)]
struct BlobRow {
    device_name: Vec<u8>,
    seq_no: i64,
    action_blob: Vec<u8>,
}

impl ActionLog {
    /// Open (creating if needed) `action-log.db` under `<root>/.chronoshare/`.
    pub async fn open(
        root: &Path,
        sync_log: Arc<SyncLog>,
        shared_folder: &str,
        app_name: &str,
        events: Option<UnboundedSender<FileEvent>>,
    ) -> Result<Self, LogError> {
        let dir = root.join(".chronoshare");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| LogError::Database(sqlx::Error::Io(e)))?;
        let pool = open_pool(&dir.join("action-log.db")).await?;
        Self::init(pool, sync_log, shared_folder, app_name, events).await
    }

    /// Open an in-memory action log (for testing).
    pub async fn in_memory(
        sync_log: Arc<SyncLog>,
        shared_folder: &str,
        app_name: &str,
        events: Option<UnboundedSender<FileEvent>>,
    ) -> Result<Self, LogError> {
        let pool = open_memory_pool().await?;
        Self::init(pool, sync_log, shared_folder, app_name, events).await
    }

    async fn init(
        pool: SqlitePool,
        sync_log: Arc<SyncLog>,
        shared_folder: &str,
        app_name: &str,
        events: Option<UnboundedSender<FileEvent>>,
    ) -> Result<Self, LogError> {
        sqlx::raw_sql(INIT_ACTION_LOG).execute(&pool).await?;
        Ok(Self {
            pool,
            sync_log,
            shared_folder: shared_folder.to_string(),
            app_name: app_name.to_string(),
            events,
        })
    }

    /// Read access to the derived current-winner view.
    pub fn file_state(&self) -> FileState {
        FileState::new(self.pool.clone())
    }

    /// The sync log this journal allocates sequence numbers from.
    pub fn sync_log(&self) -> &Arc<SyncLog> {
        &self.sync_log
    }

    /// The name an action by `device` with sequence `seq` is published under:
    /// `<device>/<app>/action/<shared-folder>/<seq>`.
    pub fn action_name(&self, device: &Name, seq: u64) -> Name {
        device
            .clone()
            .append(&self.app_name)
            .append("action")
            .append(&self.shared_folder)
            .append_number(seq)
    }

    /// Record a local file create/modify and publish the action.
    pub async fn add_local_update(
        &self,
        filename: &str,
        file_hash: Hash,
        mtime: i64,
        mode: u32,
        seg_num: u64,
    ) -> Result<PublishedAction, LogError> {
        let device = self.sync_log.local_name().clone();
        let seq = self.sync_log.next_local_seq().await?;
        let timestamp = unix_now();

        let mut tx = self.pool.begin().await?;

        let latest = self.latest_action_for_file(&mut tx, filename).await?;
        // Versions keep increasing across deletes; the parent link is only
        // made to a live update.
        let (version, parent) = match latest {
            Some(latest) => {
                let parent = (latest.kind == ActionKind::Update)
                    .then(|| (latest.device.clone(), latest.seq));
                (latest.version + 1, parent)
            }
            None => (0, None),
        };

        let item = ActionItem::update(
            filename.to_string(),
            version,
            timestamp,
            file_hash,
            mtime,
            mode,
            seg_num,
            parent,
        );
        let name = self.action_name(&device, seq);
        let data = DataObject::new(name.clone(), item.to_bytes()?);

        self.insert_action(&mut tx, &device, seq, &item, &name, &data.to_bytes()?)
            .await?;
        let event = self.apply_winner(&mut tx, &device, seq, &item).await?;
        tx.commit().await?;
        self.emit(event);

        tracing::debug!("published {} (v{})", name, version);
        Ok(PublishedAction { seq, item, data })
    }

    /// Record a local file removal and publish the action.
    ///
    /// A no-op (returning `None`) when the file has no prior update or is
    /// already deleted.
    pub async fn add_local_delete(
        &self,
        filename: &str,
    ) -> Result<Option<PublishedAction>, LogError> {
        let device = self.sync_log.local_name().clone();
        let timestamp = unix_now();

        let mut tx = self.pool.begin().await?;

        let latest = match self.latest_action_for_file(&mut tx, filename).await? {
            Some(latest) if latest.kind == ActionKind::Update => latest,
            _ => return Ok(None),
        };

        let seq = self.sync_log.next_local_seq().await?;
        let item = ActionItem::delete(
            filename.to_string(),
            latest.version + 1,
            timestamp,
            latest.device.clone(),
            latest.seq,
        );
        let name = self.action_name(&device, seq);
        let data = DataObject::new(name.clone(), item.to_bytes()?);

        self.insert_action(&mut tx, &device, seq, &item, &name, &data.to_bytes()?)
            .await?;
        let event = self.apply_winner(&mut tx, &device, seq, &item).await?;
        tx.commit().await?;
        self.emit(event);

        tracing::debug!("published {} (delete, v{})", name, item.version);
        Ok(Some(PublishedAction { seq, item, data }))
    }

    /// Insert an action fetched from a peer, extracting (device, seq) from
    /// the object name.
    pub async fn add_remote_action(&self, data: &DataObject) -> Result<ActionItem, LogError> {
        let name = &data.name;
        // <device...>/<app>/action/<shared-folder>/<seq>
        if name.len() < 4 {
            return Err(ProtocolError::MalformedName(format!("too short: {}", name)).into());
        }
        let seq = name
            .component_from_back(0)
            .and_then(|c| c.as_number())
            .ok_or_else(|| ProtocolError::MalformedName(format!("no sequence in {}", name)))?;
        let folder = name
            .component_from_back(1)
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        if folder != self.shared_folder {
            return Err(ProtocolError::WrongFolder(folder.to_string()).into());
        }
        let marker = name
            .component_from_back(2)
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        if marker != "action" {
            return Err(ProtocolError::MalformedName(format!("not an action: {}", name)).into());
        }
        let device = name.sub_name(0, name.len() - 4);

        self.add_remote_action_at(&device, seq, data).await
    }

    /// Insert an action fetched from a peer under an explicit (device, seq).
    ///
    /// Re-inserting an already-present action is an idempotent no-op.
    pub async fn add_remote_action_at(
        &self,
        device: &Name,
        seq: u64,
        data: &DataObject,
    ) -> Result<ActionItem, LogError> {
        let item = ActionItem::from_bytes(&data.content)?;
        let name = self.action_name(device, seq);

        let mut tx = self.pool.begin().await?;
        let inserted = self
            .insert_action(&mut tx, device, seq, &item, &name, &data.to_bytes()?)
            .await?;
        let event = if inserted {
            self.apply_winner(&mut tx, device, seq, &item).await?
        } else {
            tracing::debug!("duplicate action {}, ignoring", name);
            None
        };
        tx.commit().await?;
        self.emit(event);

        Ok(item)
    }

    /// The stored signed bytes of an action, for re-serving to peers.
    pub async fn lookup_action_data(
        &self,
        device: &Name,
        seq: u64,
    ) -> Result<Option<DataObject>, LogError> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT action_blob FROM ActionLog WHERE device_name = ?1 AND seq_no = ?2",
        )
        .bind(device.wire_encode())
        .bind(seq as i64)
        .fetch_optional(&self.pool)
        .await?;
        blob.map(|b| DataObject::from_bytes(&b).map_err(LogError::from))
            .transpose()
    }

    /// The stored signed bytes of an action, looked up by its full name.
    pub async fn lookup_action_data_by_name(
        &self,
        name: &Name,
    ) -> Result<Option<DataObject>, LogError> {
        let blob: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT action_blob FROM ActionLog WHERE action_name = ?1")
                .bind(name.to_string())
                .fetch_optional(&self.pool)
                .await?;
        blob.map(|b| DataObject::from_bytes(&b).map_err(LogError::from))
            .transpose()
    }

    /// The decoded body of an action.
    pub async fn lookup_action(
        &self,
        device: &Name,
        seq: u64,
    ) -> Result<Option<ActionItem>, LogError> {
        match self.lookup_action_data(device, seq).await? {
            Some(data) => Ok(Some(ActionItem::from_bytes(&data.content)?)),
            None => Ok(None),
        }
    }

    /// Most recent actions across all devices, newest first.
    pub async fn recent_actions(
        &self,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<LoggedAction>, LogError> {
        let rows: Vec<BlobRow> = sqlx::query_as(
            r#"
            SELECT device_name, seq_no, action_blob FROM ActionLog
            ORDER BY action_timestamp DESC, device_name ASC, seq_no DESC
            LIMIT ?1 OFFSET ?2
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::decode_row).collect()
    }

    /// The full history of one file, newest version first.
    pub async fn actions_for_file(
        &self,
        filename: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<LoggedAction>, LogError> {
        let rows: Vec<BlobRow> = sqlx::query_as(
            r#"
            SELECT device_name, seq_no, action_blob FROM ActionLog
            WHERE filename = ?1
            ORDER BY version DESC, device_name DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(filename)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::decode_row).collect()
    }

    /// Actions touching files under a folder prefix (recursive), newest
    /// first. An empty folder matches the whole shared folder.
    pub async fn actions_in_folder(
        &self,
        folder: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<LoggedAction>, LogError> {
        let pattern = if folder.is_empty() {
            "%".to_string()
        } else {
            format!("{}/%", folder.trim_end_matches('/').replace('%', ""))
        };
        let rows: Vec<BlobRow> = sqlx::query_as(
            r#"
            SELECT device_name, seq_no, action_blob FROM ActionLog
            WHERE filename LIKE ?1
            ORDER BY action_timestamp DESC, device_name ASC, seq_no DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(pattern)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::decode_row).collect()
    }

    /// Find the update that set a file to a specific (version, hash).
    /// Used by restore.
    pub async fn lookup_file_version(
        &self,
        filename: &str,
        version: u64,
        file_hash: &Hash,
    ) -> Result<Option<LoggedAction>, LogError> {
        let row: Option<BlobRow> = sqlx::query_as(
            r#"
            SELECT device_name, seq_no, action_blob FROM ActionLog
            WHERE filename = ?1 AND version = ?2 AND file_hash = ?3
            LIMIT 1
            "#,
        )
        .bind(filename)
        .bind(version as i64)
        .bind(file_hash.as_bytes().as_slice())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::decode_row).transpose()
    }

    /// Total number of logged actions.
    pub async fn log_size(&self) -> Result<u64, LogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ActionLog")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    fn decode_row(row: BlobRow) -> Result<LoggedAction, LogError> {
        let data = DataObject::from_bytes(&row.action_blob)?;
        Ok(LoggedAction {
            device: Name::wire_decode(&row.device_name)?,
            seq: row.seq_no as u64,
            item: ActionItem::from_bytes(&data.content)?,
        })
    }

    async fn latest_action_for_file(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        filename: &str,
    ) -> Result<Option<LatestAction>, LogError> {
        let row: Option<(i64, Vec<u8>, i64, i64)> = sqlx::query_as(
            r#"
            SELECT version, device_name, seq_no, action FROM ActionLog
            WHERE filename = ?1
            ORDER BY version DESC, device_name DESC
            LIMIT 1
            "#,
        )
        .bind(filename)
        .fetch_optional(&mut **tx)
        .await?;

        match row {
            Some((version, device_name, seq_no, action)) => Ok(Some(LatestAction {
                version: version as u64,
                device: Name::wire_decode(&device_name)?,
                seq: seq_no as u64,
                kind: ActionKind::from_i64(action).ok_or_else(|| {
                    ProtocolError::InvalidAction(format!("unknown kind {}", action))
                })?,
            })),
            None => Ok(None),
        }
    }

    async fn insert_action(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        device: &Name,
        seq: u64,
        item: &ActionItem,
        action_name: &Name,
        blob: &[u8],
    ) -> Result<bool, LogError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO ActionLog
            (device_name, seq_no, action, filename, version, action_timestamp,
             file_hash, file_mtime, file_mode, file_seg_num,
             parent_device_name, parent_seq_no,
             action_name, action_blob)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(device.wire_encode())
        .bind(seq as i64)
        .bind(item.kind.as_i64())
        .bind(&item.filename)
        .bind(item.version as i64)
        .bind(item.timestamp)
        .bind(item.file_hash.map(|h| h.as_bytes().to_vec()))
        .bind(item.mtime)
        .bind(item.mode.map(|m| m as i64))
        .bind(item.seg_num.map(|n| n as i64))
        .bind(item.parent_device.as_ref().map(|d| d.wire_encode()))
        .bind(item.parent_seq.map(|s| s as i64))
        .bind(action_name.to_string())
        .bind(blob)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The winner trigger. Runs inside the insert transaction: the new
    /// action wins its filename iff no logged action has a greater version,
    /// or an equal version from a greater device.
    async fn apply_winner(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        device: &Name,
        seq: u64,
        item: &ActionItem,
    ) -> Result<Option<FileEvent>, LogError> {
        let device_wire = device.wire_encode();
        let superseded: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM ActionLog
            WHERE filename = ?1
              AND (version > ?2 OR (version = ?2 AND device_name > ?3))
            "#,
        )
        .bind(&item.filename)
        .bind(item.version as i64)
        .bind(&device_wire)
        .fetch_one(&mut **tx)
        .await?;
        if superseded > 0 {
            return Ok(None);
        }

        match item.kind {
            ActionKind::Update => {
                let updated = sqlx::query(
                    r#"
                    UPDATE FileState SET
                        device_name = ?1, seq_no = ?2, file_hash = ?3,
                        file_mtime = ?4, file_mode = ?5, file_seg_num = ?6
                    WHERE type = 0 AND filename = ?7
                    "#,
                )
                .bind(&device_wire)
                .bind(seq as i64)
                .bind(item.file_hash.map(|h| h.as_bytes().to_vec()))
                .bind(item.mtime)
                .bind(item.mode.map(|m| m as i64))
                .bind(item.seg_num.map(|n| n as i64))
                .bind(&item.filename)
                .execute(&mut **tx)
                .await?;

                if updated.rows_affected() == 0 {
                    sqlx::query(
                        r#"
                        INSERT INTO FileState
                        (type, filename, device_name, seq_no, file_hash,
                         file_mtime, file_mode, file_seg_num)
                        VALUES (0, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
                        "#,
                    )
                    .bind(&item.filename)
                    .bind(&device_wire)
                    .bind(seq as i64)
                    .bind(item.file_hash.map(|h| h.as_bytes().to_vec()))
                    .bind(item.mtime)
                    .bind(item.mode.map(|m| m as i64))
                    .bind(item.seg_num.map(|n| n as i64))
                    .execute(&mut **tx)
                    .await?;
                }

                let file_item = FileItem {
                    filename: item.filename.clone(),
                    device: device.clone(),
                    seq,
                    hash: item.file_hash.ok_or_else(|| {
                        ProtocolError::InvalidAction("update without hash".into())
                    })?,
                    mtime: item.mtime.unwrap_or(0),
                    mode: item.mode.unwrap_or(0),
                    seg_num: item.seg_num.unwrap_or(0),
                };
                Ok(Some(FileEvent::AddedOrChanged(file_item)))
            }
            ActionKind::Delete => {
                let deleted =
                    sqlx::query("DELETE FROM FileState WHERE type = 0 AND filename = ?1")
                        .bind(&item.filename)
                        .execute(&mut **tx)
                        .await?;
                if deleted.rows_affected() > 0 {
                    Ok(Some(FileEvent::Removed(item.filename.clone())))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn emit(&self, event: Option<FileEvent>) {
        if let (Some(tx), Some(event)) = (&self.events, event) {
            // The receiver may be gone during shutdown; that is fine.
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for ActionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionLog")
            .field("shared_folder", &self.shared_folder)
            .field("app_name", &self.app_name)
            .finish()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const FOLDER: &str = "shared";
    const APP: &str = "chronoshare";

    async fn make_log(device: &str) -> ActionLog {
        let sync_log = Arc::new(SyncLog::in_memory(device.parse().unwrap()).await.unwrap());
        ActionLog::in_memory(sync_log, FOLDER, APP, None)
            .await
            .unwrap()
    }

    async fn make_log_with_events(device: &str) -> (ActionLog, mpsc::UnboundedReceiver<FileEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sync_log = Arc::new(SyncLog::in_memory(device.parse().unwrap()).await.unwrap());
        let log = ActionLog::in_memory(sync_log, FOLDER, APP, Some(tx))
            .await
            .unwrap();
        (log, rx)
    }

    fn hash_of(content: &[u8]) -> Hash {
        Hash::digest(content)
    }

    // ===========================================
    // Local create / modify / delete cycle
    // ===========================================

    #[tokio::test]
    async fn create_modify_delete_cycle() {
        let log = make_log("/alice/laptop").await;

        // Create: seq 0, version 0, no parent
        let create = log
            .add_local_update("a", hash_of(b"X"), 100, 0o644, 1)
            .await
            .unwrap();
        assert_eq!(create.seq, 0);
        assert_eq!(create.item.version, 0);
        assert!(create.item.parent().is_none());

        let state = log.file_state();
        let file = state.lookup("a").await.unwrap().unwrap();
        assert_eq!(file.hash, hash_of(b"X"));
        assert_eq!(file.seq, 0);

        // Overwrite: seq 1, version 1, parent (alice, 0)
        let modify = log
            .add_local_update("a", hash_of(b"Y"), 200, 0o644, 1)
            .await
            .unwrap();
        assert_eq!(modify.seq, 1);
        assert_eq!(modify.item.version, 1);
        let (parent_device, parent_seq) = modify.item.parent().unwrap();
        assert_eq!(parent_device.to_string(), "/alice/laptop");
        assert_eq!(parent_seq, 0);

        let file = state.lookup("a").await.unwrap().unwrap();
        assert_eq!(file.hash, hash_of(b"Y"));

        // Delete: seq 2, version 2, parent (alice, 1); row gone
        let delete = log.add_local_delete("a").await.unwrap().unwrap();
        assert_eq!(delete.seq, 2);
        assert_eq!(delete.item.version, 2);
        assert_eq!(delete.item.parent().unwrap().1, 1);
        assert!(state.lookup("a").await.unwrap().is_none());

        assert_eq!(log.log_size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn delete_without_prior_update_is_noop() {
        let log = make_log("/alice/laptop").await;
        assert!(log.add_local_delete("ghost").await.unwrap().is_none());
        assert_eq!(log.log_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn double_delete_is_noop() {
        let log = make_log("/alice/laptop").await;
        log.add_local_update("a", hash_of(b"X"), 100, 0o644, 1)
            .await
            .unwrap();
        assert!(log.add_local_delete("a").await.unwrap().is_some());
        assert!(log.add_local_delete("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn version_continues_after_delete() {
        let log = make_log("/alice/laptop").await;
        log.add_local_update("a", hash_of(b"X"), 100, 0o644, 1)
            .await
            .unwrap();
        log.add_local_delete("a").await.unwrap();

        // Re-created file keeps a higher version and no parent link into
        // the deleted history.
        let recreated = log
            .add_local_update("a", hash_of(b"Z"), 300, 0o644, 1)
            .await
            .unwrap();
        assert_eq!(recreated.item.version, 2);
        assert!(recreated.item.parent().is_none());

        let file = log.file_state().lookup("a").await.unwrap().unwrap();
        assert_eq!(file.hash, hash_of(b"Z"));
    }

    // ===========================================
    // Remote actions and the winner predicate
    // ===========================================

    #[tokio::test]
    async fn remote_action_roundtrips_through_wire() {
        let alice = make_log("/alice/laptop").await;
        let brian = make_log("/brian/laptop").await;

        let published = alice
            .add_local_update("a", hash_of(b"X"), 100, 0o644, 1)
            .await
            .unwrap();

        // Bob receives the exact signed bytes.
        let wire = published.data.to_bytes().unwrap();
        let received = DataObject::from_bytes(&wire).unwrap();
        let item = brian.add_remote_action(&received).await.unwrap();

        assert_eq!(item, published.item);
        let file = brian.file_state().lookup("a").await.unwrap().unwrap();
        assert_eq!(file.hash, hash_of(b"X"));
        assert_eq!(file.device.to_string(), "/alice/laptop");

        // The stored blob is byte-identical for re-serving.
        let stored = brian
            .lookup_action_data(&"/alice/laptop".parse().unwrap(), 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.to_bytes().unwrap(), wire);
    }

    #[tokio::test]
    async fn concurrent_updates_resolve_by_device_order() {
        let alice = make_log("/alice/laptop").await;
        let brian = make_log("/brian/laptop").await;

        // Both observe version 0 then write concurrently: both emit v1.
        let base = alice
            .add_local_update("a", hash_of(b"base"), 10, 0o644, 1)
            .await
            .unwrap();
        brian.add_remote_action(&base.data).await.unwrap();

        let from_alice = alice
            .add_local_update("a", hash_of(b"alice writes"), 20, 0o644, 1)
            .await
            .unwrap();
        let from_brian = brian
            .add_local_update("a", hash_of(b"brian writes"), 20, 0o644, 1)
            .await
            .unwrap();
        assert_eq!(from_alice.item.version, 1);
        assert_eq!(from_brian.item.version, 1);

        // Cross-deliver. /brian/laptop > /alice/laptop, so brian's row wins
        // on both nodes.
        alice.add_remote_action(&from_brian.data).await.unwrap();
        brian.add_remote_action(&from_alice.data).await.unwrap();

        let on_alice = alice.file_state().lookup("a").await.unwrap().unwrap();
        let on_brian = brian.file_state().lookup("a").await.unwrap().unwrap();
        assert_eq!(on_alice.hash, hash_of(b"brian writes"));
        assert_eq!(on_brian.hash, hash_of(b"brian writes"));
    }

    #[tokio::test]
    async fn late_arriving_loser_does_not_change_state() {
        let alice = make_log("/alice/laptop").await;
        let brian = make_log("/brian/laptop").await;

        let base = alice
            .add_local_update("a", hash_of(b"base"), 10, 0o644, 1)
            .await
            .unwrap();
        brian.add_remote_action(&base.data).await.unwrap();

        // Bob writes v1 locally first, then alice's concurrent v1 arrives
        // late. Bob's own row still wins (greater device).
        brian.add_local_update("a", hash_of(b"brian writes"), 20, 0o644, 1)
            .await
            .unwrap();
        let from_alice = alice
            .add_local_update("a", hash_of(b"alice writes"), 20, 0o644, 1)
            .await
            .unwrap();
        brian.add_remote_action(&from_alice.data).await.unwrap();

        let on_brian = brian.file_state().lookup("a").await.unwrap().unwrap();
        assert_eq!(on_brian.hash, hash_of(b"brian writes"));

        // The losing action is still in the log for peers to fetch.
        assert_eq!(brian.log_size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn duplicate_remote_action_is_idempotent() {
        let alice = make_log("/alice/laptop").await;
        let brian = make_log("/brian/laptop").await;

        let published = alice
            .add_local_update("a", hash_of(b"X"), 100, 0o644, 1)
            .await
            .unwrap();

        brian.add_remote_action(&published.data).await.unwrap();
        let before = brian.log_size().await.unwrap();
        let state_before = brian.file_state().lookup("a").await.unwrap();

        brian.add_remote_action(&published.data).await.unwrap();
        assert_eq!(brian.log_size().await.unwrap(), before);
        assert_eq!(brian.file_state().lookup("a").await.unwrap(), state_before);
    }

    #[tokio::test]
    async fn remote_delete_wins_and_removes() {
        let alice = make_log("/alice/laptop").await;
        let brian = make_log("/brian/laptop").await;

        let create = alice
            .add_local_update("a", hash_of(b"X"), 100, 0o644, 1)
            .await
            .unwrap();
        let delete = alice.add_local_delete("a").await.unwrap().unwrap();

        brian.add_remote_action(&create.data).await.unwrap();
        assert!(brian.file_state().lookup("a").await.unwrap().is_some());
        brian.add_remote_action(&delete.data).await.unwrap();
        assert!(brian.file_state().lookup("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_folder_is_rejected() {
        let alice = make_log("/alice/laptop").await;
        let published = alice
            .add_local_update("a", hash_of(b"X"), 100, 0o644, 1)
            .await
            .unwrap();

        let sync_log = Arc::new(SyncLog::in_memory("/brian/laptop".parse().unwrap())
            .await
            .unwrap());
        let other = ActionLog::in_memory(sync_log, "other-folder", APP, None)
            .await
            .unwrap();

        let err = other.add_remote_action(&published.data).await.unwrap_err();
        assert!(matches!(
            err,
            LogError::Protocol(ProtocolError::WrongFolder(_))
        ));
    }

    // ===========================================
    // Events
    // ===========================================

    #[tokio::test]
    async fn events_fire_on_winner_changes() {
        let (log, mut rx) = make_log_with_events("/alice/laptop").await;

        log.add_local_update("a", hash_of(b"X"), 100, 0o644, 1)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            FileEvent::AddedOrChanged(item) => assert_eq!(item.filename, "a"),
            other => panic!("expected AddedOrChanged, got {:?}", other),
        }

        log.add_local_delete("a").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), FileEvent::Removed("a".into()));
    }

    #[tokio::test]
    async fn losing_action_fires_no_event() {
        let alice = make_log("/alice/laptop").await;
        let (brian, mut rx) = make_log_with_events("/brian/laptop").await;

        let base = alice
            .add_local_update("a", hash_of(b"base"), 10, 0o644, 1)
            .await
            .unwrap();
        brian.add_remote_action(&base.data).await.unwrap();
        let _ = rx.recv().await; // consume the base event

        brian.add_local_update("a", hash_of(b"brian writes"), 20, 0o644, 1)
            .await
            .unwrap();
        let _ = rx.recv().await; // consume brian's own event

        let from_alice = alice
            .add_local_update("a", hash_of(b"alice writes"), 20, 0o644, 1)
            .await
            .unwrap();
        brian.add_remote_action(&from_alice.data).await.unwrap();

        // The loser must not have produced an event.
        assert!(rx.try_recv().is_err());
    }

    // ===========================================
    // Lookups
    // ===========================================

    #[tokio::test]
    async fn lookup_by_action_name() {
        let log = make_log("/alice/laptop").await;
        let published = log
            .add_local_update("a", hash_of(b"X"), 100, 0o644, 1)
            .await
            .unwrap();

        let name = log.action_name(&"/alice/laptop".parse().unwrap(), 0);
        assert_eq!(name, published.data.name);
        let data = log.lookup_action_data_by_name(&name).await.unwrap().unwrap();
        assert_eq!(data, published.data);

        let missing: Name = "/alice/laptop/chronoshare/action/shared/99".parse().unwrap();
        assert!(log.lookup_action_data_by_name(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_and_folder_queries() {
        let log = make_log("/alice/laptop").await;
        log.add_local_update("docs/a.txt", hash_of(b"1"), 10, 0o644, 1)
            .await
            .unwrap();
        log.add_local_update("docs/b.txt", hash_of(b"2"), 11, 0o644, 1)
            .await
            .unwrap();
        log.add_local_update("docs/a.txt", hash_of(b"3"), 12, 0o644, 1)
            .await
            .unwrap();
        log.add_local_update("music/c.mp3", hash_of(b"4"), 13, 0o644, 1)
            .await
            .unwrap();

        let history = log.actions_for_file("docs/a.txt", 10, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].item.version, 1); // newest first

        let in_docs = log.actions_in_folder("docs", 10, 0).await.unwrap();
        assert_eq!(in_docs.len(), 3);

        let everything = log.actions_in_folder("", 10, 0).await.unwrap();
        assert_eq!(everything.len(), 4);

        let recent = log.recent_actions(2, 0).await.unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn restore_lookup_by_version_and_hash() {
        let log = make_log("/alice/laptop").await;
        log.add_local_update("a", hash_of(b"v0"), 10, 0o644, 1)
            .await
            .unwrap();
        log.add_local_update("a", hash_of(b"v1"), 11, 0o644, 1)
            .await
            .unwrap();

        let found = log
            .lookup_file_version("a", 0, &hash_of(b"v0"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.seq, 0);
        assert_eq!(found.item.file_hash, Some(hash_of(b"v0")));

        assert!(log
            .lookup_file_version("a", 0, &hash_of(b"wrong"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stored_blob_matches_columns() {
        // The action body stored in action_blob deserializes to an item
        // whose fields match what the lookup APIs report.
        let log = make_log("/alice/laptop").await;
        let published = log
            .add_local_update("a", hash_of(b"X"), 100, 0o755, 3)
            .await
            .unwrap();

        let device: Name = "/alice/laptop".parse().unwrap();
        let item = log.lookup_action(&device, 0).await.unwrap().unwrap();
        assert_eq!(item, published.item);
        assert_eq!(item.kind, ActionKind::Update);
        assert_eq!(item.filename, "a");
        assert_eq!(item.version, 0);
        assert_eq!(item.seg_num, Some(3));
        assert_eq!(item.mode, Some(0o755));
    }
}
