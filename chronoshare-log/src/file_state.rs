//! The derived current-winner view over the action log.
//!
//! `FileState` holds one row per filename in its newest known version,
//! maintained by the action log's insert trigger. Reads here never see a
//! state mid-transition because the trigger runs inside the action insert
//! transaction.

use sqlx::sqlite::SqlitePool;

use chronoshare_types::{Hash, Name, ProtocolError};

use crate::LogError;

/// One live file in its newest known version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileItem {
    /// Path relative to the shared folder root.
    pub filename: String,
    /// Device that emitted the winning update.
    pub device: Name,
    /// Sequence number of the winning update on that device.
    pub seq: u64,
    /// Content hash.
    pub hash: Hash,
    /// Modification time (unix seconds).
    pub mtime: i64,
    /// Unix permission bits.
    pub mode: u32,
    /// Number of content segments.
    pub seg_num: u64,
}

/// Notification handed to the application layer when the winner for a
/// filename changes. The application receives these and nothing else - no
/// errors cross this boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// A file appeared or its winning version changed.
    AddedOrChanged(FileItem),
    /// A file's winning action is now a delete.
    Removed(String),
}

/// Read access to the current-winner table.
///
/// Shares the action log's pool; obtained via
/// [`crate::ActionLog::file_state`].
#[derive(Clone)]
pub struct FileState {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct FileRow {
    filename: String,
    device_name: Vec<u8>,
    seq_no: i64,
    file_hash: Vec<u8>,
    file_mtime: i64,
    file_mode: i64,
    file_seg_num: i64,
}

impl TryFrom<FileRow> for FileItem {
    type Error = LogError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        Ok(FileItem {
            filename: row.filename,
            device: Name::wire_decode(&row.device_name)?,
            seq: row.seq_no as u64,
            hash: Hash::from_bytes(&row.file_hash).ok_or_else(|| {
                LogError::Protocol(ProtocolError::InvalidHash(format!(
                    "wrong length: {}",
                    row.file_hash.len()
                )))
            })?,
            mtime: row.file_mtime,
            mode: row.file_mode as u32,
            seg_num: row.file_seg_num as u64,
        })
    }
}

const SELECT_FIELDS: &str =
    "SELECT filename, device_name, seq_no, file_hash, file_mtime, file_mode, file_seg_num \
     FROM FileState";

impl FileState {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The newest version of a file, or `None` if the file is deleted or
    /// was never seen.
    pub async fn lookup(&self, filename: &str) -> Result<Option<FileItem>, LogError> {
        let row: Option<FileRow> =
            sqlx::query_as(&format!("{SELECT_FIELDS} WHERE type = 0 AND filename = ?1"))
                .bind(filename)
                .fetch_optional(&self.pool)
                .await?;
        row.map(FileItem::try_from).transpose()
    }

    /// Every live file whose content matches a hash.
    pub async fn files_for_hash(&self, hash: &Hash) -> Result<Vec<FileItem>, LogError> {
        let rows: Vec<FileRow> = sqlx::query_as(&format!(
            "{SELECT_FIELDS} WHERE type = 0 AND file_hash = ?1 ORDER BY filename"
        ))
        .bind(hash.as_bytes().as_slice())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FileItem::try_from).collect()
    }

    /// Live files under a folder prefix (recursive). An empty prefix lists
    /// the whole shared folder.
    pub async fn list_folder(&self, folder: &str) -> Result<Vec<FileItem>, LogError> {
        let pattern = if folder.is_empty() {
            "%".to_string()
        } else {
            format!("{}/%", folder.trim_end_matches('/').replace('%', ""))
        };
        let rows: Vec<FileRow> = sqlx::query_as(&format!(
            "{SELECT_FIELDS} WHERE type = 0 AND filename LIKE ?1 ORDER BY filename"
        ))
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FileItem::try_from).collect()
    }

    /// How many live files the state holds.
    pub async fn count(&self) -> Result<u64, LogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM FileState WHERE type = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

impl std::fmt::Debug for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileState").finish()
    }
}
