//! One per-file-hash segment sub-store.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chronoshare_types::{DataObject, Hash, Name};

use crate::ContentError;

const INIT_OBJECT_DB: &str = r#"
CREATE TABLE IF NOT EXISTS File (
    device_name     BLOB NOT NULL,
    segment         INTEGER,
    content_object  BLOB,

    PRIMARY KEY (device_name, segment)
);
CREATE INDEX IF NOT EXISTS File_device ON File (device_name);
"#;

/// The segment store for one file content hash.
///
/// Rows are `(device, segment) → signed segment object bytes`. The backing
/// SQLite file lives at `<root>/objects/<hh>/<rest-of-hash>`, grouping
/// sub-stores by the first two hex digits to bound directory width.
pub struct ObjectDb {
    pool: SqlitePool,
    hash: Hash,
    last_used: Mutex<Instant>,
}

impl ObjectDb {
    /// Open (creating if needed) the sub-store for `hash`.
    pub async fn open(db_root: &Path, hash: &Hash) -> Result<Self, ContentError> {
        let path = Self::db_path(db_root, hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(path.to_str().unwrap_or("object.db"))
            .map_err(ContentError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(ContentError::Database)?;

        sqlx::raw_sql(INIT_OBJECT_DB).execute(&pool).await?;

        Ok(Self {
            pool,
            hash: *hash,
            last_used: Mutex::new(Instant::now()),
        })
    }

    /// Whether a complete copy of `hash` exists for `device` without
    /// opening a long-lived store: the sub-store file exists and every
    /// segment row is populated.
    pub async fn exists(db_root: &Path, device: &Name, hash: &Hash) -> Result<bool, ContentError> {
        if !Self::db_path(db_root, hash).exists() {
            return Ok(false);
        }
        let db = Self::open(db_root, hash).await?;
        db.is_complete(device).await
    }

    /// The content hash this sub-store belongs to.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Store one signed segment object.
    pub async fn save_segment(
        &self,
        device: &Name,
        segment: u64,
        object: &DataObject,
    ) -> Result<(), ContentError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO File (device_name, segment, content_object)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(device.wire_encode())
        .bind(segment as i64)
        .bind(object.to_bytes()?)
        .execute(&self.pool)
        .await?;
        self.touch();
        Ok(())
    }

    /// Fetch one stored segment object, if present.
    pub async fn fetch_segment(
        &self,
        device: &Name,
        segment: u64,
    ) -> Result<Option<DataObject>, ContentError> {
        let blob: Option<Option<Vec<u8>>> = sqlx::query_scalar(
            "SELECT content_object FROM File WHERE device_name = ?1 AND segment = ?2",
        )
        .bind(device.wire_encode())
        .bind(segment as i64)
        .fetch_optional(&self.pool)
        .await?;
        self.touch();
        match blob.flatten() {
            Some(bytes) => Ok(Some(DataObject::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Number of segment rows stored for a device.
    pub async fn segment_count(&self, device: &Name) -> Result<u64, ContentError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM File WHERE device_name = ?1")
            .bind(device.wire_encode())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Whether every stored segment row is populated (and at least one
    /// exists). This is the all-or-nothing completeness test; partial
    /// copies are never served as complete.
    pub async fn is_complete(&self, device: &Name) -> Result<bool, ContentError> {
        let (count_all, count_non_null): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(content_object) FROM File WHERE device_name = ?1",
        )
        .bind(device.wire_encode())
        .fetch_one(&self.pool)
        .await?;
        Ok(count_all > 0 && count_all == count_non_null)
    }

    /// How long this sub-store has been idle.
    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_used.lock() {
            *t = Instant::now();
        }
    }

    fn db_path(db_root: &Path, hash: &Hash) -> PathBuf {
        let hex = hash.to_string();
        db_root.join("objects").join(&hex[..2]).join(&hex[2..])
    }
}

impl std::fmt::Debug for ObjectDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDb").field("hash", &self.hash).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Name {
        "/alice/laptop".parse().unwrap()
    }

    fn segment_object(seg: u64, body: &[u8]) -> DataObject {
        let name: Name = format!("/alice/laptop/chronoshare/file/h/{seg}").parse().unwrap();
        DataObject::new(name, body.to_vec())
    }

    #[tokio::test]
    async fn save_and_fetch_segment() {
        let dir = tempfile::tempdir().unwrap();
        let hash = Hash::digest(b"some file");
        let db = ObjectDb::open(dir.path(), &hash).await.unwrap();

        let object = segment_object(0, b"segment zero");
        db.save_segment(&device(), 0, &object).await.unwrap();

        let fetched = db.fetch_segment(&device(), 0).await.unwrap().unwrap();
        assert_eq!(fetched, object);
        assert!(db.fetch_segment(&device(), 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn db_file_is_grouped_by_hash_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let hash = Hash::digest(b"grouped");
        let _db = ObjectDb::open(dir.path(), &hash).await.unwrap();

        let hex = hash.to_string();
        assert!(dir
            .path()
            .join("objects")
            .join(&hex[..2])
            .join(&hex[2..])
            .exists());
    }

    #[tokio::test]
    async fn completeness_requires_segments() {
        let dir = tempfile::tempdir().unwrap();
        let hash = Hash::digest(b"file");
        let db = ObjectDb::open(dir.path(), &hash).await.unwrap();

        assert!(!db.is_complete(&device()).await.unwrap());

        db.save_segment(&device(), 0, &segment_object(0, b"a"))
            .await
            .unwrap();
        db.save_segment(&device(), 1, &segment_object(1, b"b"))
            .await
            .unwrap();

        assert!(db.is_complete(&device()).await.unwrap());
        assert_eq!(db.segment_count(&device()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn exists_without_store_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let hash = Hash::digest(b"never stored");
        assert!(!ObjectDb::exists(dir.path(), &device(), &hash)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn exists_with_complete_store_is_true() {
        let dir = tempfile::tempdir().unwrap();
        let hash = Hash::digest(b"stored");
        let db = ObjectDb::open(dir.path(), &hash).await.unwrap();
        db.save_segment(&device(), 0, &segment_object(0, b"x"))
            .await
            .unwrap();
        drop(db);

        assert!(ObjectDb::exists(dir.path(), &device(), &hash)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn idle_time_resets_on_use() {
        let dir = tempfile::tempdir().unwrap();
        let hash = Hash::digest(b"idle");
        let db = ObjectDb::open(dir.path(), &hash).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(db.idle_for() >= Duration::from_millis(20));

        db.save_segment(&device(), 0, &segment_object(0, b"x"))
            .await
            .unwrap();
        assert!(db.idle_for() < Duration::from_millis(20));
    }
}
