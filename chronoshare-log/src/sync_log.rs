//! The sync log: device table, sequence counters, digest tree, state log.

use sqlx::sqlite::SqlitePool;
use std::path::Path;

use chronoshare_types::{DeviceStatus, Hash, Name, SyncStateMsg};

use crate::db::{open_memory_pool, open_pool};
use crate::digest::state_digest;
use crate::LogError;

const INIT_SYNC_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS SyncNodes (
    device_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    device_name BLOB NOT NULL UNIQUE,
    seq_no      INTEGER,
    status      INTEGER NOT NULL DEFAULT 0,
    last_update INTEGER
);

CREATE TABLE IF NOT EXISTS StateLog (
    digest     BLOB PRIMARY KEY,
    state      BLOB NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
"#;

/// The per-collection sync state: which devices exist, their latest
/// sequence numbers, the digest-tree root over that vector, and a log of
/// recent (digest → state) snapshots for answering stale peers.
///
/// Also the authority for the local device's sequence counter
/// ([`SyncLog::next_local_seq`] is an atomic increment-and-persist).
pub struct SyncLog {
    pool: SqlitePool,
    local_name: Name,
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    device_name: Vec<u8>,
    seq_no: Option<i64>,
}

impl SyncLog {
    /// Open (creating if needed) `sync-log.db` under `<root>/.chronoshare/`.
    pub async fn open(root: &Path, local_name: Name) -> Result<Self, LogError> {
        let dir = root.join(".chronoshare");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| LogError::Database(sqlx::Error::Io(e)))?;
        let pool = open_pool(&dir.join("sync-log.db")).await?;
        Self::init(pool, local_name).await
    }

    /// Open an in-memory sync log (for testing).
    pub async fn in_memory(local_name: Name) -> Result<Self, LogError> {
        let pool = open_memory_pool().await?;
        Self::init(pool, local_name).await
    }

    async fn init(pool: SqlitePool, local_name: Name) -> Result<Self, LogError> {
        sqlx::raw_sql(INIT_SYNC_LOG).execute(&pool).await?;
        let log = Self { pool, local_name };
        log.device_key(&log.local_name.clone()).await?;
        log.record_state().await?;
        Ok(log)
    }

    /// The local device's routable name.
    pub fn local_name(&self) -> &Name {
        &self.local_name
    }

    /// Allocate the next local sequence number (atomic increment + persist).
    ///
    /// The first allocation for a fresh collection returns 0.
    pub async fn next_local_seq(&self) -> Result<u64, LogError> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO SyncNodes (device_name, seq_no) VALUES (?1, 0)
            ON CONFLICT(device_name) DO UPDATE SET seq_no = COALESCE(seq_no + 1, 0)
            RETURNING seq_no
            "#,
        )
        .bind(self.local_name.wire_encode())
        .fetch_one(&self.pool)
        .await?;
        Ok(seq as u64)
    }

    /// Stable small-integer key for a device, allocating one if unseen.
    pub async fn device_key(&self, device: &Name) -> Result<i64, LogError> {
        let wire = device.wire_encode();
        sqlx::query("INSERT INTO SyncNodes (device_name) VALUES (?1) ON CONFLICT DO NOTHING")
            .bind(&wire)
            .execute(&self.pool)
            .await?;
        let key: i64 = sqlx::query_scalar("SELECT device_id FROM SyncNodes WHERE device_name = ?1")
            .bind(&wire)
            .fetch_one(&self.pool)
            .await?;
        Ok(key)
    }

    /// The device name registered under a key.
    pub async fn device_name(&self, key: i64) -> Result<Option<Name>, LogError> {
        let wire: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT device_name FROM SyncNodes WHERE device_id = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        match wire {
            Some(bytes) => Ok(Some(Name::wire_decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Latest known sequence number for a device, if it has emitted any.
    pub async fn seq(&self, device: &Name) -> Result<Option<u64>, LogError> {
        let seq: Option<Option<i64>> =
            sqlx::query_scalar("SELECT seq_no FROM SyncNodes WHERE device_name = ?1")
                .bind(device.wire_encode())
                .fetch_optional(&self.pool)
                .await?;
        Ok(seq.flatten().map(|s| s as u64))
    }

    /// Upsert a device's latest sequence, then re-hash and checkpoint the
    /// new state. Returns the new root digest.
    pub async fn update_device_seq(
        &self,
        device: &Name,
        seq: u64,
        status: DeviceStatus,
    ) -> Result<Hash, LogError> {
        let status_val: i64 = match status {
            DeviceStatus::Update => 0,
            DeviceStatus::Delete => 1,
        };
        sqlx::query(
            r#"
            INSERT INTO SyncNodes (device_name, seq_no, status, last_update)
            VALUES (?1, ?2, ?3, strftime('%s', 'now'))
            ON CONFLICT(device_name) DO UPDATE
                SET seq_no = excluded.seq_no,
                    status = excluded.status,
                    last_update = excluded.last_update
            "#,
        )
        .bind(device.wire_encode())
        .bind(seq as i64)
        .bind(status_val)
        .execute(&self.pool)
        .await?;

        self.record_state().await
    }

    /// The current digest-tree root.
    pub async fn root_digest(&self) -> Result<Hash, LogError> {
        let entries = self.entries().await?;
        Ok(state_digest(entries.iter().map(|(n, s)| (n, *s))))
    }

    /// The full current state vector.
    pub async fn state(&self) -> Result<SyncStateMsg, LogError> {
        let mut msg = SyncStateMsg::new();
        for (device, seq) in self.entries().await? {
            msg.push(device, seq, DeviceStatus::Update);
        }
        Ok(msg)
    }

    /// The state that turned `old_digest` into the current one.
    ///
    /// Returns a delta of the devices whose sequence advanced since
    /// `old_digest` was the root, or the full state if the digest is not in
    /// the state log.
    pub async fn find_state_diff(&self, old_digest: &Hash) -> Result<SyncStateMsg, LogError> {
        let current = self.state().await?;
        let old_bytes: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT state FROM StateLog WHERE digest = ?1")
                .bind(old_digest.as_bytes().as_slice())
                .fetch_optional(&self.pool)
                .await?;

        let old = match old_bytes {
            Some(bytes) => SyncStateMsg::from_bytes(&bytes)?,
            None => return Ok(current),
        };

        let mut diff = SyncStateMsg::new();
        for entry in &current.states {
            let old_seq = old
                .states
                .iter()
                .find(|o| o.device == entry.device)
                .map(|o| o.seq);
            if old_seq != Some(entry.seq) {
                diff.push(entry.device.clone(), entry.seq, DeviceStatus::Update);
            }
        }
        for old_entry in &old.states {
            if !current.states.iter().any(|c| c.device == old_entry.device) {
                diff.push(old_entry.device.clone(), old_entry.seq, DeviceStatus::Delete);
            }
        }
        Ok(diff)
    }

    /// Whether a digest is recognized (current or in the state log).
    pub async fn knows_digest(&self, digest: &Hash) -> Result<bool, LogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM StateLog WHERE digest = ?1")
            .bind(digest.as_bytes().as_slice())
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Active (device, seq) entries, ascending by device wire encoding.
    async fn entries(&self) -> Result<Vec<(Name, u64)>, LogError> {
        let rows: Vec<NodeRow> = sqlx::query_as(
            r#"
            SELECT device_name, seq_no FROM SyncNodes
            WHERE seq_no IS NOT NULL AND status = 0
            ORDER BY device_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let name = Name::wire_decode(&row.device_name)?;
            let seq = row.seq_no.unwrap_or(0) as u64;
            entries.push((name, seq));
        }
        Ok(entries)
    }

    /// Snapshot the current state into the state log under its digest.
    async fn record_state(&self) -> Result<Hash, LogError> {
        let state = self.state().await?;
        let digest = state_digest(state.states.iter().map(|e| (&e.device, e.seq)));
        sqlx::query("INSERT OR IGNORE INTO StateLog (digest, state) VALUES (?1, ?2)")
            .bind(digest.as_bytes().as_slice())
            .bind(state.to_bytes()?)
            .execute(&self.pool)
            .await?;
        Ok(digest)
    }

    /// How many snapshots the state log holds.
    pub async fn state_log_size(&self) -> Result<u64, LogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM StateLog")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

impl std::fmt::Debug for SyncLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLog")
            .field("local_name", &self.local_name)
            .finish()
    }
}
