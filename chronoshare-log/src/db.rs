//! SQLite pool construction shared by the journals.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::LogError;

/// Open (creating if missing) a database file with WAL journaling.
///
/// Foreign keys stay unenforced: parent links in the action log are
/// declarative (a remote action may reference a parent that has not been
/// fetched yet).
pub(crate) async fn open_pool(path: &Path) -> Result<SqlitePool, LogError> {
    let options = SqliteConnectOptions::from_str(path.to_str().unwrap_or("chronoshare.db"))
        .map_err(LogError::Database)?
        .create_if_missing(true)
        .foreign_keys(false)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .map_err(LogError::Database)
}

/// Open an in-memory database (for testing).
pub(crate) async fn open_memory_pool() -> Result<SqlitePool, LogError> {
    let options = SqliteConnectOptions::from_str(":memory:")
        .map_err(LogError::Database)?
        .foreign_keys(false)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(LogError::Database)
}
