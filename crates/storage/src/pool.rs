// SPDX-License-Identifier: MIT

use crate::error::{StorageError, StorageResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (and migrate) the SQLite database at `path`. WAL mode plus a
/// busy timeout is the baseline configuration for a SQLite file touched by
/// more than one connection at a time; without it, a second writer gets
/// `SQLITE_BUSY` immediately instead of waiting briefly for the lock.
pub async fn open_sqlite(path: &Path) -> StorageResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(StorageError::Transient)?;
    MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| StorageError::Corrupt(format!("migration failed: {e}")))?;
    Ok(pool)
}

/// Open an ephemeral in-memory database, for tests that don't need to
/// survive a restart. A dedicated file-backed named URI (rather than
/// `:memory:`) so every connection in the pool shares the same database.
pub async fn open_sqlite_in_memory() -> StorageResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(format!("file:durably-{}?mode=memory&cache=shared", uuid_like()))
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(StorageError::Transient)?;
    MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| StorageError::Corrupt(format!("migration failed: {e}")))?;
    Ok(pool)
}

fn uuid_like() -> String {
    uuid::Uuid::now_v7().to_string()
}
