//! SQLite pool setup and the object table schema.

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, time::Duration};

const MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a pool from a `sqlite://` URL, creating the file (and its parent
/// directory) when missing.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {:?}", parent))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url `{}`", database_url))?;
    open(options).await
}

/// Open a pool on a database file path.
pub async fn connect_file(path: &Path) -> Result<SqlitePool> {
    open(SqliteConnectOptions::new().filename(path)).await
}

async fn open(options: SqliteConnectOptions) -> Result<SqlitePool> {
    let options = options
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .context("connecting to SQLite")
}

/// Create the `objects` table used by the object store.
pub async fn ensure_object_schema(db: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS objects (
            bucket TEXT NOT NULL,
            key TEXT NOT NULL,
            content_type TEXT,
            size_bytes INTEGER NOT NULL,
            etag TEXT NOT NULL,
            last_modified TEXT NOT NULL,
            payload_path TEXT NOT NULL,
            replaced_payload_path TEXT,
            PRIMARY KEY (bucket, key)
        )",
    )
    .execute(db)
    .await
    .context("creating objects table")?;
    Ok(())
}
