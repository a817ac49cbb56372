//! src/services/metadata_store.rs
//!
//! SQLite-backed metadata index. One row per image name in a table whose
//! name comes from configuration; every write replaces the full row, so
//! concurrent writers for the same image resolve to whichever lands last.

use crate::models::record::{ProcessingRecord, ProcessingStatus};
use crate::services::traits::MetadataStore;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;

const MAX_TABLE_NAME_LEN: usize = 63;
const MAX_LIST_LIMIT: u32 = 1000;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("table name `{0}` is not a valid SQL identifier")]
    InvalidTableName(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Table names are interpolated into SQL, so only plain identifiers pass:
/// ASCII letter or underscore first, then letters, digits, underscores.
pub fn validate_table_name(name: &str) -> MetadataResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name.len() <= MAX_TABLE_NAME_LEN
                && !name.to_ascii_lowercase().starts_with("sqlite_")
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(MetadataError::InvalidTableName(name.to_string()))
    }
}

#[derive(Clone)]
pub struct SqliteMetadataStore {
    db: Arc<SqlitePool>,
    table: String,
}

impl SqliteMetadataStore {
    pub fn new(db: Arc<SqlitePool>, table: impl Into<String>) -> MetadataResult<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { db, table })
    }

    /// Create the records table and its status index if missing.
    pub async fn ensure_schema(&self) -> MetadataResult<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                image_name TEXT PRIMARY KEY NOT NULL,
                status TEXT NOT NULL,
                thumbnail_location TEXT,
                thumbnail_etag TEXT,
                source_bucket TEXT NOT NULL,
                image_size INTEGER NOT NULL,
                source_modified_at TEXT,
                last_error TEXT,
                processed_at TEXT NOT NULL
            )",
            table = self.table
        ))
        .execute(&*self.db)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_status_idx ON {table} (status, processed_at)",
            table = self.table
        ))
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    /// Run `SELECT 1` against the pool.
    pub async fn ping(&self) -> MetadataResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }

    fn insert_sql(&self, on_conflict: &str) -> String {
        format!(
            "INSERT INTO {table} (
                image_name, status, thumbnail_location, thumbnail_etag,
                source_bucket, image_size, source_modified_at, last_error, processed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            {on_conflict}",
            table = self.table
        )
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn upsert(&self, record: &ProcessingRecord) -> MetadataResult<()> {
        let sql = self.insert_sql(
            "ON CONFLICT(image_name) DO UPDATE SET
                status = excluded.status,
                thumbnail_location = excluded.thumbnail_location,
                thumbnail_etag = excluded.thumbnail_etag,
                source_bucket = excluded.source_bucket,
                image_size = excluded.image_size,
                source_modified_at = excluded.source_modified_at,
                last_error = excluded.last_error,
                processed_at = excluded.processed_at",
        );
        bind_record(sqlx::query(&sql), record)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn insert_if_absent(&self, record: &ProcessingRecord) -> MetadataResult<bool> {
        let sql = self.insert_sql("ON CONFLICT(image_name) DO NOTHING");
        let result = bind_record(sqlx::query(&sql), record)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, image_name: &str) -> MetadataResult<Option<ProcessingRecord>> {
        let record = sqlx::query_as::<_, ProcessingRecord>(&format!(
            "SELECT image_name, status, thumbnail_location, thumbnail_etag,
                    source_bucket, image_size, source_modified_at, last_error, processed_at
             FROM {table} WHERE image_name = ?",
            table = self.table
        ))
        .bind(image_name)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }

    async fn list(
        &self,
        status: Option<ProcessingStatus>,
        limit: u32,
    ) -> MetadataResult<Vec<ProcessingRecord>> {
        let limit = i64::from(limit.clamp(1, MAX_LIST_LIMIT));
        let records = sqlx::query_as::<_, ProcessingRecord>(&format!(
            "SELECT image_name, status, thumbnail_location, thumbnail_etag,
                    source_bucket, image_size, source_modified_at, last_error, processed_at
             FROM {table}
             WHERE (? IS NULL OR status = ?)
             ORDER BY processed_at DESC, image_name ASC
             LIMIT ?",
            table = self.table
        ))
        .bind(status)
        .bind(status)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(records)
    }
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    record: &'q ProcessingRecord,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&record.image_name)
        .bind(record.status)
        .bind(&record.thumbnail_location)
        .bind(&record.thumbnail_etag)
        .bind(&record.source_bucket)
        .bind(record.image_size)
        .bind(record.source_modified_at)
        .bind(&record.last_error)
        .bind(record.processed_at)
}
