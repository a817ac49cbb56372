//! src/services/object_store.rs
//!
//! ObjectStore: the local S3-like store that backs both the source bucket
//! and the artifact bucket. Payloads live on disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{version}`; one SQLite row per
//! `(bucket, key)` carries content type, size, etag, modification time and
//! the payload file of the current version.
//!
//! Every write goes to a fresh version file, so two writers never share a
//! path. The row upsert is the commit point: it swaps in the new payload
//! path and returns the one it replaced, which the winning writer deletes.
//! Readers resolve the payload through the row, so size, etag and bytes
//! always describe the same write.

use crate::models::object::{PutReceipt, SourceObject, StoredObject};
use crate::services::traits::{ArtifactStore, SourceStore};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use sqlx::{FromRow, SqlitePool};
use std::{
    io::{self, ErrorKind},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("access denied to object `{key}` in bucket `{bucket}`")]
    AccessDenied { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Disk + SQLite object store.
///
/// Cheap to clone; clones share the pool and base path.
#[derive(Clone)]
pub struct ObjectStore {
    /// Shared SQLite connection pool used for object rows.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
/// A reader can lose the race against a writer deleting the version it just
/// looked up; it re-reads the row this many times.
const PAYLOAD_OPEN_ATTEMPTS: usize = 3;

const OBJECT_COLUMNS: &str =
    "bucket, key, content_type, size_bytes, etag, last_modified, payload_path";

/// Row returned by the commit upsert.
#[derive(FromRow)]
struct CommittedObject {
    #[sqlx(flatten)]
    object: StoredObject,
    replaced_payload_path: Option<String>,
}

/// Reject keys that could escape the bucket directory.
///
/// Empty keys, keys over 1024 bytes, keys starting with `/`, containing `..`,
/// backslashes or control characters are refused.
pub fn validate_object_key(key: &str) -> StorageResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.contains("..")
        || key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
    if invalid {
        return Err(StorageError::InvalidObjectKey(key.to_string()));
    }
    Ok(())
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn validate_bucket_name(name: &str) -> StorageResult<()> {
    let reject = |reason: &str| {
        Err(StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        })
    };

    if name.trim() != name {
        return reject("cannot begin or end with whitespace");
    }

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return reject("must be between 3 and 63 characters");
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return reject("allowed characters are lowercase letters, digits, dots, and hyphens");
    }

    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return reject("must start and end with a lowercase letter or digit");
    }

    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return reject("cannot contain consecutive dots or dot-hyphen combinations");
    }

    if is_ipv4_like(name) {
        return reject("must not be formatted like an IP address");
    }

    Ok(())
}

impl ObjectStore {
    /// Create a new ObjectStore backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    fn check_address(bucket: &str, key: &str) -> StorageResult<()> {
        validate_bucket_name(bucket)?;
        validate_object_key(key)
    }

    /// Two-level shard identifiers: the first two bytes of MD5(bucket/key)
    /// as lowercase hex (00–ff).
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// `bucket/{shard}/{shard}`, relative to `base_path`. All versions of
    /// one key share this directory.
    fn payload_dir(bucket: &str, key: &str) -> String {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        format!("{}/{}/{}", bucket, shard_a, shard_b)
    }

    fn absolute(&self, payload_path: &str) -> PathBuf {
        self.base_path.join(payload_path)
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(&format!(
            "SELECT {} FROM objects WHERE bucket = ? AND key = ?",
            OBJECT_COLUMNS
        ))
        .bind(bucket)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    fn map_open_error(err: io::Error, bucket: &str, key: &str) -> StorageError {
        match err.kind() {
            ErrorKind::NotFound => StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            ErrorKind::PermissionDenied => StorageError::AccessDenied {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            _ => StorageError::Io(err),
        }
    }

    /// Stream-upload an object to disk and upsert its row.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5/etag and size while streaming.
    /// - Renames the file to a new version name nobody else uses.
    /// - Upserts the row pointing at that version (overwrite semantics).
    /// - Deletes the version the upsert replaced.
    ///
    /// If the upsert fails the new version is removed and the previous one
    /// stays current.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        Self::check_address(bucket, key)?;

        let dir = Self::payload_dir(bucket, key);
        let version = Uuid::new_v4().simple().to_string();
        let payload_path = format!("{}/{}", dir, version);
        let parent = self.absolute(&dir);
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", version));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        let version_path = self.absolute(&payload_path);
        if let Err(err) = fs::rename(&tmp_path, &version_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let etag = format!("{:x}", digest.compute());
        // unqualified columns in DO UPDATE SET read the row being replaced
        let committed = sqlx::query_as::<_, CommittedObject>(&format!(
            r#"
            INSERT INTO objects (bucket, key, content_type, size_bytes, etag, last_modified,
                                 payload_path, replaced_payload_path)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(bucket, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                payload_path = excluded.payload_path,
                replaced_payload_path = payload_path
            RETURNING {}, replaced_payload_path
            "#,
            OBJECT_COLUMNS
        ))
        .bind(bucket)
        .bind(key)
        .bind(content_type)
        .bind(size_bytes)
        .bind(&etag)
        .bind(Utc::now())
        .bind(&payload_path)
        .fetch_one(&*self.db)
        .await;

        let committed = match committed {
            Ok(committed) => committed,
            Err(err) => {
                let _ = fs::remove_file(&version_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        if let Some(replaced) = committed
            .replaced_payload_path
            .filter(|replaced| *replaced != payload_path)
        {
            match fs::remove_file(self.absolute(&replaced)).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(path = %replaced, error = %err, "could not remove replaced payload"),
            }
        }

        let object = committed.object;
        debug!(bucket, key, size_bytes, etag = %object.etag, "stored object");
        Ok(object)
    }

    /// Write a fully buffered payload.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<StoredObject> {
        let body = stream::once(async move { Ok::<_, io::Error>(body) });
        self.upload_object_stream(bucket, key, Some(content_type.to_string()), body)
            .await
    }

    /// Look up the row and open the payload it names.
    ///
    /// A concurrent writer may delete the looked-up version between the two
    /// steps; the row is then read again and points at the newer version.
    async fn open_payload(&self, bucket: &str, key: &str) -> StorageResult<(StoredObject, File)> {
        let mut attempt = 1;
        loop {
            let object = self.fetch_object(bucket, key).await?;
            match File::open(self.absolute(&object.payload_path)).await {
                Ok(file) => return Ok((object, file)),
                Err(err) if err.kind() == ErrorKind::NotFound && attempt < PAYLOAD_OPEN_ATTEMPTS => {
                    attempt += 1;
                }
                Err(err) => return Err(Self::map_open_error(err, bucket, key)),
            }
        }
    }

    /// Fetch an object for streaming out.
    ///
    /// Returns ObjectNotFound if the row exists but the payload is missing.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(StoredObject, File)> {
        Self::check_address(bucket, key)?;
        self.open_payload(bucket, key).await
    }

    /// Read a whole object into memory.
    pub async fn read_object(&self, bucket: &str, key: &str) -> StorageResult<SourceObject> {
        Self::check_address(bucket, key)?;
        let (meta, mut file) = self.open_payload(bucket, key).await?;

        let mut body = Vec::with_capacity(meta.size_bytes.max(0) as usize);
        file.read_to_end(&mut body).await?;

        Ok(SourceObject {
            meta,
            body: Bytes::from(body),
        })
    }

    /// Fetch only the object row.
    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<StoredObject> {
        Self::check_address(bucket, key)?;
        self.fetch_object(bucket, key).await
    }

    /// True when both the row and the payload it names are present.
    pub async fn object_exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        match self.get_object_metadata(bucket, key).await {
            Ok(object) => Ok(fs::try_exists(self.absolute(&object.payload_path)).await?),
            Err(StorageError::ObjectNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl SourceStore for ObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<SourceObject> {
        self.read_object(bucket, key).await
    }
}

#[async_trait]
impl ArtifactStore for ObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<PutReceipt> {
        let object = self.put_object(bucket, key, body, content_type).await?;
        Ok(PutReceipt {
            bucket: object.bucket,
            key: object.key,
            etag: object.etag,
            size_bytes: object.size_bytes,
        })
    }

    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        self.object_exists(bucket, key).await
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
/// Rejects names formatted like `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u8>().is_ok()
    })
}
