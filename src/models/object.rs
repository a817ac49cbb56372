//! Represents an object (file) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A single object row in the local object store.
///
/// The row describes the payload and names the file holding it; readers
/// always go through the row, so replacing the row is what publishes a
/// new version.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Bucket the object lives in.
    pub bucket: String,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the payload.
    pub etag: String,

    /// Timestamp of the last write.
    pub last_modified: DateTime<Utc>,

    /// Payload file relative to the store's base path.
    #[serde(skip)]
    pub payload_path: String,
}

/// An object read back from the source store together with its payload.
#[derive(Debug, Clone)]
pub struct SourceObject {
    pub meta: StoredObject,
    pub body: bytes::Bytes,
}

/// Result of an artifact write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size_bytes: i64,
}

impl PutReceipt {
    pub fn location(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}
