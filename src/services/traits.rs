//! Store abstractions the pipeline is written against.
//!
//! The local `ObjectStore` implements the two object-store seams and
//! `SqliteMetadataStore` the metadata seam; tests inject failing doubles.

use crate::models::event::ObjectCreatedEvent;
use crate::models::object::{PutReceipt, SourceObject};
use crate::models::record::{ProcessingRecord, ProcessingStatus};
use crate::services::metadata_store::MetadataResult;
use crate::services::object_store::StorageResult;
use crate::services::pipeline::{Outcome, PipelineError};
use async_trait::async_trait;
use bytes::Bytes;

/// Read side of the store that receives uploads.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetch an object with its payload.
    ///
    /// Fails with `ObjectNotFound` or `AccessDenied` when the object cannot
    /// be read.
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<SourceObject>;
}

/// Write side of the store that holds thumbnails.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write `body` at `bucket/key`, replacing whatever was there.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<PutReceipt>;

    /// Diagnostics only; never consulted to skip work.
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool>;
}

/// Something that can process one creation event. The dispatcher only
/// knows about this seam.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ObjectCreatedEvent) -> Result<Outcome, PipelineError>;
}

/// Key-value index of processing records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Replace the record stored under `record.image_name`.
    async fn upsert(&self, record: &ProcessingRecord) -> MetadataResult<()>;

    /// Store `record` only if no record exists for its image name.
    /// Returns true when the record was written.
    async fn insert_if_absent(&self, record: &ProcessingRecord) -> MetadataResult<bool>;

    async fn get(&self, image_name: &str) -> MetadataResult<Option<ProcessingRecord>>;

    /// Most recently processed records first.
    async fn list(
        &self,
        status: Option<ProcessingStatus>,
        limit: u32,
    ) -> MetadataResult<Vec<ProcessingRecord>>;
}
