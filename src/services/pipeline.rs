//! src/services/pipeline.rs
//!
//! ThumbnailPipeline: handles one object creation event end to end:
//!
//! 1. derive the image name from the object key and open a PENDING record
//!    if none exists yet,
//! 2. read the source object,
//! 3. generate the thumbnail,
//! 4. write it to the artifact bucket under the image name,
//! 5. record SUCCEEDED with the artifact location.
//!
//! Failures in steps 2–4 are recorded as FAILED and then returned to the
//! caller. Every write is keyed by the image name and overwrites, so
//! running the same event again (duplicate delivery, retry) converges on
//! the same record. Invocations for one image are serialized within the
//! process so the thumbnail and the record always come from the same run.
//!
//! Only events for the configured source bucket are processed. The image
//! name is the bare object key, so admitting a second bucket would let two
//! different objects share one record.

use crate::config::PipelineConfig;
use crate::models::event::ObjectCreatedEvent;
use crate::models::object::PutReceipt;
use crate::models::record::{ImageName, ProcessingRecord};
use crate::services::image_locks::ImageLocks;
use crate::services::metadata_store::MetadataError;
use crate::services::object_store::StorageError;
use crate::services::thumbnail_engine::{
    THUMBNAIL_CONTENT_TYPE, ThumbnailEngine, TransformError,
};
use crate::services::traits::{ArtifactStore, EventHandler, MetadataStore, SourceStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Whether a failure can succeed on a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Infrastructure trouble; re-running the pipeline may succeed.
    Transient,
    /// The input will never become processable.
    Terminal,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("failed to read source object `{bucket}/{key}`: {source}")]
    SourceRead {
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("failed to write thumbnail `{bucket}/{key}`: {source}")]
    ArtifactWrite {
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("failed to update metadata for `{image_name}`: {source}")]
    MetadataWrite {
        image_name: String,
        #[source]
        source: MetadataError,
    },
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::InvalidEvent(_) | PipelineError::Transform(_) => ErrorClass::Terminal,
            PipelineError::SourceRead {
                source: StorageError::InvalidObjectKey(_) | StorageError::InvalidBucketName { .. },
                ..
            } => ErrorClass::Terminal,
            PipelineError::SourceRead { .. }
            | PipelineError::ArtifactWrite { .. }
            | PipelineError::MetadataWrite { .. } => ErrorClass::Transient,
        }
    }

    /// Short stable name, used as the prefix of recorded diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidEvent(_) => "InvalidEvent",
            PipelineError::SourceRead { .. } => "SourceReadError",
            PipelineError::Transform(_) => "TransformError",
            PipelineError::ArtifactWrite { .. } => "ArtifactWriteError",
            PipelineError::MetadataWrite { .. } => "MetadataWriteError",
        }
    }

    /// `"<kind>: <message>"`, the form stored in `last_error`.
    pub fn diagnostic(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

/// What happened to an event that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Processed(ProcessingRecord),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Not an `ObjectCreated:*` event.
    NotObjectCreated,
    /// The object lives in the artifact bucket; thumbnails do not get
    /// thumbnails.
    ArtifactBucket,
    /// Any other bucket that is not the source bucket.
    ForeignBucket,
}

/// What the pipeline learned about the source object so far.
#[derive(Debug)]
struct SourceFacts {
    size: i64,
    modified_at: Option<DateTime<Utc>>,
}

/// The event handler. Shared by all dispatcher workers.
pub struct ThumbnailPipeline {
    config: PipelineConfig,
    source: Arc<dyn SourceStore>,
    artifacts: Arc<dyn ArtifactStore>,
    metadata: Arc<dyn MetadataStore>,
    engine: ThumbnailEngine,
    locks: ImageLocks,
}

impl ThumbnailPipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn SourceStore>,
        artifacts: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let engine = ThumbnailEngine::new(config.thumbnail);
        Self {
            config,
            source,
            artifacts,
            metadata,
            engine,
            locks: ImageLocks::new(),
        }
    }

    /// Process one event. Returns the terminal record on success.
    pub async fn handle(&self, event: &ObjectCreatedEvent) -> Result<Outcome, PipelineError> {
        if !event.is_object_created() {
            debug!(event_name = %event.event_name, key = %event.key, "ignoring non-create event");
            return Ok(Outcome::Ignored(IgnoreReason::NotObjectCreated));
        }
        if event.bucket == self.config.artifact_bucket {
            debug!(key = %event.key, "ignoring event from artifact bucket");
            return Ok(Outcome::Ignored(IgnoreReason::ArtifactBucket));
        }
        if event.bucket != self.config.source_bucket {
            debug!(bucket = %event.bucket, key = %event.key, "ignoring event from foreign bucket");
            return Ok(Outcome::Ignored(IgnoreReason::ForeignBucket));
        }

        let image_name = ImageName::from_key(&event.key)
            .map_err(|err| PipelineError::InvalidEvent(err.to_string()))?;

        let span = info_span!("process_image", image_name = %image_name, bucket = %event.bucket);
        async {
            let _guard = self.locks.lock(image_name.artifact_key()).await;
            self.process(event, image_name).await
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        event: &ObjectCreatedEvent,
        image_name: ImageName,
    ) -> Result<Outcome, PipelineError> {
        let declared_size = event
            .size
            .map(|size| i64::try_from(size).unwrap_or(i64::MAX))
            .unwrap_or_default();

        let pending = ProcessingRecord::pending(&image_name, &event.bucket, declared_size);
        let created = self
            .metadata
            .insert_if_absent(&pending)
            .await
            .map_err(|source| PipelineError::MetadataWrite {
                image_name: image_name.to_string(),
                source,
            })?;
        if created {
            debug!("opened pending record");
        }

        let mut facts = SourceFacts {
            size: declared_size,
            modified_at: None,
        };
        match self.produce(event, &image_name, &mut facts).await {
            Ok(receipt) => {
                let record = ProcessingRecord::succeeded(
                    &image_name,
                    &event.bucket,
                    facts.size,
                    receipt.location(),
                    receipt.etag,
                )
                .with_source_modified_at(facts.modified_at);
                self.metadata.upsert(&record).await.map_err(|source| {
                    PipelineError::MetadataWrite {
                        image_name: image_name.to_string(),
                        source,
                    }
                })?;
                info!(location = ?record.thumbnail_location, "thumbnail created");
                Ok(Outcome::Processed(record))
            }
            Err(err) => {
                let record = ProcessingRecord::failed(
                    &image_name,
                    &event.bucket,
                    facts.size,
                    err.diagnostic(),
                )
                .with_source_modified_at(facts.modified_at);
                if let Err(write_err) = self.metadata.upsert(&record).await {
                    error!(error = %write_err, "could not record failure");
                }
                warn!(kind = err.kind(), error = %err, "processing failed");
                Err(err)
            }
        }
    }

    /// Steps 2–4: read, transform, write. `facts` is filled in from the
    /// source object once the read succeeds.
    async fn produce(
        &self,
        event: &ObjectCreatedEvent,
        image_name: &ImageName,
        facts: &mut SourceFacts,
    ) -> Result<PutReceipt, PipelineError> {
        let limit = self.config.max_source_bytes;
        if let Some(size) = event.size.filter(|size| *size > limit) {
            return Err(TransformError::LimitsExceeded(format!(
                "object is {} bytes, limit is {}",
                size, limit
            ))
            .into());
        }

        let object = self
            .source
            .get(&event.bucket, &event.key)
            .await
            .map_err(|source| PipelineError::SourceRead {
                bucket: event.bucket.clone(),
                key: event.key.clone(),
                source,
            })?;
        facts.size = object.body.len() as i64;
        facts.modified_at = Some(object.meta.last_modified);
        if object.body.len() as u64 > limit {
            return Err(TransformError::LimitsExceeded(format!(
                "object is {} bytes, limit is {}",
                object.body.len(),
                limit
            ))
            .into());
        }

        let engine = self.engine;
        let body = object.body;
        let thumbnail = tokio::task::spawn_blocking(move || engine.generate(&body))
            .await
            .map_err(|err| TransformError::Aborted(err.to_string()))??;
        debug!(
            width = thumbnail.width,
            height = thumbnail.height,
            source_format = ?thumbnail.source_format,
            "generated thumbnail"
        );

        let bucket = &self.config.artifact_bucket;
        let key = image_name.artifact_key();
        match self.artifacts.exists(bucket, key).await {
            Ok(true) => debug!("overwriting existing thumbnail"),
            Ok(false) => {}
            Err(err) => debug!(error = %err, "could not check for existing thumbnail"),
        }

        self.artifacts
            .put(bucket, key, thumbnail.bytes, THUMBNAIL_CONTENT_TYPE)
            .await
            .map_err(|source| PipelineError::ArtifactWrite {
                bucket: bucket.clone(),
                key: key.to_string(),
                source,
            })
    }
}

#[async_trait]
impl EventHandler for ThumbnailPipeline {
    async fn handle(&self, event: &ObjectCreatedEvent) -> Result<Outcome, PipelineError> {
        ThumbnailPipeline::handle(self, event).await
    }
}
