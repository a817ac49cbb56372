#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::{self, Cursor};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tempfile::TempDir;
use thumbnailer::{
    config::PipelineConfig,
    db,
    models::object::{PutReceipt, SourceObject, StoredObject},
    models::record::{ProcessingRecord, ProcessingStatus},
    services::{
        metadata_store::{MetadataError, MetadataResult, SqliteMetadataStore},
        object_store::{ObjectStore, StorageError, StorageResult},
        pipeline::ThumbnailPipeline,
        traits::{ArtifactStore, MetadataStore, SourceStore},
    },
};

pub const SOURCE_BUCKET: &str = "uploads";
pub const ARTIFACT_BUCKET: &str = "thumbnails";
pub const METADATA_TABLE: &str = "image_metadata";

/// Real stores on a temp directory.
pub struct Harness {
    pub dir: TempDir,
    pub objects: ObjectStore,
    pub metadata: SqliteMetadataStore,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(db::connect_file(&dir.path().join("thumbnailer.db")).await.unwrap());
        db::ensure_object_schema(&pool).await.unwrap();
        let metadata = SqliteMetadataStore::new(pool.clone(), METADATA_TABLE).unwrap();
        metadata.ensure_schema().await.unwrap();
        let objects = ObjectStore::new(pool, dir.path().join("objects"));
        Self {
            dir,
            objects,
            metadata,
        }
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::new(SOURCE_BUCKET, ARTIFACT_BUCKET, METADATA_TABLE)
    }

    pub fn pipeline(&self) -> ThumbnailPipeline {
        self.pipeline_with(
            Arc::new(self.objects.clone()),
            Arc::new(self.metadata.clone()),
        )
    }

    pub fn pipeline_with(
        &self,
        artifacts: Arc<dyn ArtifactStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> ThumbnailPipeline {
        ThumbnailPipeline::new(
            self.config(),
            Arc::new(self.objects.clone()),
            artifacts,
            metadata,
        )
    }

    pub async fn upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> u64 {
        let stored = self
            .objects
            .put_object(SOURCE_BUCKET, key, Bytes::from(body), content_type)
            .await
            .unwrap();
        stored.size_bytes as u64
    }

    pub async fn record(&self, image_name: &str) -> Option<ProcessingRecord> {
        self.metadata.get(image_name).await.unwrap()
    }

    pub async fn artifact_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE bucket = ?")
            .bind(ARTIFACT_BUCKET)
            .fetch_one(&*self.objects.db)
            .await
            .unwrap()
    }

    pub async fn artifact(&self, key: &str) -> Option<SourceObject> {
        match self.objects.read_object(ARTIFACT_BUCKET, key).await {
            Ok(object) => Some(object),
            Err(StorageError::ObjectNotFound { .. }) => None,
            Err(err) => panic!("unexpected storage error: {err}"),
        }
    }
}

/// A noisy RGB JPEG of the given size.
pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        let n = x.wrapping_mul(2_654_435_761).wrapping_add(y.wrapping_mul(40_503));
        Rgb([(n >> 3) as u8, (n >> 11) as u8, (x ^ y) as u8])
    });
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
        .unwrap();
    buffer
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([10, 200, 30]));
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .unwrap();
    buffer
}

/// Artifact store whose first `failures` puts fail with an I/O error.
pub struct FlakyArtifactStore {
    pub inner: ObjectStore,
    pub failures: AtomicU32,
    pub puts: AtomicU32,
}

impl FlakyArtifactStore {
    pub fn new(inner: ObjectStore, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: AtomicU32::new(failures),
            puts: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ArtifactStore for FlakyArtifactStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<PutReceipt> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Io(io::Error::other("simulated write failure")));
        }
        ArtifactStore::put(&self.inner, bucket, key, body, content_type).await
    }

    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        ArtifactStore::exists(&self.inner, bucket, key).await
    }
}

/// Metadata store whose first `failures` SUCCEEDED upserts fail.
pub struct FlakyMetadataStore {
    pub inner: SqliteMetadataStore,
    pub failures: AtomicU32,
}

impl FlakyMetadataStore {
    pub fn new(inner: SqliteMetadataStore, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: AtomicU32::new(failures),
        })
    }
}

#[async_trait]
impl MetadataStore for FlakyMetadataStore {
    async fn upsert(&self, record: &ProcessingRecord) -> MetadataResult<()> {
        if record.status == ProcessingStatus::Succeeded
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        {
            return Err(MetadataError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        self.inner.upsert(record).await
    }

    async fn insert_if_absent(&self, record: &ProcessingRecord) -> MetadataResult<bool> {
        self.inner.insert_if_absent(record).await
    }

    async fn get(&self, image_name: &str) -> MetadataResult<Option<ProcessingRecord>> {
        self.inner.get(image_name).await
    }

    async fn list(
        &self,
        status: Option<ProcessingStatus>,
        limit: u32,
    ) -> MetadataResult<Vec<ProcessingRecord>> {
        self.inner.list(status, limit).await
    }
}

/// Source store that hands out its payloads in turn, as if the object were
/// re-uploaded between reads.
pub struct AlternatingSource {
    pub payloads: Vec<Bytes>,
    pub reads: AtomicUsize,
}

impl AlternatingSource {
    pub fn new(payloads: Vec<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            payloads,
            reads: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SourceStore for AlternatingSource {
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<SourceObject> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst);
        let body = self.payloads[read % self.payloads.len()].clone();
        let meta = StoredObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type: None,
            size_bytes: body.len() as i64,
            etag: format!("{:x}", md5::compute(&body)),
            last_modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            payload_path: String::new(),
        };
        Ok(SourceObject { meta, body })
    }
}
