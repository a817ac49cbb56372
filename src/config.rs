use crate::services::metadata_store::validate_table_name;
use crate::services::object_store::validate_bucket_name;
use crate::services::retry::RetryPolicy;
use crate::services::thumbnail_engine::ThumbnailPolicy;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::str::FromStr;
use std::time::Duration;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub pipeline: PipelineConfig,
    pub dispatcher: DispatcherConfig,
}

/// Fixed-at-startup settings handed to the pipeline constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Uploads into this bucket are processed; every other bucket is ignored.
    pub source_bucket: String,
    pub artifact_bucket: String,
    pub metadata_table: String,
    pub max_source_bytes: u64,
    pub thumbnail: ThumbnailPolicy,
}

impl PipelineConfig {
    pub fn new(
        source_bucket: impl Into<String>,
        artifact_bucket: impl Into<String>,
        metadata_table: impl Into<String>,
    ) -> Self {
        Self {
            source_bucket: source_bucket.into(),
            artifact_bucket: artifact_bucket.into(),
            metadata_table: metadata_table.into(),
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            thumbnail: ThumbnailPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }
}

const DEFAULT_MAX_SOURCE_BYTES: u64 = 20 * 1024 * 1024;

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Event-driven thumbnail pipeline")]
pub struct Args {
    /// Host to bind to (overrides THUMBNAILER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides THUMBNAILER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides THUMBNAILER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides THUMBNAILER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket whose uploads trigger processing (overrides SOURCE_BUCKET)
    #[arg(long)]
    pub source_bucket: Option<String>,

    /// Bucket receiving thumbnails (overrides ARTIFACT_BUCKET)
    #[arg(long)]
    pub artifact_bucket: Option<String>,

    /// Table holding processing records (overrides METADATA_TABLE)
    #[arg(long)]
    pub metadata_table: Option<String>,

    /// Longest thumbnail edge in pixels (overrides THUMBNAIL_MAX_DIMENSION)
    #[arg(long)]
    pub max_dimension: Option<u32>,

    /// JPEG quality 1-100 (overrides THUMBNAIL_JPEG_QUALITY)
    #[arg(long)]
    pub jpeg_quality: Option<u8>,

    /// Largest source object processed (overrides MAX_SOURCE_BYTES)
    #[arg(long)]
    pub max_source_bytes: Option<u64>,

    /// Parallel handler invocations (overrides DISPATCH_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Queued events before submitters wait (overrides DISPATCH_QUEUE_CAPACITY)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Attempts per event, first delivery included (overrides RETRY_MAX_ATTEMPTS)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Delay before the first retry (overrides RETRY_BASE_DELAY_MS)
    #[arg(long)]
    pub retry_base_delay_ms: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| std::env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over the variables `env` yields; CLI wins.
    pub fn from_sources(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |names: &[&str], default: &str| {
            names
                .iter()
                .find_map(|name| env(*name))
                .unwrap_or_else(|| default.to_string())
        };
        let number = |name: &str| parse_env::<u64>(&env, name);

        let thumbnail_defaults = ThumbnailPolicy::default();
        let retry_defaults = RetryPolicy::default();
        let dispatch_defaults = DispatcherConfig::default();

        let port = match args.port {
            Some(port) => port,
            None => parse_env(&env, "THUMBNAILER_PORT")?.unwrap_or(3000),
        };
        let max_dimension = match args.max_dimension {
            Some(value) => value,
            None => parse_env(&env, "THUMBNAIL_MAX_DIMENSION")?
                .unwrap_or(thumbnail_defaults.max_dimension),
        };
        let jpeg_quality = match args.jpeg_quality {
            Some(value) => value,
            None => parse_env(&env, "THUMBNAIL_JPEG_QUALITY")?
                .unwrap_or(thumbnail_defaults.jpeg_quality),
        };
        let max_source_bytes = match args.max_source_bytes {
            Some(value) => value,
            None => number("MAX_SOURCE_BYTES")?.unwrap_or(DEFAULT_MAX_SOURCE_BYTES),
        };
        let workers = match args.workers {
            Some(value) => value,
            None => parse_env(&env, "DISPATCH_WORKERS")?.unwrap_or(dispatch_defaults.workers),
        };
        let queue_capacity = match args.queue_capacity {
            Some(value) => value,
            None => parse_env(&env, "DISPATCH_QUEUE_CAPACITY")?
                .unwrap_or(dispatch_defaults.queue_capacity),
        };
        let max_attempts = match args.max_attempts {
            Some(value) => value,
            None => parse_env(&env, "RETRY_MAX_ATTEMPTS")?.unwrap_or(retry_defaults.max_attempts),
        };
        let base_delay = match args.retry_base_delay_ms {
            Some(ms) => Duration::from_millis(ms),
            None => number("RETRY_BASE_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.base_delay),
        };

        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| text(&["THUMBNAILER_HOST"], "0.0.0.0")),
            port,
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| text(&["THUMBNAILER_STORAGE_DIR"], "./data/objects")),
            database_url: args.database_url.unwrap_or_else(|| {
                text(
                    &["THUMBNAILER_DATABASE_URL"],
                    "sqlite://./data/meta/thumbnailer.db",
                )
            }),
            pipeline: PipelineConfig {
                source_bucket: args
                    .source_bucket
                    .unwrap_or_else(|| text(&["SOURCE_BUCKET"], "uploads")),
                artifact_bucket: args.artifact_bucket.unwrap_or_else(|| {
                    text(&["ARTIFACT_BUCKET", "THUMBNAIL_BUCKET"], "thumbnails")
                }),
                metadata_table: args.metadata_table.unwrap_or_else(|| {
                    text(&["METADATA_TABLE", "DYNAMODB_TABLE"], "image_metadata")
                }),
                max_source_bytes,
                thumbnail: ThumbnailPolicy {
                    max_dimension,
                    jpeg_quality,
                    ..thumbnail_defaults
                },
            },
            dispatcher: DispatcherConfig {
                workers,
                queue_capacity,
                retry: RetryPolicy {
                    max_attempts,
                    base_delay,
                    ..retry_defaults
                },
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;
        validate_bucket_name(&pipeline.source_bucket).context("SOURCE_BUCKET")?;
        validate_bucket_name(&pipeline.artifact_bucket).context("ARTIFACT_BUCKET")?;
        if pipeline.source_bucket == pipeline.artifact_bucket {
            bail!(
                "source and artifact bucket must differ (both `{}`)",
                pipeline.source_bucket
            );
        }
        validate_table_name(&self.pipeline.metadata_table).context("METADATA_TABLE")?;

        let thumbnail = &self.pipeline.thumbnail;
        if thumbnail.max_dimension == 0 {
            bail!("thumbnail max dimension must be positive");
        }
        if !(1..=100).contains(&thumbnail.jpeg_quality) {
            bail!(
                "JPEG quality must be between 1 and 100, got {}",
                thumbnail.jpeg_quality
            );
        }
        if self.pipeline.max_source_bytes == 0 {
            bail!("max source bytes must be positive");
        }
        if self.dispatcher.workers == 0 {
            bail!("dispatcher needs at least one worker");
        }
        if self.dispatcher.queue_capacity == 0 {
            bail!("dispatch queue capacity must be positive");
        }
        if self.dispatcher.retry.max_attempts == 0 {
            bail!("retry max attempts must be at least 1");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(None),
    }
}
