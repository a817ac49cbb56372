//! Thumbnail engine - decode, shrink to fit, re-encode as JPEG.
//!
//! Pure and deterministic: the same input bytes and policy always produce
//! the same output bytes. No I/O and no shared state.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageFormat, ImageReader, Limits};
use std::io::Cursor;
use thiserror::Error;

/// Content type of every generated thumbnail.
pub const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("image is empty")]
    Empty,
    #[error("unsupported image format")]
    UnsupportedFormat,
    #[error("image exceeds processing limits: {0}")]
    LimitsExceeded(String),
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("could not encode thumbnail: {0}")]
    Encode(String),
    #[error("thumbnail generation aborted: {0}")]
    Aborted(String),
}

/// Target bounds and quality for generated thumbnails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailPolicy {
    /// Longest allowed width and height of the output.
    pub max_dimension: u32,
    /// JPEG quality, 1–100.
    pub jpeg_quality: u8,
    /// Largest accepted input width or height.
    pub max_input_edge: u32,
    /// Decoder allocation budget in bytes.
    pub max_decode_bytes: u64,
}

impl Default for ThumbnailPolicy {
    fn default() -> Self {
        Self {
            max_dimension: 100,
            jpeg_quality: 75,
            max_input_edge: 16_384,
            max_decode_bytes: 256 * 1024 * 1024,
        }
    }
}

/// A generated thumbnail.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub source_format: ImageFormat,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThumbnailEngine {
    policy: ThumbnailPolicy,
}

impl ThumbnailEngine {
    pub fn new(policy: ThumbnailPolicy) -> Self {
        Self { policy }
    }

    /// Produce a JPEG that fits within `max_dimension` on both axes.
    ///
    /// Aspect ratio is preserved and images already inside the bounds are
    /// re-encoded without scaling.
    pub fn generate(&self, data: &[u8]) -> Result<Thumbnail, TransformError> {
        if data.is_empty() {
            return Err(TransformError::Empty);
        }

        let mut reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|err| TransformError::Decode(err.to_string()))?;
        let source_format = reader.format().ok_or(TransformError::UnsupportedFormat)?;
        reader.limits(self.decode_limits());

        let image = reader.decode().map_err(map_image_error)?;
        let resized = self.fit(image);
        let (width, height) = resized.dimensions();

        let rgb = resized.to_rgb8();
        let mut buffer = Vec::with_capacity((width * height * 3) as usize / 4);
        JpegEncoder::new_with_quality(&mut buffer, self.policy.jpeg_quality)
            .encode_image(&rgb)
            .map_err(|err| TransformError::Encode(err.to_string()))?;

        Ok(Thumbnail {
            bytes: Bytes::from(buffer),
            width,
            height,
            source_format,
        })
    }

    fn decode_limits(&self) -> Limits {
        let mut limits = Limits::default();
        limits.max_image_width = Some(self.policy.max_input_edge);
        limits.max_image_height = Some(self.policy.max_input_edge);
        limits.max_alloc = Some(self.policy.max_decode_bytes);
        limits
    }

    fn fit(&self, image: DynamicImage) -> DynamicImage {
        let bound = self.policy.max_dimension;
        let (width, height) = image.dimensions();
        if width <= bound && height <= bound {
            return image;
        }
        image.resize(bound, bound, FilterType::Lanczos3)
    }
}

fn map_image_error(err: ImageError) -> TransformError {
    match err {
        ImageError::Limits(limit) => TransformError::LimitsExceeded(limit.to_string()),
        ImageError::Unsupported(_) => TransformError::UnsupportedFormat,
        other => TransformError::Decode(other.to_string()),
    }
}
