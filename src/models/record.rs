//! Processing records: the persisted outcome of processing one image.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Longest diagnostic kept in `last_error`.
pub const MAX_ERROR_LEN: usize = 512;

/// Processing state of one image.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Succeeded,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "PENDING",
            ProcessingStatus::Succeeded => "SUCCEEDED",
            ProcessingStatus::Failed => "FAILED",
        }
    }

    /// Parse the wire form, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PENDING" => Some(ProcessingStatus::Pending),
            "SUCCEEDED" => Some(ProcessingStatus::Succeeded),
            "FAILED" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an image, derived from the source object key.
///
/// The same value names the source object, the artifact and the metadata
/// record, so it never changes once a record exists.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageName(String);

impl ImageName {
    /// Derive the identity from a (decoded) object key.
    pub fn from_key(key: &str) -> Result<Self, InvalidImageName> {
        crate::services::object_store::validate_object_key(key)
            .map_err(|_| InvalidImageName(key.to_string()))?;
        Ok(Self(key.to_string()))
    }

    /// Key of the thumbnail in the artifact bucket.
    pub fn artifact_key(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("object key `{0}` cannot be used as an image name")]
pub struct InvalidImageName(pub String);

/// One row of the metadata index.
///
/// Every write replaces the whole row, so a record always describes a single
/// invocation: location and etag are present only on `SUCCEEDED`, the error
/// only on `FAILED`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRecord {
    pub image_name: String,
    pub status: ProcessingStatus,
    pub thumbnail_location: Option<String>,
    pub thumbnail_etag: Option<String>,
    pub source_bucket: String,
    pub image_size: i64,
    /// Creation time of the source object, once it has been read.
    pub source_modified_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn pending(image_name: &ImageName, source_bucket: &str, image_size: i64) -> Self {
        Self {
            image_name: image_name.to_string(),
            status: ProcessingStatus::Pending,
            thumbnail_location: None,
            thumbnail_etag: None,
            source_bucket: source_bucket.to_string(),
            image_size,
            source_modified_at: None,
            last_error: None,
            processed_at: Utc::now(),
        }
    }

    pub fn succeeded(
        image_name: &ImageName,
        source_bucket: &str,
        image_size: i64,
        thumbnail_location: String,
        thumbnail_etag: String,
    ) -> Self {
        Self {
            image_name: image_name.to_string(),
            status: ProcessingStatus::Succeeded,
            thumbnail_location: Some(thumbnail_location),
            thumbnail_etag: Some(thumbnail_etag),
            source_bucket: source_bucket.to_string(),
            image_size,
            source_modified_at: None,
            last_error: None,
            processed_at: Utc::now(),
        }
    }

    pub fn failed(
        image_name: &ImageName,
        source_bucket: &str,
        image_size: i64,
        error: impl fmt::Display,
    ) -> Self {
        Self {
            image_name: image_name.to_string(),
            status: ProcessingStatus::Failed,
            thumbnail_location: None,
            thumbnail_etag: None,
            source_bucket: source_bucket.to_string(),
            image_size,
            source_modified_at: None,
            last_error: Some(truncate_diagnostic(&error.to_string())),
            processed_at: Utc::now(),
        }
    }

    pub fn with_source_modified_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.source_modified_at = at;
        self
    }
}

/// Cut a diagnostic down to `MAX_ERROR_LEN` bytes on a char boundary.
fn truncate_diagnostic(message: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        return "unknown error".to_string();
    }
    if message.len() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_rejects_unsafe_keys() {
        assert!(ImageName::from_key("cat.jpg").is_ok());
        assert!(ImageName::from_key("photos/2025/cat.jpg").is_ok());
        assert!(ImageName::from_key("").is_err());
        assert!(ImageName::from_key("/etc/passwd").is_err());
        assert!(ImageName::from_key("a/../b.jpg").is_err());
        assert!(ImageName::from_key("bad\nname.jpg").is_err());
    }

    #[test]
    fn failed_record_keeps_short_non_empty_diagnostic() {
        let name = ImageName::from_key("broken.txt").unwrap();

        let record = ProcessingRecord::failed(&name, "uploads", 9, "x".repeat(2000));
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert_eq!(record.last_error.as_deref().map(str::len), Some(MAX_ERROR_LEN));
        assert!(record.thumbnail_location.is_none());

        let blank = ProcessingRecord::failed(&name, "uploads", 9, "   ");
        assert_eq!(blank.last_error.as_deref(), Some("unknown error"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let message = "é".repeat(MAX_ERROR_LEN);
        let cut = truncate_diagnostic(&message);
        assert!(cut.len() <= MAX_ERROR_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(ProcessingStatus::parse("failed"), Some(ProcessingStatus::Failed));
        assert_eq!(ProcessingStatus::parse("SUCCEEDED"), Some(ProcessingStatus::Succeeded));
        assert_eq!(ProcessingStatus::parse("done"), None);
        assert_eq!(ProcessingStatus::Pending.to_string(), "PENDING");
    }

    #[test]
    fn record_serializes_with_camel_case_fields() {
        let name = ImageName::from_key("cat.jpg").unwrap();
        let record = ProcessingRecord::succeeded(
            &name,
            "uploads",
            2048,
            "thumbnails/cat.jpg".into(),
            "abc".into(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["imageName"], "cat.jpg");
        assert_eq!(json["status"], "SUCCEEDED");
        assert_eq!(json["thumbnailLocation"], "thumbnails/cat.jpg");
    }
}
