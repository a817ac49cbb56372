//! Object creation events.
//!
//! Notifications arrive in the S3 envelope shape (`Records[].s3.bucket.name`,
//! `Records[].s3.object.key`) and are flattened into [`ObjectCreatedEvent`]s
//! before they reach the dispatcher.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

/// Event name emitted for uploads through the local object store.
pub const OBJECT_CREATED_PUT: &str = "ObjectCreated:Put";

const OBJECT_CREATED_PREFIX: &str = "ObjectCreated";

#[derive(Debug, Deserialize)]
pub struct S3Event {
    #[serde(rename = "Records", default)]
    pub records: Vec<S3Record>,
}

#[derive(Debug, Deserialize)]
pub struct S3Record {
    #[serde(rename = "eventName")]
    pub event_name: String,
    pub s3: S3Entity,
}

#[derive(Debug, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct S3Object {
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// One delivery unit for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectCreatedEvent {
    pub bucket: String,
    pub key: String,
    pub size: Option<u64>,
    pub event_name: String,
}

impl ObjectCreatedEvent {
    pub fn put(bucket: impl Into<String>, key: impl Into<String>, size: u64) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            size: Some(size),
            event_name: OBJECT_CREATED_PUT.to_string(),
        }
    }

    /// Only creation events are processed; deletes, restores etc. are not.
    pub fn is_object_created(&self) -> bool {
        self.event_name.starts_with(OBJECT_CREATED_PREFIX)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    #[error("object key `{0}` is not valid percent-encoded UTF-8")]
    UndecodableKey(String),
}

impl S3Event {
    /// Flatten the envelope into events with decoded keys.
    pub fn into_events(self) -> Result<Vec<ObjectCreatedEvent>, EventError> {
        self.records
            .into_iter()
            .map(|record| {
                Ok(ObjectCreatedEvent {
                    bucket: record.s3.bucket.name,
                    key: decode_object_key(&record.s3.object.key)?,
                    size: record.s3.object.size,
                    event_name: record.event_name,
                })
            })
            .collect()
    }
}

/// Notification keys are form-encoded: `+` is a space, everything else is
/// percent-encoded.
pub fn decode_object_key(raw: &str) -> Result<String, EventError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| EventError::UndecodableKey(raw.to_string()))
}
