//! Core data models for the thumbnail pipeline.
//!
//! Objects and records map to SQLite rows via `sqlx::FromRow` and serialize
//! as JSON via `serde`; events mirror the S3 notification envelope.

pub mod event;
pub mod object;
pub mod record;
