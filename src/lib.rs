//! Event-driven thumbnail pipeline.
//!
//! Uploads into the source bucket become creation events; the dispatcher
//! hands each one to [`services::pipeline::ThumbnailPipeline`], which reads
//! the object, writes a JPEG thumbnail to the artifact bucket and records the
//! outcome in the metadata table.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
