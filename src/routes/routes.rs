//! Defines routes for the object store and the pipeline.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Pipeline endpoints** (`_` cannot start a bucket name, so no clash)
//!   - `POST   /_pipeline/events`: queue an S3-style notification
//!   - `GET    /_pipeline/records`: list processing records
//!   - `GET    /_pipeline/records/{*image_name}`: one processing record
//!   - `GET    /_pipeline/dead-letters`: events given up on
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}`: upload object (source bucket uploads trigger processing)
//!   - `GET    /{bucket}/{*key}`: download object
//!   - `HEAD   /{bucket}/{*key}`: retrieve metadata only
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{get_object, head_object, upload_object},
        pipeline_handlers::{get_record, list_dead_letters, list_records, post_events},
    },
    state::AppState,
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Build and return the router for all routes.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // pipeline endpoints
        .route("/_pipeline/events", post(post_events))
        .route("/_pipeline/records", get(list_records))
        .route("/_pipeline/records/{*image_name}", get(get_record))
        .route("/_pipeline/dead-letters", get(list_dead_letters))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(upload_object).get(get_object).head(head_object),
        )
}
