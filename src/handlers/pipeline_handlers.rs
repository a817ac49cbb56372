//! Pipeline endpoints, mounted under `/_pipeline`.
//!
//! - POST /_pipeline/events               -> queue an S3-style notification
//! - GET  /_pipeline/records              -> list records (?status=&limit=)
//! - GET  /_pipeline/records/{*image}     -> one record
//! - GET  /_pipeline/dead-letters         -> events that will not be retried

use crate::{
    errors::AppError,
    models::event::S3Event,
    models::record::{ProcessingRecord, ProcessingStatus},
    services::dispatcher::DeadLetter,
    services::traits::MetadataStore,
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

const DEFAULT_LIST_LIMIT: u32 = 50;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventsAccepted {
    pub accepted: usize,
    pub ignored: usize,
}

#[derive(Debug, Deserialize)]
pub struct ListRecordsQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

/// `POST /_pipeline/events`
///
/// Queues every `ObjectCreated:*` record for the source bucket. Other event
/// types and other buckets are counted as ignored and not queued.
pub async fn post_events(
    State(state): State<AppState>,
    Json(notification): Json<S3Event>,
) -> Result<impl IntoResponse, AppError> {
    let events = notification
        .into_events()
        .map_err(|err| AppError::bad_request(err.to_string()))?;

    let mut accepted = 0;
    let mut ignored = 0;
    for event in events {
        if !event.is_object_created() || event.bucket != state.source_bucket {
            ignored += 1;
            continue;
        }
        state.dispatcher.submit(event).await?;
        accepted += 1;
    }
    tracing::info!(accepted, ignored, "notification received");

    Ok((StatusCode::ACCEPTED, Json(EventsAccepted { accepted, ignored })))
}

/// `GET /_pipeline/records/{*image_name}`
pub async fn get_record(
    State(state): State<AppState>,
    Path(image_name): Path<String>,
) -> Result<Json<ProcessingRecord>, AppError> {
    state
        .metadata
        .get(&image_name)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no record for `{}`", image_name)))
}

/// `GET /_pipeline/records?status=FAILED&limit=50`
pub async fn list_records(
    State(state): State<AppState>,
    Query(q): Query<ListRecordsQuery>,
) -> Result<Json<Vec<ProcessingRecord>>, AppError> {
    let status = match q.status.as_deref() {
        Some(raw) => Some(
            ProcessingStatus::parse(raw)
                .ok_or_else(|| AppError::bad_request(format!("unknown status `{}`", raw)))?,
        ),
        None => None,
    };
    let records = state
        .metadata
        .list(status, q.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(records))
}

/// `GET /_pipeline/dead-letters`
pub async fn list_dead_letters(State(state): State<AppState>) -> Json<Vec<DeadLetter>> {
    Json(state.dispatcher.dead_letters().await)
}
