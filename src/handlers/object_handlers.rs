//! HTTP handlers for object operations.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `ObjectStore`. Uploads into the source bucket are announced
//! to the dispatcher as `ObjectCreated:Put` events.

use crate::{
    errors::AppError, models::event::ObjectCreatedEvent, models::object::StoredObject,
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::io;
use tokio_util::io::ReaderStream;

/// Upload an object to `/{bucket}/{*key}`.
pub async fn upload_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));

    let object = state
        .objects
        .upload_object_stream(&bucket, &key, content_type, stream)
        .await?;

    // the object is stored either way; a lost event is repaired by re-posting it
    if bucket == state.source_bucket {
        let event = ObjectCreatedEvent::put(&bucket, &key, object.size_bytes.max(0) as u64);
        match state.dispatcher.submit(event).await {
            Ok(()) => tracing::info!(bucket = %bucket, key = %key, "upload queued for processing"),
            Err(err) => tracing::warn!(
                bucket = %bucket,
                key = %key,
                error = %err,
                "upload stored but not queued for processing"
            ),
        }
    }

    let mut resp_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", object.etag)) {
        resp_headers.insert(header::ETAG, value);
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = resp_headers;
    Ok(response)
}

/// Download an object `/{bucket}/{*key}` as a streaming response.
pub async fn get_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (meta, file) = state.objects.get_object_reader(&bucket, &key).await?;
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// HEAD `/{bucket}/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let meta = state.objects.get_object_metadata(&bucket, &key).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0)),
    );

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
