//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata table, disk I/O
//!   and the dispatcher

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness check: always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness check that:
/// 1. Runs `SELECT 1` through the metadata store.
/// 2. Performs a best-effort write/read/delete under the object store `base_path`.
///
/// Also reports how many events are waiting for a final outcome. HTTP 200
/// when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match state.metadata.ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let disk_check = disk_round_trip(&state).await;

    let overall_ok = sqlite_check.ok && disk_check.ok;

    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite_check);
    checks.insert("disk", disk_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        in_flight_events: state.dispatcher.in_flight(),
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn disk_round_trip(state: &AppState) -> CheckStatus {
    let base = &state.objects.base_path;
    if let Err(e) = fs::create_dir_all(base).await {
        return CheckStatus::failed(format!("could not create storage dir: {}", e));
    }
    let tmp_path = base.join(format!(".readyz-{}", Uuid::new_v4()));
    if let Err(e) = fs::write(&tmp_path, b"readyz").await {
        return CheckStatus::failed(format!("could not write tmp file: {}", e));
    }
    let check = match fs::read(&tmp_path).await {
        Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
        Ok(_) => CheckStatus::failed("file content mismatch"),
        Err(e) => CheckStatus::failed(format!("could not read tmp file: {}", e)),
    };
    match fs::remove_file(&tmp_path).await {
        Err(e) if check.ok => CheckStatus {
            ok: true,
            error: Some(format!("could not remove tmp file: {}", e)),
        },
        _ => check,
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    in_flight_events: usize,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}
