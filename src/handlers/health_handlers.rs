//! Health & readiness handlers.
//!
//! - GET /healthz  -> liveness ("ok")
//! - GET /readyz   -> readiness of the record store and the blob store

use crate::handlers::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// `GET /healthz`
///
/// Never performs I/O.
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
/// Pings the record store and runs a write/read/delete probe against the blob
/// store. HTTP 200 when both pass, 503 otherwise; the body lists each check.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let records = match state.records.ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(err) => CheckStatus::failed(err.to_string()),
    };
    let blobs = match state.blobs.probe().await {
        Ok(()) => CheckStatus::ok(),
        Err(err) => CheckStatus::failed(err.to_string()),
    };

    let overall_ok = records.ok && blobs.ok;
    if !overall_ok {
        warn!(
            records = ?records.error,
            blobs = ?blobs.error,
            "readiness check failed"
        );
    }

    let mut checks = BTreeMap::new();
    checks.insert("records", records);
    checks.insert("blobs", blobs);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: BTreeMap<&'static str, CheckStatus>,
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

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
