//! Operational routes served by the daemon.
//!
//! - `GET /healthz` liveness
//! - `GET /readyz`  readiness of the record and blob stores
//!
//! Job operations are a library API and are not exposed over HTTP.

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
};
use axum::{Router, routing::get};

/// Build the router. State is attached by the caller with `with_state`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
