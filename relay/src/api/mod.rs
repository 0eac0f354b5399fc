use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use shared_types::{StatusRequest, WorkerStatus};
use tracing::warn;

use crate::{auth::check_broker_secret, error::RelayError, AppState};

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connectedWorkers": state.hub.connections.len(),
        "pendingRequests": state.hub.pending.len(),
    }))
}

/// POST /api/local-proxy/status
pub async fn worker_status(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<WorkerStatus>, RelayError> {
    let Json(request) = payload?;
    state.hub.status(&request).map(Json)
}

/// GET /admin/workers (bearer broker secret)
pub async fn list_workers(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = check_broker_secret(&headers, state.config.broker_secret.as_deref()) {
        warn!(error = %e, "admin worker listing rejected");
        return e.into_response();
    }
    Json(state.hub.snapshot()).into_response()
}
