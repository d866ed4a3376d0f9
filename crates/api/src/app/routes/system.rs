use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::app::dto::HealthResponse;
use crate::app::services::AppServices;

/// GET /health
///
/// 503 once shutdown has completed.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> Response {
    let stopping = services.host_token().is_cancelled();
    let body = HealthResponse {
        status: if stopping { "shutting_down" } else { "ok" },
        jobs: services.machine.list().len(),
        connections: services.streams.connections().len(),
        child_processes: services.processes.len(),
    };
    let status = if stopping {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body)).into_response()
}
