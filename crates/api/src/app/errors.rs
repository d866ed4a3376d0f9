use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use reelforge_jobs::StateError;
use reelforge_streaming::StreamError;

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn state_error_to_response(err: StateError) -> Response {
    match &err {
        StateError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        StateError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_transition", err.to_string())
        }
        StateError::NotRunning { .. } => {
            json_error(StatusCode::CONFLICT, "not_running", err.to_string())
        }
    }
}

pub fn stream_error_to_response(err: StreamError) -> Response {
    match &err {
        StreamError::ShuttingDown => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", err.to_string())
        }
        StreamError::Serialization(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "serialization_error",
            err.to_string(),
        ),
    }
}

pub fn parse_job_id(raw: &str) -> Result<reelforge_core::JobId, Response> {
    raw.parse().map_err(|e: reelforge_core::CoreError| {
        json_error(StatusCode::BAD_REQUEST, "invalid_job_id", e.to_string())
    })
}
