use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::app::dto::{CancelResponse, JobView};
use crate::app::errors;
use crate::app::services::AppServices;

/// POST /jobs
pub async fn create_job(Extension(services): Extension<Arc<AppServices>>) -> Response {
    if services.host_token().is_cancelled() {
        return errors::json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            "server is shutting down",
        );
    }
    let job = services.submit();
    (StatusCode::ACCEPTED, Json(JobView::from(job))).into_response()
}

/// GET /jobs
pub async fn list_jobs(Extension(services): Extension<Arc<AppServices>>) -> Response {
    let mut jobs = services.machine.list();
    jobs.sort_by_key(|job| job.created_utc);
    let views: Vec<JobView> = jobs.into_iter().map(JobView::from).collect();
    Json(views).into_response()
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.machine.get(job_id) {
        Ok(job) => Json(JobView::from(job)).into_response(),
        Err(err) => errors::state_error_to_response(err),
    }
}

/// POST /jobs/:id/cancel
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.cancel(job_id) {
        Ok((job, cleanup_scheduled)) => Json(CancelResponse {
            canceled: true,
            cleanup_scheduled,
            job: JobView::from(job),
        })
        .into_response(),
        Err(err) => errors::state_error_to_response(err),
    }
}
