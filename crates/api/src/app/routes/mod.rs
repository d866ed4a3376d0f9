use axum::{
    Router,
    routing::{get, post},
};

pub mod events;
pub mod jobs;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/jobs/:id/events", get(events::stream_events))
}
