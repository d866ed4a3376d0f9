//! HTTP application wiring (axum router + runtime services).
//!
//! - `services.rs`: builds the state machine, broadcaster, streams and shutdown
//! - `pipeline.rs`: the stage executors every submitted job runs through
//! - `routes/`: HTTP handlers
//! - `dto.rs`: request/response shapes
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod pipeline;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router over already-built services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
