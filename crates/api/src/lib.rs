//! HTTP surface of the job runtime: configuration, service wiring and routes.

pub mod app;
pub mod config;

pub use app::build_app;
pub use app::services::AppServices;
pub use config::{AppConfig, ConfigError};
