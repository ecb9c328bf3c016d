//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: queue/broker/worker wiring shared by every handler
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(services: Arc<AppServices>) -> Router {
    routes::router()
        .layer(Extension(services))
        .layer(ServiceBuilder::new())
}
