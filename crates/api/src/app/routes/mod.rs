use axum::{
    Router,
    routing::{get, post},
};

pub mod requests;
pub mod stream;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/queues/:queue/depth", get(system::queue_depth))
        .route("/enqueue", post(requests::enqueue))
        .route("/requests/:request_id/cancel", post(requests::cancel))
        .route("/stream/:request_id", get(stream::stream_request))
}
