use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
};

use streamforge_infra::jobs::JobQueue;

use crate::app::dto::{HealthResponse, QueueDepthResponse};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_connections: services.connections.total_connections(),
        streaming_requests: services.connections.tracked_requests(),
        cancellation_tokens: services.cancellation.len(),
    })
}

/// GET /queues/:queue/depth
pub async fn queue_depth(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
) -> Result<Json<QueueDepthResponse>, ApiError> {
    let backend = services.queue.name();
    let (queue, depth) = tokio::task::spawn_blocking(move || {
        let depth = services.queue.inspect_queue_length(&queue);
        (queue, depth)
    })
    .await?;

    Ok(Json(QueueDepthResponse {
        queue,
        backend,
        depth: depth?,
    }))
}
