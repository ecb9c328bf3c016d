use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use streamforge_core::CoreError;
use streamforge_events::BrokerError;
use streamforge_infra::jobs::QueueError;
use streamforge_infra::repos::RepositoryError;

/// Errors a handler can return.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::Repository(RepositoryError::AlreadyExists(id)) => json_error(
                StatusCode::CONFLICT,
                "conflict",
                format!("request {id} already exists"),
            ),
            ApiError::Repository(RepositoryError::NotFound(id)) => json_error(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("request {id} not found"),
            ),
            ApiError::Repository(e) => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
            }
            ApiError::Queue(QueueError::AlreadyExists(id)) => json_error(
                StatusCode::CONFLICT,
                "conflict",
                format!("job {id} already exists"),
            ),
            ApiError::Queue(e) => {
                json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_error", e.to_string())
            }
            ApiError::Broker(e) => json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string()),
            ApiError::Internal(msg) => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
