//! Enqueue and cancel.
//!
//! Queue, repository and broker calls block, so handlers run them on the
//! blocking pool.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use tracing::{info, warn};

use streamforge_core::{RequestId, RequestStatus};
use streamforge_events::ControlMessage;
use streamforge_infra::jobs::{GenerationPayload, Job, JobQueue};
use streamforge_infra::repos::{NewRequest, RepositoryError};

use crate::app::dto::{CancelResponse, EnqueueRequest, EnqueueResponse};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;

/// POST /enqueue
///
/// Creates the request record, then enqueues the generation job. Clients
/// should open `/stream/:request_id` before (or right after) this call; events
/// published before they subscribe are not replayed.
pub async fn enqueue(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    if body.prompt.trim().is_empty() {
        return Err(ApiError::Validation("prompt must not be empty".to_string()));
    }
    let request_id = match body.request_id {
        Some(id) => RequestId::new(id)?,
        None => RequestId::generate(),
    };
    let model = body
        .model
        .unwrap_or_else(|| services.settings.default_model.clone());

    let mut payload =
        GenerationPayload::new(request_id.clone(), body.prompt.clone()).with_model(model.clone());
    payload.stream = body.stream;
    payload.parameters = body.parameters;
    let job = Job::generation(&payload)?;

    let new_request = NewRequest {
        request_id: request_id.clone(),
        prompt: body.prompt,
        model,
        user_id: body.user_id,
    };
    let job_id = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
        services.repository.create_request(new_request)?;
        match services.queue.enqueue(&services.settings.queue_name, job) {
            Ok(job_id) => Ok(job_id),
            Err(e) => {
                let reason = e.to_string();
                if let Err(repo_err) = services.repository.update_request_status(
                    &payload.request_id,
                    RequestStatus::Failed,
                    Some(&reason),
                ) {
                    warn!(request_id = %payload.request_id, error = %repo_err, "failed to record enqueue failure");
                }
                Err(e.into())
            }
        }
    })
    .await??;

    info!(request_id = %request_id, job_id = %job_id, "request enqueued");
    Ok(Json(EnqueueResponse {
        request_id: request_id.to_string(),
        job_id: job_id.to_string(),
        queued: true,
    }))
}

/// POST /requests/:request_id/cancel
///
/// Signals the local token (creating it if the job has not started yet, so
/// the worker sees it on pickup) and publishes a `cancel` control message for
/// workers in other processes.
pub async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(request_id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let request_id = RequestId::new(request_id)?;

    let response = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
        let record = services
            .repository
            .get_request(&request_id)?
            .ok_or_else(|| RepositoryError::NotFound(request_id.clone()))?;

        if record.status.is_terminal() {
            return Ok(CancelResponse {
                request_id: request_id.to_string(),
                status: record.status.to_string(),
                signalled: false,
            });
        }

        services.cancellation.get_or_create_token(&request_id).cancel();
        let message = ControlMessage::cancel(request_id.clone(), Some("client request".to_string()));
        if let Err(e) = services.broker.publish_control(&request_id, &message) {
            warn!(request_id = %request_id, error = %e, "failed to publish cancel control message");
        }

        info!(request_id = %request_id, status = %record.status, "cancel requested");
        Ok(CancelResponse {
            request_id: request_id.to_string(),
            status: record.status.to_string(),
            signalled: true,
        })
    })
    .await??;

    Ok((StatusCode::ACCEPTED, Json(response)))
}
