//! Server-Sent Events delivery of one request's stream.
//!
//! Each broker message becomes `event: <type>` / `data: <json>`. The stream
//! ends after the first `done`, `error` or `cancelled` event.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use streamforge_core::{RequestId, StreamEvent};
use streamforge_infra::streaming::{DeliverySession, EventSink};

use crate::app::errors::ApiError;
use crate::app::services::AppServices;

/// How long a departed client can go unnoticed while no events arrive.
const CLIENT_POLL: Duration = Duration::from_millis(500);

const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Forwards events into the response body channel.
struct SseSink {
    tx: UnboundedSender<Result<SseEvent, Infallible>>,
}

impl EventSink for SseSink {
    fn send(&mut self, event: &StreamEvent) -> bool {
        let data = match serde_json::to_string(event) {
            Ok(data) => data,
            Err(e) => {
                warn!(request_id = %event.request_id(), error = %e, "failed to encode stream event");
                return !self.tx.is_closed();
            }
        };
        self.tx
            .send(Ok(SseEvent::default().event(event.kind()).data(data)))
            .is_ok()
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// GET /stream/:request_id
pub async fn stream_request(
    Extension(services): Extension<Arc<AppServices>>,
    Path(request_id): Path<String>,
) -> Response {
    let request_id = match RequestId::new(request_id) {
        Ok(id) => id,
        Err(e) => return ApiError::from(e).into_response(),
    };

    // Subscribe before answering, so a client that enqueues after receiving
    // the response headers cannot miss the first event.
    let opened = tokio::task::spawn_blocking(move || {
        DeliverySession::open(
            request_id,
            services.broker.clone(),
            services.connections.clone(),
            services.cancellation.clone(),
        )
    })
    .await;
    let session = match opened {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => return ApiError::from(e).into_response(),
        Err(e) => return ApiError::from(e).into_response(),
    };

    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();
    tokio::task::spawn_blocking(move || {
        let request_id = session.request_id().clone();
        let connection_id = session.connection_id();
        let mut sink = SseSink { tx };
        let end = session.pump(&mut sink, CLIENT_POLL);
        debug!(request_id = %request_id, connection_id = %connection_id, end = ?end, "sse stream closed");
    });

    Sse::new(UnboundedReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
        .into_response()
}
