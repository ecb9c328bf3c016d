//! Request/response bodies.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// `POST /enqueue` body.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueResponse {
    pub request_id: String,
    pub job_id: String,
    pub queued: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub request_id: String,
    /// Status when the cancel arrived.
    pub status: String,
    /// False when the request had already finished.
    pub signalled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepthResponse {
    pub queue: String,
    pub backend: &'static str,
    pub depth: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_connections: usize,
    pub streaming_requests: usize,
    pub cancellation_tokens: usize,
}
