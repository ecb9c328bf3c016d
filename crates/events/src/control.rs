//! Out-of-band control messages.

use serde::{Deserialize, Serialize};
use streamforge_core::RequestId;

/// Signal published on a request's control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Ask whichever worker owns the request to stop producing.
    Cancel {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ControlMessage {
    pub fn cancel(request_id: RequestId, reason: Option<String>) -> Self {
        Self::Cancel { request_id, reason }
    }

    pub fn request_id(&self) -> &RequestId {
        match self {
            ControlMessage::Cancel { request_id, .. } => request_id,
        }
    }
}
