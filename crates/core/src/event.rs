//! Wire schema for stream events delivered to subscribers.
//!
//! One JSON object per event, internally tagged by `type`:
//!
//! ```text
//! {"type":"chunk","token":"Hel","seq":1,"request_id":"r1","backpressure":"low"}
//! {"type":"done","request_id":"r1","final":"Hello"}
//! {"type":"error","request_id":"r1","error":"provider unavailable"}
//! {"type":"cancelled","request_id":"r1"}
//! ```

use serde::{Deserialize, Serialize};

use crate::id::RequestId;

/// Advisory signal about stream volume.
///
/// Derived from the chunk sequence number only; nothing throttles on it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureHint {
    Low,
    Medium,
    High,
}

impl BackpressureHint {
    /// Upper bound (inclusive) of the `low` band.
    pub const LOW_MAX_SEQ: u64 = 20;
    /// Upper bound (inclusive) of the `medium` band.
    pub const MEDIUM_MAX_SEQ: u64 = 50;

    pub fn for_seq(seq: u64) -> Self {
        if seq > Self::MEDIUM_MAX_SEQ {
            Self::High
        } else if seq > Self::LOW_MAX_SEQ {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// An event published on a request's data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// One produced fragment. `seq` starts at 1 and strictly increases.
    Chunk {
        token: String,
        seq: u64,
        request_id: RequestId,
        backpressure: BackpressureHint,
    },
    /// Generation completed; `final` is the concatenation of all fragments.
    Done {
        request_id: RequestId,
        #[serde(rename = "final")]
        final_text: String,
    },
    /// Generation failed terminally.
    Error { request_id: RequestId, error: String },
    /// Generation was cancelled before completion.
    Cancelled { request_id: RequestId },
}

impl StreamEvent {
    pub fn chunk(request_id: RequestId, seq: u64, token: impl Into<String>) -> Self {
        Self::Chunk {
            token: token.into(),
            seq,
            request_id,
            backpressure: BackpressureHint::for_seq(seq),
        }
    }

    pub fn done(request_id: RequestId, final_text: impl Into<String>) -> Self {
        Self::Done {
            request_id,
            final_text: final_text.into(),
        }
    }

    pub fn error(request_id: RequestId, error: impl Into<String>) -> Self {
        Self::Error {
            request_id,
            error: error.into(),
        }
    }

    pub fn cancelled(request_id: RequestId) -> Self {
        Self::Cancelled { request_id }
    }

    pub fn request_id(&self) -> &RequestId {
        match self {
            StreamEvent::Chunk { request_id, .. }
            | StreamEvent::Done { request_id, .. }
            | StreamEvent::Error { request_id, .. }
            | StreamEvent::Cancelled { request_id } => request_id,
        }
    }

    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Cancelled { .. } => "cancelled",
        }
    }

    /// `done`, `error` and `cancelled` end a delivery stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn rid() -> RequestId {
        RequestId::new("r1").unwrap()
    }

    #[test]
    fn chunk_matches_wire_schema() {
        let event = StreamEvent::chunk(rid(), 1, "Hel");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "chunk",
                "token": "Hel",
                "seq": 1,
                "request_id": "r1",
                "backpressure": "low",
            })
        );
    }

    #[test]
    fn done_uses_final_field() {
        let event = StreamEvent::done(rid(), "Hello");
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "done", "request_id": "r1", "final": "Hello"})
        );
    }

    #[test]
    fn error_and_cancelled_match_wire_schema() {
        assert_eq!(
            serde_json::to_value(StreamEvent::error(rid(), "boom")).unwrap(),
            json!({"type": "error", "request_id": "r1", "error": "boom"})
        );
        assert_eq!(
            serde_json::to_value(StreamEvent::cancelled(rid())).unwrap(),
            json!({"type": "cancelled", "request_id": "r1"})
        );
    }

    #[test]
    fn decodes_wire_json() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"chunk","token":"lo","seq":2,"request_id":"r1","backpressure":"medium"}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            StreamEvent::Chunk { seq: 2, backpressure: BackpressureHint::Medium, .. }
        ));
    }

    #[test]
    fn backpressure_band_edges() {
        assert_eq!(BackpressureHint::for_seq(1), BackpressureHint::Low);
        assert_eq!(BackpressureHint::for_seq(20), BackpressureHint::Low);
        assert_eq!(BackpressureHint::for_seq(21), BackpressureHint::Medium);
        assert_eq!(BackpressureHint::for_seq(50), BackpressureHint::Medium);
        assert_eq!(BackpressureHint::for_seq(51), BackpressureHint::High);
    }

    #[test]
    fn only_chunk_is_non_terminal() {
        assert!(!StreamEvent::chunk(rid(), 1, "x").is_terminal());
        assert!(StreamEvent::done(rid(), "").is_terminal());
        assert!(StreamEvent::error(rid(), "e").is_terminal());
        assert!(StreamEvent::cancelled(rid()).is_terminal());
    }

    proptest! {
        #[test]
        fn backpressure_is_monotonic(a in 1u64..10_000, b in 1u64..10_000) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(BackpressureHint::for_seq(lo) as u8 <= BackpressureHint::for_seq(hi) as u8);
        }
    }
}
