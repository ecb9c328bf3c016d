//! Channel naming.

use streamforge_core::RequestId;

/// Name of a pub/sub topic.
///
/// Data events for a request flow on `request:{id}`; out-of-band signals on
/// `control:request:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Data channel of a request.
    pub fn request(request_id: &RequestId) -> Self {
        Self(format!("request:{request_id}"))
    }

    /// Control channel of a request.
    pub fn control(request_id: &RequestId) -> Self {
        Self(format!("control:request:{request_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_control(&self) -> bool {
        self.0.starts_with("control:")
    }
}

impl core::fmt::Display for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
