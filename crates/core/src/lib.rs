//! `streamforge-core`: shared building blocks for the generation pipeline.
//!
//! This crate contains **pure** primitives (no IO): identifiers, the request
//! lifecycle, and the wire schema of stream events.

pub mod error;
pub mod event;
pub mod id;
pub mod request;

pub use error::{CoreError, CoreResult};
pub use event::{BackpressureHint, StreamEvent};
pub use id::{ConnectionId, JobId, RequestId};
pub use request::RequestStatus;
