//! Connection lifecycle, cancellation, and per-client delivery.

pub mod cancellation;
pub mod delivery;
pub mod lifecycle;

pub use cancellation::{CancellationCoordinator, CancellationToken};
pub use delivery::{DeliveryEnd, DeliverySession, EventSink, STREAM_CLOSED};
pub use lifecycle::ConnectionManager;
