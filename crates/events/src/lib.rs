//! Live pub/sub mechanics for request streams.
//!
//! - [`Broker`]: publish/subscribe/unsubscribe per named [`Channel`]
//! - [`Subscription`]: lazy, typed view over one subscriber's inbox
//! - [`InMemoryBroker`]: process-local fan-out for tests/dev
//!
//! There is no durability: a subscriber only sees messages published while
//! it is subscribed.

pub mod bus;
pub mod channel;
pub mod control;
pub mod in_memory_bus;

pub use bus::{Broker, BrokerError, SubscriberId, Subscription};
pub use channel::Channel;
pub use control::ControlMessage;
pub use in_memory_bus::InMemoryBroker;
