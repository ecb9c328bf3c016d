//! Publish/subscribe abstraction (mechanics only).
//!
//! The broker is a **live fan-out**: `publish` hands a message to whoever is
//! subscribed to the channel at that instant. There is no log and no replay.
//!
//! ## Transport
//!
//! Implementations move JSON strings. [`Subscription`] decodes lazily into the
//! message type it was opened for, so in-memory and networked backends share
//! one contract. Payloads that fail to decode are skipped with a warning.
//!
//! ## Ordering
//!
//! Messages published on one channel by one publisher arrive at each
//! subscriber in publish order. Nothing is promised across channels.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use streamforge_core::{RequestId, StreamEvent};
use tracing::warn;
use uuid::Uuid;

use crate::channel::Channel;
use crate::control::ControlMessage;

/// Broker error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Internal lock poisoning.
    #[error("broker state poisoned")]
    Poisoned,
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("broker command error: {0}")]
    Command(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Identifier of one subscriber on one channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A subscription to one channel.
///
/// Iterating yields messages until the broker closes the channel for this
/// subscriber (unsubscribe, shutdown, transport loss).
///
/// ```ignore
/// let sub = broker.subscribe(&Channel::request(&id))?;
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => forward(event),
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    channel: Channel,
    subscriber: SubscriberId,
    receiver: Receiver<String>,
    _message: PhantomData<fn() -> M>,
}

impl<M> Subscription<M> {
    pub fn new(channel: Channel, subscriber: SubscriberId, receiver: Receiver<String>) -> Self {
        Self {
            channel,
            subscriber,
            receiver,
            _message: PhantomData,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber
    }
}

impl<M: DeserializeOwned> Subscription<M> {
    /// Block until the next decodable message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        loop {
            let raw = self.receiver.recv()?;
            if let Some(msg) = self.decode(&raw) {
                return Ok(msg);
            }
        }
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        loop {
            let raw = self.receiver.try_recv()?;
            if let Some(msg) = self.decode(&raw) {
                return Ok(msg);
            }
        }
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            // An unrepresentable deadline falls through to std, which blocks.
            let remaining =
                deadline.map_or(timeout, |at| at.saturating_duration_since(Instant::now()));
            let raw = self.receiver.recv_timeout(remaining)?;
            if let Some(msg) = self.decode(&raw) {
                return Ok(msg);
            }
        }
    }

    fn decode(&self, raw: &str) -> Option<M> {
        match serde_json::from_str(raw) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "dropping undecodable broker message");
                None
            }
        }
    }
}

impl<M: DeserializeOwned> Iterator for Subscription<M> {
    type Item = M;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv().ok()
    }
}

/// Pub/sub broker for request streams.
///
/// `publish_raw`/`subscribe_raw`/`unsubscribe` are the transport contract; the
/// typed helpers are what callers use.
///
/// The trait requires `Send + Sync`: one broker instance is shared by every
/// worker and every delivery endpoint in the process.
pub trait Broker: Send + Sync {
    /// Broadcast an already-serialized payload to current subscribers.
    fn publish_raw(&self, channel: &Channel, payload: String) -> Result<(), BrokerError>;

    /// Open a subscriber inbox on `channel`.
    fn subscribe_raw(
        &self,
        channel: &Channel,
    ) -> Result<(SubscriberId, Receiver<String>), BrokerError>;

    /// Release one subscriber. Unknown subscribers are ignored.
    fn unsubscribe(&self, channel: &Channel, subscriber: SubscriberId);

    /// Publish a stream event on a data channel.
    fn publish(&self, channel: &Channel, event: &StreamEvent) -> Result<(), BrokerError> {
        let payload =
            serde_json::to_string(event).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        self.publish_raw(channel, payload)
    }

    /// Subscribe to a data channel.
    fn subscribe(&self, channel: &Channel) -> Result<Subscription<StreamEvent>, BrokerError> {
        let (subscriber, rx) = self.subscribe_raw(channel)?;
        Ok(Subscription::new(channel.clone(), subscriber, rx))
    }

    /// Publish on the request's control channel (`control:request:{id}`).
    fn publish_control(
        &self,
        request_id: &RequestId,
        message: &ControlMessage,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        self.publish_raw(&Channel::control(request_id), payload)
    }

    /// Subscribe to the request's control channel.
    fn subscribe_control(
        &self,
        request_id: &RequestId,
    ) -> Result<Subscription<ControlMessage>, BrokerError> {
        let channel = Channel::control(request_id);
        let (subscriber, rx) = self.subscribe_raw(&channel)?;
        Ok(Subscription::new(channel, subscriber, rx))
    }
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn publish_raw(&self, channel: &Channel, payload: String) -> Result<(), BrokerError> {
        (**self).publish_raw(channel, payload)
    }

    fn subscribe_raw(
        &self,
        channel: &Channel,
    ) -> Result<(SubscriberId, Receiver<String>), BrokerError> {
        (**self).subscribe_raw(channel)
    }

    fn unsubscribe(&self, channel: &Channel, subscriber: SubscriberId) {
        (**self).unsubscribe(channel, subscriber)
    }
}
