//! In-memory broker for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, mpsc};

use tracing::debug;

use crate::bus::{Broker, BrokerError, SubscriberId};
use crate::channel::Channel;

/// In-memory pub/sub broker.
///
/// - No IO
/// - Best-effort fan-out, publish order preserved per channel
/// - Channel entries disappear once their last subscriber is gone
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    channels: Mutex<HashMap<Channel, Vec<(SubscriberId, mpsc::Sender<String>)>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a channel.
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.channels
            .lock()
            .map(|channels| channels.get(channel).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Broker for InMemoryBroker {
    fn publish_raw(&self, channel: &Channel, payload: String) -> Result<(), BrokerError> {
        let mut channels = self.channels.lock().map_err(|_| BrokerError::Poisoned)?;

        let Some(subs) = channels.get_mut(channel) else {
            // Nobody listening: the message is simply gone.
            return Ok(());
        };

        // Drop any dead subscribers while publishing.
        subs.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        if subs.is_empty() {
            channels.remove(channel);
        }

        Ok(())
    }

    fn subscribe_raw(
        &self,
        channel: &Channel,
    ) -> Result<(SubscriberId, mpsc::Receiver<String>), BrokerError> {
        let (tx, rx) = mpsc::channel();
        let subscriber = SubscriberId::new();

        let mut channels = self.channels.lock().map_err(|_| BrokerError::Poisoned)?;
        channels
            .entry(channel.clone())
            .or_default()
            .push((subscriber, tx));

        debug!(channel = %channel, subscriber = %subscriber, "subscribed");
        Ok((subscriber, rx))
    }

    fn unsubscribe(&self, channel: &Channel, subscriber: SubscriberId) {
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };

        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|(id, _)| *id != subscriber);
            if subs.is_empty() {
                channels.remove(channel);
            }
        }
        debug!(channel = %channel, subscriber = %subscriber, "unsubscribed");
    }
}
