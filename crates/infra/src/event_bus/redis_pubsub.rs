//! Redis pub/sub-backed broker (optional).
//!
//! Redis pub/sub is not durable: messages published while nobody is
//! subscribed are dropped, which matches the broker contract.
//!
//! Each subscription owns a dedicated connection and a reader thread that
//! forwards payloads into the subscriber's inbox. `subscribe_raw` returns only
//! after Redis has confirmed the subscription, so a publish that follows it is
//! never missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use redis::{Commands, Connection};
use tracing::{debug, instrument, warn};

use streamforge_events::{Broker, BrokerError, Channel, SubscriberId};

/// How long a reader blocks before re-checking its stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// How long `subscribe_raw` waits for Redis to confirm.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

type Readers = Arc<Mutex<HashMap<SubscriberId, Arc<AtomicBool>>>>;

fn lock_readers(readers: &Readers) -> MutexGuard<'_, HashMap<SubscriberId, Arc<AtomicBool>>> {
    readers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A reader's registration; dropping it removes the entry.
struct ReaderEntry {
    readers: Readers,
    subscriber: SubscriberId,
}

impl ReaderEntry {
    fn register(readers: &Readers, subscriber: SubscriberId, stop: Arc<AtomicBool>) -> Self {
        lock_readers(readers).insert(subscriber, stop);
        Self {
            readers: readers.clone(),
            subscriber,
        }
    }
}

impl Drop for ReaderEntry {
    fn drop(&mut self) {
        lock_readers(&self.readers).remove(&self.subscriber);
    }
}

fn redis_err(e: redis::RedisError) -> BrokerError {
    if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
        BrokerError::Connection(e.to_string())
    } else {
        BrokerError::Command(e.to_string())
    }
}

/// Redis pub/sub broker.
pub struct RedisBroker {
    client: redis::Client,
    publisher: Mutex<Option<Connection>>,
    readers: Readers,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker").finish_non_exhaustive()
    }
}

impl RedisBroker {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            publisher: Mutex::new(None),
            readers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Number of reader threads still registered.
    pub fn active_readers(&self) -> usize {
        lock_readers(&self.readers).len()
    }
}

impl Broker for RedisBroker {
    #[instrument(level = "debug", skip(self, payload), fields(channel = %channel))]
    fn publish_raw(&self, channel: &Channel, payload: String) -> Result<(), BrokerError> {
        let mut slot = self.publisher.lock().map_err(|_| BrokerError::Poisoned)?;
        if slot.is_none() {
            *slot = Some(self.client.get_connection().map_err(redis_err)?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(BrokerError::Connection("no publisher connection".to_string()));
        };

        match conn.publish::<_, _, i64>(channel.as_str(), payload) {
            Ok(receivers) => {
                debug!(receivers, "published");
                Ok(())
            }
            Err(e) => {
                // Reconnect on the next publish.
                *slot = None;
                Err(redis_err(e))
            }
        }
    }

    #[instrument(level = "debug", skip(self), fields(channel = %channel))]
    fn subscribe_raw(
        &self,
        channel: &Channel,
    ) -> Result<(SubscriberId, mpsc::Receiver<String>), BrokerError> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), BrokerError>>();
        let subscriber = SubscriberId::new();
        let stop = Arc::new(AtomicBool::new(false));

        let client = self.client.clone();
        let name = channel.as_str().to_string();
        let reader_stop = stop.clone();
        // Registered up front so an early exit cannot leave a stale entry.
        let entry = ReaderEntry::register(&self.readers, subscriber, stop.clone());

        thread::Builder::new()
            .name(format!("redis-sub-{subscriber}"))
            .spawn(move || {
                let _entry = entry;
                let mut conn = match client.get_connection() {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = ready_tx.send(Err(redis_err(e)));
                        return;
                    }
                };
                let mut pubsub = conn.as_pubsub();
                if let Err(e) = pubsub
                    .subscribe(&name)
                    .and_then(|_| pubsub.set_read_timeout(Some(READ_TIMEOUT)))
                {
                    let _ = ready_tx.send(Err(redis_err(e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while !reader_stop.load(Ordering::Acquire) {
                    let msg = match pubsub.get_message() {
                        Ok(m) => m,
                        Err(e) if e.is_timeout() => continue,
                        Err(e) => {
                            warn!(channel = %name, error = %e, "redis subscription lost");
                            return;
                        }
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    if tx.send(payload).is_err() {
                        return;
                    }
                }
            })
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        match ready_rx.recv_timeout(SUBSCRIBE_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                stop.store(true, Ordering::Release);
                return Err(BrokerError::Connection(
                    "timed out waiting for subscription".to_string(),
                ));
            }
        }

        debug!(subscriber = %subscriber, "subscribed");
        Ok((subscriber, rx))
    }

    fn unsubscribe(&self, channel: &Channel, subscriber: SubscriberId) {
        if let Some(stop) = lock_readers(&self.readers).remove(&subscriber) {
            stop.store(true, Ordering::Release);
            debug!(channel = %channel, subscriber = %subscriber, "unsubscribed");
        }
    }
}
