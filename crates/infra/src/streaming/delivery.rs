//! Per-connection delivery of a request's stream events.
//!
//! A [`DeliverySession`] is opened when a client connects: it allocates a
//! connection id, registers it, and subscribes to `request:{id}`. The session
//! then forwards events to an [`EventSink`] until a terminal event, client
//! departure, or subscription loss. Teardown runs in `Drop`, so it happens on
//! every exit path.

use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use tracing::{debug, info};

use streamforge_core::{ConnectionId, RequestId, StreamEvent};
use streamforge_events::{Broker, BrokerError, Channel, Subscription};

use super::cancellation::CancellationCoordinator;
use super::lifecycle::ConnectionManager;

/// Error text sent to the client when the broker subscription closes early.
pub const STREAM_CLOSED: &str = "stream closed";

/// Where delivered events go (an SSE response, a test buffer, ...).
pub trait EventSink {
    /// Forward one event. Returns `false` once the client is gone.
    fn send(&mut self, event: &StreamEvent) -> bool;

    /// Whether the client is still connected.
    fn is_open(&self) -> bool;
}

impl EventSink for Vec<StreamEvent> {
    fn send(&mut self, event: &StreamEvent) -> bool {
        self.push(event.clone());
        true
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// Why a delivery loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEnd {
    /// A `done`, `error` or `cancelled` event was delivered.
    Terminal(&'static str),
    /// The client disconnected.
    ClientGone,
    /// The broker closed the subscription.
    SubscriptionClosed,
}

/// One connected client streaming one request.
pub struct DeliverySession {
    request_id: RequestId,
    connection_id: ConnectionId,
    subscription: Subscription<StreamEvent>,
    broker: Arc<dyn Broker>,
    connections: Arc<ConnectionManager>,
    cancellation: Arc<CancellationCoordinator>,
}

impl std::fmt::Debug for DeliverySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliverySession")
            .field("request_id", &self.request_id)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl DeliverySession {
    /// Register a new connection for `request_id` and subscribe to its data
    /// channel. Events published before this returns are not delivered.
    pub fn open(
        request_id: RequestId,
        broker: Arc<dyn Broker>,
        connections: Arc<ConnectionManager>,
        cancellation: Arc<CancellationCoordinator>,
    ) -> Result<Self, BrokerError> {
        let connection_id = ConnectionId::new();
        connections.register(&request_id, connection_id);

        let subscription = match broker.subscribe(&Channel::request(&request_id)) {
            Ok(sub) => sub,
            Err(e) => {
                connections.unregister(&request_id, connection_id);
                return Err(e);
            }
        };

        info!(request_id = %request_id, connection_id = %connection_id, "stream opened");
        Ok(Self {
            request_id,
            connection_id,
            subscription,
            broker,
            connections,
            cancellation,
        })
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Forward events to `sink` until the stream ends.
    ///
    /// `poll` bounds how long a client departure can go unnoticed while no
    /// events arrive.
    pub fn pump(self, sink: &mut impl EventSink, poll: Duration) -> DeliveryEnd {
        let end = loop {
            match self.subscription.recv_timeout(poll) {
                Ok(event) => {
                    if !sink.send(&event) {
                        break DeliveryEnd::ClientGone;
                    }
                    if event.is_terminal() {
                        break DeliveryEnd::Terminal(event.kind());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !sink.is_open() {
                        break DeliveryEnd::ClientGone;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    sink.send(&StreamEvent::error(self.request_id.clone(), STREAM_CLOSED));
                    break DeliveryEnd::SubscriptionClosed;
                }
            }
        };

        debug!(
            request_id = %self.request_id,
            connection_id = %self.connection_id,
            end = ?end,
            "stream finished"
        );
        end
    }
}

impl Drop for DeliverySession {
    fn drop(&mut self) {
        self.broker
            .unsubscribe(self.subscription.channel(), self.subscription.subscriber_id());
        self.connections
            .unregister(&self.request_id, self.connection_id);
        if self.connections.cancel_request_if_no_subscribers(&self.request_id)
            && self.cancellation.cancel(&self.request_id)
        {
            info!(request_id = %self.request_id, "last subscriber left; cancelling generation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use streamforge_events::InMemoryBroker;

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        connections: Arc<ConnectionManager>,
        cancellation: Arc<CancellationCoordinator>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                broker: Arc::new(InMemoryBroker::new()),
                connections: Arc::new(ConnectionManager::new()),
                cancellation: Arc::new(CancellationCoordinator::new()),
            }
        }

        fn open(&self) -> DeliverySession {
            DeliverySession::open(
                rid(),
                self.broker.clone(),
                self.connections.clone(),
                self.cancellation.clone(),
            )
            .unwrap()
        }
    }

    fn rid() -> RequestId {
        RequestId::new("r1").unwrap()
    }

    /// Sink that reports the client gone after `limit` events.
    struct ClosingSink {
        received: Vec<StreamEvent>,
        limit: usize,
    }

    impl EventSink for ClosingSink {
        fn send(&mut self, event: &StreamEvent) -> bool {
            if self.received.len() >= self.limit {
                return false;
            }
            self.received.push(event.clone());
            true
        }

        fn is_open(&self) -> bool {
            self.received.len() < self.limit
        }
    }

    #[test]
    fn open_registers_and_subscribes() {
        let fx = Fixture::new();
        let session = fx.open();
        assert_eq!(fx.connections.active_subscribers(&rid()), 1);
        assert_eq!(fx.broker.subscriber_count(&Channel::request(&rid())), 1);

        drop(session);
        assert_eq!(fx.connections.active_subscribers(&rid()), 0);
        assert_eq!(fx.broker.subscriber_count(&Channel::request(&rid())), 0);
    }

    #[test]
    fn forwards_in_order_until_terminal() {
        let fx = Fixture::new();
        let session = fx.open();
        let channel = Channel::request(&rid());
        fx.broker.publish(&channel, &StreamEvent::chunk(rid(), 1, "Hel")).unwrap();
        fx.broker.publish(&channel, &StreamEvent::chunk(rid(), 2, "lo")).unwrap();
        fx.broker.publish(&channel, &StreamEvent::done(rid(), "Hello")).unwrap();
        fx.broker.publish(&channel, &StreamEvent::chunk(rid(), 3, "late")).unwrap();

        let mut sink = Vec::new();
        let end = session.pump(&mut sink, Duration::from_millis(10));

        assert_eq!(end, DeliveryEnd::Terminal("done"));
        assert_eq!(
            sink,
            vec![
                StreamEvent::chunk(rid(), 1, "Hel"),
                StreamEvent::chunk(rid(), 2, "lo"),
                StreamEvent::done(rid(), "Hello"),
            ]
        );
    }

    #[test]
    fn client_departure_cancels_generation() {
        let fx = Fixture::new();
        let token = fx.cancellation.get_or_create_token(&rid());
        let session = fx.open();

        let mut sink = ClosingSink {
            received: Vec::new(),
            limit: 0,
        };
        let end = session.pump(&mut sink, Duration::from_millis(5));

        assert_eq!(end, DeliveryEnd::ClientGone);
        assert!(token.is_cancelled());
        assert_eq!(fx.connections.active_subscribers(&rid()), 0);
    }

    #[test]
    fn remaining_subscriber_keeps_generation_alive() {
        let fx = Fixture::new();
        let token = fx.cancellation.get_or_create_token(&rid());
        let stay = fx.open();
        let leave = fx.open();

        let mut sink = ClosingSink {
            received: Vec::new(),
            limit: 0,
        };
        leave.pump(&mut sink, Duration::from_millis(5));

        assert!(!token.is_cancelled());
        assert_eq!(fx.connections.active_subscribers(&rid()), 1);
        drop(stay);
        assert!(token.is_cancelled());
    }

    #[test]
    fn last_departure_before_any_token_leaves_coordinator_empty() {
        let fx = Fixture::new();
        drop(fx.open());

        assert!(fx.connections.cancel_request_if_no_subscribers(&rid()));
        assert!(fx.cancellation.is_empty());
    }

    #[test]
    fn subscription_loss_sends_stream_closed() {
        let fx = Fixture::new();
        let session = fx.open();
        let subscriber = session.subscription.subscriber_id();
        fx.broker.unsubscribe(&Channel::request(&rid()), subscriber);

        let mut sink = Vec::new();
        let end = session.pump(&mut sink, Duration::from_millis(10));

        assert_eq!(end, DeliveryEnd::SubscriptionClosed);
        assert_eq!(sink, vec![StreamEvent::error(rid(), STREAM_CLOSED)]);
    }

    #[test]
    fn pump_runs_on_another_thread() {
        let fx = Fixture::new();
        let session = fx.open();
        let handle = thread::spawn(move || {
            let mut sink = Vec::new();
            let end = session.pump(&mut sink, Duration::from_millis(10));
            (end, sink)
        });

        fx.broker
            .publish(&Channel::request(&rid()), &StreamEvent::cancelled(rid()))
            .unwrap();
        let (end, sink) = handle.join().unwrap();
        assert_eq!(end, DeliveryEnd::Terminal("cancelled"));
        assert_eq!(sink, vec![StreamEvent::cancelled(rid())]);
    }
}
