//! Live subscriber tracking per request.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use streamforge_core::{ConnectionId, RequestId};

/// Which connections are currently streaming which request.
///
/// A request with no entry has no subscribers. Entries are removed as soon as
/// their last connection unregisters.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    active: Mutex<HashMap<RequestId, HashSet<ConnectionId>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<RequestId, HashSet<ConnectionId>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `connection` as streaming `request_id`. Registering twice is a
    /// no-op.
    pub fn register(&self, request_id: &RequestId, connection: ConnectionId) {
        let mut active = self.active();
        active.entry(request_id.clone()).or_default().insert(connection);
        debug!(request_id = %request_id, connection_id = %connection, "connection registered");
    }

    /// Forget `connection`. Unknown ids are ignored.
    pub fn unregister(&self, request_id: &RequestId, connection: ConnectionId) {
        let mut active = self.active();
        if let Some(connections) = active.get_mut(request_id) {
            connections.remove(&connection);
            if connections.is_empty() {
                active.remove(request_id);
            }
        }
        debug!(request_id = %request_id, connection_id = %connection, "connection unregistered");
    }

    pub fn active_subscribers(&self, request_id: &RequestId) -> usize {
        self.active().get(request_id).map_or(0, HashSet::len)
    }

    /// Whether nobody is streaming `request_id` any more.
    ///
    /// Only answers the question; the caller decides whether to cancel.
    pub fn cancel_request_if_no_subscribers(&self, request_id: &RequestId) -> bool {
        self.active_subscribers(request_id) == 0
    }

    /// Number of requests with at least one live connection.
    pub fn tracked_requests(&self) -> usize {
        self.active().len()
    }

    pub fn total_connections(&self) -> usize {
        self.active().values().map(HashSet::len).sum()
    }
}
