//! Cooperative cancellation of in-flight generations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use streamforge_core::RequestId;

#[derive(Debug, Default)]
struct TokenState {
    flag: AtomicBool,
    lock: Mutex<bool>,
    cvar: Condvar,
}

/// A one-way cancellation flag shared between the party that cancels and the
/// worker that observes it.
///
/// Clones share state. Once set, the flag never resets.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.flag.store(true, Ordering::Release);
        let mut cancelled = self.state.lock.lock().unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.state.cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.flag.load(Ordering::Acquire)
    }

    /// Block until cancelled.
    pub fn wait(&self) {
        let mut cancelled = self.state.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            cancelled = self
                .state
                .cvar
                .wait(cancelled)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until cancelled or `timeout` elapses. Returns whether the token
    /// is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let cancelled = self.state.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (cancelled, _) = self
            .state
            .cvar
            .wait_timeout_while(cancelled, timeout, |c| !*c)
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled
    }
}

/// Process-local registry of cancellation tokens keyed by request.
///
/// Tokens are created lazily by whichever side touches a request first, so a
/// cancel that arrives before the worker starts is still observed.
#[derive(Debug, Default)]
pub struct CancellationCoordinator {
    tokens: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the token for `request_id`, creating it if needed.
    pub fn get_or_create_token(&self, request_id: &RequestId) -> CancellationToken {
        self.tokens()
            .entry(request_id.clone())
            .or_default()
            .clone()
    }

    /// Set the token for `request_id`. Returns `false` (and does nothing) when
    /// no token exists.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        let token = self.tokens().get(request_id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                debug!(request_id = %request_id, "request cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, request_id: &RequestId) -> bool {
        self.tokens()
            .get(request_id)
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Wait up to `timeout` for `request_id` to be cancelled, creating its
    /// token if needed.
    pub fn wait_for_cancel(&self, request_id: &RequestId, timeout: Duration) -> bool {
        self.get_or_create_token(request_id).wait_timeout(timeout)
    }

    /// Forget the token for a request that reached a terminal state.
    pub fn remove(&self, request_id: &RequestId) -> Option<CancellationToken> {
        self.tokens().remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.tokens().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens().is_empty()
    }
}
