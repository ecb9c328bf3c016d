//! Text generation providers.
//!
//! A [`Generator`] turns a request into a lazy sequence of text fragments.
//! The worker pulls fragments one at a time, which is where cancellation and
//! timeouts are checked.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Map, Value as JsonValue};

use streamforge_core::RequestId;

use crate::jobs::GenerationPayload;
use crate::streaming::CancellationToken;

/// Generation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation cancelled")]
    Cancelled,
}

/// Input handed to a generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub request_id: RequestId,
    pub prompt: String,
    pub model: String,
    pub parameters: Map<String, JsonValue>,
}

impl GenerationRequest {
    /// Build from a job payload, falling back to `default_model`.
    pub fn from_payload(payload: &GenerationPayload, default_model: &str) -> Self {
        Self {
            request_id: payload.request_id.clone(),
            prompt: payload.prompt.clone(),
            model: payload
                .model
                .clone()
                .unwrap_or_else(|| default_model.to_string()),
            parameters: payload.parameters.clone(),
        }
    }
}

/// Lazily produced fragments. An `Err` item ends the generation.
pub type Fragments = Box<dyn Iterator<Item = Result<String, GenerationError>> + Send>;

/// A streaming text generation provider.
///
/// Not assumed to be idempotent: a retried job generates again from scratch.
pub trait Generator: Send + Sync {
    fn generate(
        &self,
        request: &GenerationRequest,
        token: &CancellationToken,
    ) -> Result<Fragments, GenerationError>;
}

/// Splits the prompt into whitespace-separated words (keeping the spacing),
/// so the completion reproduces the prompt.
#[derive(Debug, Clone, Default)]
pub struct EchoGenerator {
    delay: Duration,
}

impl EchoGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between fragments.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Generator for EchoGenerator {
    fn generate(
        &self,
        request: &GenerationRequest,
        token: &CancellationToken,
    ) -> Result<Fragments, GenerationError> {
        let words: Vec<String> = request
            .prompt
            .split_inclusive(char::is_whitespace)
            .map(str::to_string)
            .collect();
        Ok(paced(words.into_iter().map(Ok), self.delay, token.clone()))
    }
}

/// A generator scripted for tests: fixed fragments, optional failures.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    fragments: Vec<String>,
    /// Calls that fail before the first fragment.
    failures_remaining: AtomicU32,
    /// Fail after emitting this many fragments (on every call).
    fail_after: Option<usize>,
    error: Mutex<Option<String>>,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedGenerator {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Fail the first `n` calls with `error`.
    pub fn failing_first(mut self, n: u32, error: impl Into<String>) -> Self {
        self.failures_remaining = AtomicU32::new(n);
        self.error = Mutex::new(Some(error.into()));
        self
    }

    /// Fail every call with `error`.
    pub fn always_failing(error: impl Into<String>) -> Self {
        Self::new(Vec::<String>::new()).failing_first(u32::MAX, error)
    }

    /// Fail after `n` fragments on every call.
    pub fn failing_after(mut self, n: usize, error: impl Into<String>) -> Self {
        self.fail_after = Some(n);
        self.error = Mutex::new(Some(error.into()));
        self
    }

    /// Pause before each fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of times `generate` was called.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn error_text(&self) -> String {
        self.error
            .lock()
            .ok()
            .and_then(|e| e.clone())
            .unwrap_or_else(|| "scripted failure".to_string())
    }
}

impl Generator for ScriptedGenerator {
    fn generate(
        &self,
        _request: &GenerationRequest,
        token: &CancellationToken,
    ) -> Result<Fragments, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let fail_now = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_now {
            return Err(GenerationError::Provider(self.error_text()));
        }

        let items: Vec<Result<String, GenerationError>> = match self.fail_after {
            Some(n) => self
                .fragments
                .iter()
                .take(n)
                .cloned()
                .map(Ok)
                .chain(std::iter::once(Err(GenerationError::Provider(self.error_text()))))
                .collect(),
            None => self.fragments.iter().cloned().map(Ok).collect(),
        };
        Ok(paced(items.into_iter(), self.delay, token.clone()))
    }
}

/// Sleep `delay` before each fragment, waking early on cancellation.
fn paced<I>(items: I, delay: Duration, token: CancellationToken) -> Fragments
where
    I: Iterator<Item = Result<String, GenerationError>> + Send + 'static,
{
    if delay.is_zero() {
        return Box::new(items);
    }
    Box::new(items.map(move |item| {
        token.wait_timeout(delay);
        item
    }))
}
