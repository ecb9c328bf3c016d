//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use streamforge_core::{JobId, RequestId};

use super::queue::QueueError;

/// Backoff policy applied when a job is requeued after a failure.
///
/// The delay before the next attempt is `backoff_unit * backoff_base^attempts`,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Executions allowed before the job is dead-lettered.
    pub max_attempts: u32,
    pub backoff_base: f64,
    pub backoff_unit: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries: the first failure dead-letters.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Retry immediately (zero backoff). Useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_unit: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn with_backoff_base(mut self, base: f64) -> Self {
        self.backoff_base = base;
        self
    }

    /// Delay to wait after the given number of completed attempts.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let unit = self.backoff_unit.as_secs_f64();
        if unit <= 0.0 {
            return Duration::ZERO;
        }

        let factor = self.backoff_base.max(0.0).powi(attempts.min(i32::MAX as u32) as i32);
        let secs = (unit * factor).min(self.max_delay.as_secs_f64());
        if secs.is_nan() || secs <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether a job that has run `attempts` times may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A unit of work stored in a queue.
///
/// `attempts` counts how many times the job has been handed to a worker. It
/// is incremented on every reservation, including redeliveries after a
/// reservation expired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Queue the job was last enqueued on.
    #[serde(default)]
    pub queue: String,
    /// Opaque JSON payload.
    pub payload: JsonValue,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// The job is invisible to reservation until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_after: Option<DateTime<Utc>>,
    /// Highest chunk `seq` already published by earlier attempts.
    #[serde(default)]
    pub published_seq: u64,
}

impl Job {
    pub fn new(payload: JsonValue) -> Self {
        Self {
            id: JobId::new(),
            queue: String::new(),
            payload,
            attempts: 0,
            created_at: Utc::now(),
            visible_after: None,
            published_seq: 0,
        }
    }

    /// Build a job from a generation payload.
    pub fn generation(payload: &GenerationPayload) -> Result<Self, QueueError> {
        let value =
            serde_json::to_value(payload).map_err(|e| QueueError::Serialization(e.to_string()))?;
        Ok(Self::new(value))
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Hide the job from reservation for `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.visible_after = visible_after(delay);
        self
    }

    pub fn is_visible_at(&self, now: DateTime<Utc>) -> bool {
        match self.visible_after {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.is_visible_at(Utc::now())
    }

    /// Decode the payload as a generation request.
    pub fn generation_payload(&self) -> Result<GenerationPayload, QueueError> {
        GenerationPayload::from_value(&self.payload)
    }
}

/// `now + delay`, or `None` when there is no delay.
pub(crate) fn visible_after(delay: Duration) -> Option<DateTime<Utc>> {
    if delay.is_zero() {
        return None;
    }
    let delta = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    Some(
        Utc::now()
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    )
}

/// Payload of a generation job.
///
/// ```text
/// {"request_id":"r1","prompt":"Hi","model":"echo-1","stream":true,"parameters":{}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub request_id: RequestId,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
}

fn default_stream() -> bool {
    true
}

impl GenerationPayload {
    pub fn new(request_id: RequestId, prompt: impl Into<String>) -> Self {
        Self {
            request_id,
            prompt: prompt.into(),
            model: None,
            stream: true,
            parameters: Map::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Decode a payload; a missing or blank `request_id` is reported as
    /// [`QueueError::MissingRequestId`].
    pub fn from_value(value: &JsonValue) -> Result<Self, QueueError> {
        let has_request_id = value
            .get("request_id")
            .and_then(JsonValue::as_str)
            .is_some_and(|s| !s.trim().is_empty());
        if !has_request_id {
            return Err(QueueError::MissingRequestId);
        }
        serde_json::from_value(value.clone()).map_err(|e| QueueError::Serialization(e.to_string()))
    }
}

/// A job that exhausted its attempts (or was failed explicitly).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: Job,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: impl Into<String>) -> Self {
        Self {
            job,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}
