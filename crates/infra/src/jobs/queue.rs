//! Queue abstraction shared by every backend.

use std::sync::Arc;
use std::time::Duration;

use streamforge_core::JobId;

use super::cloud::{CloudJobQueue, LocalCloudQueue};
use super::in_memory::InMemoryJobQueue;
#[cfg(feature = "redis")]
use super::redis::RedisJobQueue;
use super::types::{DeadLetterEntry, Job};
use crate::config::{QueueBackendKind, Settings};

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("queue command error: {0}")]
    Command(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("job payload has no request_id")]
    MissingRequestId,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
}

/// A named-queue job store with at-least-once delivery.
///
/// A reserved job is invisible to other workers until it is acknowledged,
/// failed, requeued, or its reservation expires (after which it is handed out
/// again). Every reservation increments [`Job::attempts`].
///
/// Implementations block the calling thread; call from worker threads or
/// `spawn_blocking`.
pub trait JobQueue: Send + Sync {
    /// Append a job to `queue` and return its id.
    fn enqueue(&self, queue: &str, job: Job) -> Result<JobId, QueueError>;

    /// Claim the earliest visible job, waiting up to `timeout` for one.
    fn reserve(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Permanently remove a reserved job. Unknown ids are ignored.
    fn ack(&self, queue: &str, job_id: JobId) -> Result<(), QueueError>;

    /// Move a reserved job to the dead-letter store. Unknown ids are ignored.
    fn fail(&self, queue: &str, job_id: JobId, reason: &str) -> Result<(), QueueError>;

    /// Release a reserved job and make it visible again after `delay`.
    ///
    /// The stored job is replaced by `job`, so callers may carry state (such
    /// as [`Job::published_seq`]) into the next attempt.
    fn requeue(&self, queue: &str, job: Job, delay: Duration) -> Result<JobId, QueueError>;

    /// Approximate number of jobs waiting to be reserved.
    fn inspect_queue_length(&self, queue: &str) -> Result<usize, QueueError>;

    /// Most recent dead-letter entries, newest first.
    fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;
}

impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn enqueue(&self, queue: &str, job: Job) -> Result<JobId, QueueError> {
        (**self).enqueue(queue, job)
    }

    fn reserve(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError> {
        (**self).reserve(queue, timeout)
    }

    fn ack(&self, queue: &str, job_id: JobId) -> Result<(), QueueError> {
        (**self).ack(queue, job_id)
    }

    fn fail(&self, queue: &str, job_id: JobId, reason: &str) -> Result<(), QueueError> {
        (**self).fail(queue, job_id, reason)
    }

    fn requeue(&self, queue: &str, job: Job, delay: Duration) -> Result<JobId, QueueError> {
        (**self).requeue(queue, job, delay)
    }

    fn inspect_queue_length(&self, queue: &str) -> Result<usize, QueueError> {
        (**self).inspect_queue_length(queue)
    }

    fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        (**self).dead_letters(queue, limit)
    }
}

/// The queue backend selected by configuration.
#[derive(Debug)]
pub enum QueueBackend {
    InMemory(InMemoryJobQueue),
    #[cfg(feature = "redis")]
    Redis(RedisJobQueue),
    Cloud(CloudJobQueue),
}

impl QueueBackend {
    /// Build the configured backend.
    pub fn from_settings(settings: &Settings) -> Result<Self, QueueError> {
        let visibility = settings.visibility_timeout;
        match settings.queue_backend {
            QueueBackendKind::Memory => Ok(Self::InMemory(InMemoryJobQueue::new(visibility))),
            QueueBackendKind::Cloud => {
                let client = Arc::new(LocalCloudQueue::new());
                Ok(Self::Cloud(CloudJobQueue::new(
                    client,
                    settings.cloud_queue_url.clone(),
                    visibility,
                )))
            }
            #[cfg(feature = "redis")]
            QueueBackendKind::Redis => {
                let url = settings.redis_url.as_deref().ok_or_else(|| {
                    QueueError::Unavailable("redis backend requires a redis url".to_string())
                })?;
                Ok(Self::Redis(RedisJobQueue::new(url, visibility)?))
            }
            #[cfg(not(feature = "redis"))]
            QueueBackendKind::Redis => Err(QueueError::Unavailable(
                "built without the `redis` feature".to_string(),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueBackend::InMemory(_) => "memory",
            #[cfg(feature = "redis")]
            QueueBackend::Redis(_) => "redis",
            QueueBackend::Cloud(_) => "cloud",
        }
    }

    fn inner(&self) -> &dyn JobQueue {
        match self {
            QueueBackend::InMemory(q) => q,
            #[cfg(feature = "redis")]
            QueueBackend::Redis(q) => q,
            QueueBackend::Cloud(q) => q,
        }
    }
}

impl JobQueue for QueueBackend {
    fn enqueue(&self, queue: &str, job: Job) -> Result<JobId, QueueError> {
        self.inner().enqueue(queue, job)
    }

    fn reserve(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError> {
        self.inner().reserve(queue, timeout)
    }

    fn ack(&self, queue: &str, job_id: JobId) -> Result<(), QueueError> {
        self.inner().ack(queue, job_id)
    }

    fn fail(&self, queue: &str, job_id: JobId, reason: &str) -> Result<(), QueueError> {
        self.inner().fail(queue, job_id, reason)
    }

    fn requeue(&self, queue: &str, job: Job, delay: Duration) -> Result<JobId, QueueError> {
        self.inner().requeue(queue, job, delay)
    }

    fn inspect_queue_length(&self, queue: &str) -> Result<usize, QueueError> {
        self.inner().inspect_queue_length(queue)
    }

    fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        self.inner().dead_letters(queue, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_settings_select_in_memory_backend() {
        let backend = QueueBackend::from_settings(&Settings::default()).unwrap();
        assert_eq!(backend.name(), "memory");

        backend.enqueue("q", Job::new(json!({"request_id": "r1"}))).unwrap();
        assert_eq!(backend.inspect_queue_length("q").unwrap(), 1);
    }

    #[test]
    fn cloud_backend_is_selectable() {
        let settings = Settings {
            queue_backend: QueueBackendKind::Cloud,
            ..Settings::default()
        };
        let backend = QueueBackend::from_settings(&settings).unwrap();
        assert_eq!(backend.name(), "cloud");
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn redis_backend_requires_feature() {
        let settings = Settings {
            queue_backend: QueueBackendKind::Redis,
            ..Settings::default()
        };
        assert!(matches!(
            QueueBackend::from_settings(&settings),
            Err(QueueError::Unavailable(_))
        ));
    }
}
