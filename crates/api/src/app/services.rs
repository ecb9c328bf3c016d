use std::io;
use std::sync::Arc;

use tracing::info;

use streamforge_events::{Broker, BrokerError, InMemoryBroker};
use streamforge_infra::config::Settings;
use streamforge_infra::generation::{EchoGenerator, Generator};
use streamforge_infra::jobs::{QueueBackend, QueueError};
use streamforge_infra::repos::{InMemoryRequestRepository, RequestRepository};
use streamforge_infra::streaming::{CancellationCoordinator, ConnectionManager};
use streamforge_infra::workers::{WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerRunner};

#[cfg(feature = "redis")]
use streamforge_infra::event_bus::RedisBroker;

/// Failure while wiring services at startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("queue backend: {0}")]
    Queue(#[from] QueueError),
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
}

/// Worker pool type used by the service.
pub type Workers = WorkerPoolHandle<Arc<QueueBackend>>;

/// Everything a handler or worker needs, shared process-wide.
pub struct AppServices {
    pub settings: Settings,
    pub queue: Arc<QueueBackend>,
    pub broker: Arc<dyn Broker>,
    pub repository: Arc<dyn RequestRepository>,
    pub generator: Arc<dyn Generator>,
    pub connections: Arc<ConnectionManager>,
    pub cancellation: Arc<CancellationCoordinator>,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("queue_backend", &self.queue.name())
            .field("queue_name", &self.settings.queue_name)
            .finish_non_exhaustive()
    }
}

impl AppServices {
    /// Wire the configured queue backend and broker with in-process
    /// coordination state and the echo generator.
    pub fn build(settings: Settings) -> Result<Self, StartupError> {
        let queue = Arc::new(QueueBackend::from_settings(&settings)?);
        let broker = build_broker(&settings)?;
        info!(
            queue_backend = queue.name(),
            queue = %settings.queue_name,
            "services wired"
        );

        Ok(Self {
            settings,
            queue,
            broker,
            repository: Arc::new(InMemoryRequestRepository::new()),
            generator: Arc::new(EchoGenerator::new()),
            connections: Arc::new(ConnectionManager::new()),
            cancellation: Arc::new(CancellationCoordinator::new()),
        })
    }

    /// Replace the generation provider.
    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn runner(&self) -> WorkerRunner<Arc<QueueBackend>> {
        WorkerRunner::new(
            self.queue.clone(),
            self.broker.clone(),
            self.repository.clone(),
            self.generator.clone(),
            self.cancellation.clone(),
            WorkerConfig::from_settings(&self.settings),
        )
    }

    /// Start `worker_concurrency` worker threads on the configured queue.
    pub fn start_workers(&self) -> io::Result<Workers> {
        WorkerPool::spawn(
            Arc::new(self.runner()),
            self.settings.queue_name.clone(),
            self.settings.worker_concurrency,
        )
    }
}

#[cfg(feature = "redis")]
fn build_broker(settings: &Settings) -> Result<Arc<dyn Broker>, BrokerError> {
    match settings.redis_url.as_deref() {
        Some(url) => Ok(Arc::new(RedisBroker::new(url)?)),
        None => Ok(Arc::new(InMemoryBroker::new())),
    }
}

#[cfg(not(feature = "redis"))]
fn build_broker(_settings: &Settings) -> Result<Arc<dyn Broker>, BrokerError> {
    Ok(Arc::new(InMemoryBroker::new()))
}
