//! Job queues with visibility timeouts, retry backoff, and dead-letter storage.
//!
//! ## Components
//!
//! - `Job`: payload plus delivery metadata (attempts, visibility)
//! - `JobQueue`: the backend contract (enqueue/reserve/ack/fail/requeue)
//! - `QueueBackend`: the backend chosen by configuration
//! - `RetryPolicy`: exponential backoff and the attempt ceiling
//!
//! Every backend delivers at least once: a reserved job that is never
//! settled reappears after its visibility timeout.

pub mod cloud;
pub mod in_memory;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis;
pub mod types;

pub use cloud::{CloudJobQueue, CloudQueueClient, LocalCloudQueue, ReceivedMessage};
pub use in_memory::InMemoryJobQueue;
pub use queue::{JobQueue, QueueBackend, QueueError};
#[cfg(feature = "redis")]
pub use redis::RedisJobQueue;
pub use types::{DeadLetterEntry, GenerationPayload, Job, RetryPolicy};
