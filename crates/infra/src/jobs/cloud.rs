//! Managed cloud queue backend.
//!
//! Jobs map onto messages of a hosted queue service with receipt handles and
//! visibility timeouts. The service itself sits behind [`CloudQueueClient`];
//! [`LocalCloudQueue`] is an in-process stand-in with the same semantics.
//!
//! ## Attempt counting
//!
//! A requeue sends a fresh message, which resets the service's receive count.
//! The job body therefore carries the attempts made before it was sent, and
//! the attempt count on reservation is `body.attempts + receive_count`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};
use uuid::Uuid;

use streamforge_core::JobId;

use super::queue::{JobQueue, QueueError};
use super::types::{DeadLetterEntry, Job};

/// Longest message delay the service accepts.
pub const MAX_DELAY: Duration = Duration::from_secs(900);

/// Interval between polls while long-polling the local emulator.
const LOCAL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One message handed out by `receive_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Handle that identifies this particular receipt; stale after redelivery.
    pub receipt_handle: String,
    pub body: String,
    /// How many times the service has delivered this message, this one included.
    pub receive_count: u32,
}

/// Minimal surface of a hosted message queue.
pub trait CloudQueueClient: Send + Sync + std::fmt::Debug {
    /// Send a message that becomes visible after `delay`.
    fn send_message(&self, queue_url: &str, body: String, delay: Duration)
    -> Result<String, QueueError>;

    /// Receive one message, long-polling up to `wait`.
    fn receive_message(
        &self,
        queue_url: &str,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Delete a received message. Stale handles are ignored.
    fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError>;

    /// Number of messages currently visible.
    fn approximate_number_of_messages(&self, queue_url: &str) -> Result<usize, QueueError>;

    /// Non-destructive look at up to `limit` message bodies, newest first.
    fn peek_messages(&self, queue_url: &str, limit: usize) -> Result<Vec<String>, QueueError>;
}

#[derive(Debug, Clone)]
struct LocalMessage {
    message_id: String,
    body: String,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<String>,
}

/// In-process emulation of a hosted queue.
#[derive(Debug, Default)]
pub struct LocalCloudQueue {
    queues: Mutex<HashMap<String, Vec<LocalMessage>>>,
}

impl LocalCloudQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<LocalMessage>>>, QueueError> {
        self.queues
            .lock()
            .map_err(|_| QueueError::Storage("local queue poisoned".to_string()))
    }

    fn try_receive(
        &self,
        queue_url: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let mut queues = self.lock()?;
        let now = Instant::now();
        let Some(message) = queues
            .get_mut(queue_url)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.visible_at <= now))
        else {
            return Ok(None);
        };

        let receipt = Uuid::now_v7().to_string();
        message.receive_count += 1;
        message.visible_at = now + visibility_timeout;
        message.receipt = Some(receipt.clone());

        Ok(Some(ReceivedMessage {
            message_id: message.message_id.clone(),
            receipt_handle: receipt,
            body: message.body.clone(),
            receive_count: message.receive_count,
        }))
    }
}

impl CloudQueueClient for LocalCloudQueue {
    fn send_message(
        &self,
        queue_url: &str,
        body: String,
        delay: Duration,
    ) -> Result<String, QueueError> {
        let message_id = Uuid::now_v7().to_string();
        let mut queues = self.lock()?;
        queues.entry(queue_url.to_string()).or_default().push(LocalMessage {
            message_id: message_id.clone(),
            body,
            visible_at: Instant::now() + delay.min(MAX_DELAY),
            receive_count: 0,
            receipt: None,
        });
        Ok(message_id)
    }

    fn receive_message(
        &self,
        queue_url: &str,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let give_up_at = Instant::now().checked_add(wait);
        loop {
            if let Some(message) = self.try_receive(queue_url, visibility_timeout)? {
                return Ok(Some(message));
            }
            let remaining = give_up_at
                .map_or(Duration::MAX, |at| at.saturating_duration_since(Instant::now()));
            if remaining.is_zero() {
                return Ok(None);
            }
            thread::sleep(remaining.min(LOCAL_POLL_INTERVAL));
        }
    }

    fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError> {
        let mut queues = self.lock()?;
        if let Some(msgs) = queues.get_mut(queue_url) {
            msgs.retain(|m| m.receipt.as_deref() != Some(receipt_handle));
        }
        Ok(())
    }

    fn approximate_number_of_messages(&self, queue_url: &str) -> Result<usize, QueueError> {
        let queues = self.lock()?;
        let now = Instant::now();
        Ok(queues
            .get(queue_url)
            .map_or(0, |msgs| msgs.iter().filter(|m| m.visible_at <= now).count()))
    }

    fn peek_messages(&self, queue_url: &str, limit: usize) -> Result<Vec<String>, QueueError> {
        let queues = self.lock()?;
        Ok(queues.get(queue_url).map_or_else(Vec::new, |msgs| {
            msgs.iter().rev().take(limit).map(|m| m.body.clone()).collect()
        }))
    }
}

#[derive(Debug, Clone)]
struct Receipt {
    queue: String,
    handle: String,
    job: Job,
}

/// [`JobQueue`] over a hosted message queue.
///
/// Queue `q` maps to `{base_url}/{q}`; its dead letters go to
/// `{base_url}/{q}-dlq`.
#[derive(Debug)]
pub struct CloudJobQueue {
    client: Arc<dyn CloudQueueClient>,
    base_url: String,
    visibility_timeout: Duration,
    receipts: Mutex<HashMap<JobId, Receipt>>,
}

impl CloudJobQueue {
    pub fn new(
        client: Arc<dyn CloudQueueClient>,
        base_url: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            visibility_timeout,
            receipts: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue_url(&self, queue: &str) -> String {
        format!("{}/{}", self.base_url, queue)
    }

    pub fn dead_letter_url(&self, queue: &str) -> String {
        format!("{}/{}-dlq", self.base_url, queue)
    }

    fn receipts(&self) -> Result<MutexGuard<'_, HashMap<JobId, Receipt>>, QueueError> {
        self.receipts
            .lock()
            .map_err(|_| QueueError::Storage("receipt table poisoned".to_string()))
    }

    fn take_receipt(&self, queue: &str, job_id: JobId) -> Result<Option<Receipt>, QueueError> {
        let mut receipts = self.receipts()?;
        match receipts.get(&job_id) {
            Some(r) if r.queue == queue => Ok(receipts.remove(&job_id)),
            _ => Ok(None),
        }
    }

    fn send(&self, queue: &str, job: &Job, delay: Duration) -> Result<(), QueueError> {
        let body =
            serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        if delay > MAX_DELAY {
            warn!(queue, job_id = %job.id, delay_secs = delay.as_secs(), "delay clamped to service maximum");
        }
        self.client
            .send_message(&self.queue_url(queue), body, delay.min(MAX_DELAY))?;
        Ok(())
    }
}

impl JobQueue for CloudJobQueue {
    fn enqueue(&self, queue: &str, mut job: Job) -> Result<JobId, QueueError> {
        job.queue = queue.to_string();
        let delay = job
            .visible_after
            .take()
            .and_then(|at| (at - chrono::Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        self.send(queue, &job, delay)?;
        debug!(queue, job_id = %job.id, "enqueued job");
        Ok(job.id)
    }

    fn reserve(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let Some(message) = self.client.receive_message(
            &self.queue_url(queue),
            self.visibility_timeout,
            timeout,
        )?
        else {
            return Ok(None);
        };

        let mut job: Job = match serde_json::from_str(&message.body) {
            Ok(job) => job,
            Err(e) => {
                // Unreadable bodies would be redelivered forever.
                error!(queue, message_id = %message.message_id, error = %e, "dropping undecodable message");
                self.client
                    .delete_message(&self.queue_url(queue), &message.receipt_handle)?;
                return Ok(None);
            }
        };
        job.attempts = job.attempts.saturating_add(message.receive_count);
        job.queue = queue.to_string();

        self.receipts()?.insert(
            job.id,
            Receipt {
                queue: queue.to_string(),
                handle: message.receipt_handle,
                job: job.clone(),
            },
        );
        debug!(queue, job_id = %job.id, attempts = job.attempts, "reserved job");
        Ok(Some(job))
    }

    fn ack(&self, queue: &str, job_id: JobId) -> Result<(), QueueError> {
        if let Some(receipt) = self.take_receipt(queue, job_id)? {
            self.client
                .delete_message(&self.queue_url(queue), &receipt.handle)?;
            debug!(queue, job_id = %job_id, "acked job");
        }
        Ok(())
    }

    fn fail(&self, queue: &str, job_id: JobId, reason: &str) -> Result<(), QueueError> {
        let Some(receipt) = self.take_receipt(queue, job_id)? else {
            return Ok(());
        };

        let url = self.queue_url(queue);
        let entry = DeadLetterEntry::new(receipt.job, reason);
        let body =
            serde_json::to_string(&entry).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.client
            .send_message(&self.dead_letter_url(queue), body, Duration::ZERO)?;
        self.client.delete_message(&url, &receipt.handle)?;
        warn!(queue, job_id = %job_id, reason, "job dead-lettered");
        Ok(())
    }

    fn requeue(&self, queue: &str, job: Job, delay: Duration) -> Result<JobId, QueueError> {
        // The next reservation adds the new message's receive count (1).
        let mut next = job;
        next.visible_after = None;
        self.send(queue, &next, delay)?;
        if let Some(receipt) = self.take_receipt(queue, next.id)? {
            self.client
                .delete_message(&self.queue_url(queue), &receipt.handle)?;
        }
        debug!(queue, job_id = %next.id, delay_ms = delay.as_millis() as u64, "requeued job");
        Ok(next.id)
    }

    fn inspect_queue_length(&self, queue: &str) -> Result<usize, QueueError> {
        self.client
            .approximate_number_of_messages(&self.queue_url(queue))
    }

    fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let bodies = self.client.peek_messages(&self.dead_letter_url(queue), limit)?;
        Ok(bodies
            .iter()
            .filter_map(|body| serde_json::from_str(body).ok())
            .collect())
    }
}
