//! In-memory queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use streamforge_core::JobId;

use super::queue::{JobQueue, QueueError};
use super::types::{DeadLetterEntry, Job, visible_after};

/// Longest single wait while blocked in `reserve`, so delayed jobs and expired
/// reservations are noticed without a notify.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Reservation {
    job: Job,
    deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Job>,
    reserved: HashMap<JobId, Reservation>,
    dead_letters: Vec<DeadLetterEntry>,
}

impl QueueState {
    fn contains(&self, id: JobId) -> bool {
        self.reserved.contains_key(&id) || self.ready.iter().any(|j| j.id == id)
    }

    /// Put expired reservations back at the front of the ready list.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let mut expired: Vec<JobId> = self
            .reserved
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        // Oldest first once pushed to the front.
        expired.sort_by_key(|id| std::cmp::Reverse(*id.as_uuid()));

        for id in expired {
            if let Some(r) = self.reserved.remove(&id) {
                warn!(job_id = %id, attempts = r.job.attempts, "reservation expired; redelivering");
                self.ready.push_front(r.job);
            }
        }
    }

    fn take_visible(&mut self, now: DateTime<Utc>) -> Option<Job> {
        let pos = self.ready.iter().position(|j| j.is_visible_at(now))?;
        self.ready.remove(pos)
    }
}

/// In-memory queue with visibility timeouts.
///
/// - FIFO among visible jobs
/// - A reservation that is not acked/failed/requeued within the visibility
///   timeout is redelivered
/// - Nothing survives the process
#[derive(Debug)]
pub struct InMemoryJobQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    available: Condvar,
    visibility_timeout: Duration,
}

impl InMemoryJobQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            available: Condvar::new(),
            visibility_timeout,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Number of jobs currently reserved by workers.
    pub fn reserved_count(&self, queue: &str) -> Result<usize, QueueError> {
        let queues = self.lock()?;
        Ok(queues.get(queue).map_or(0, |q| q.reserved.len()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>, QueueError> {
        self.queues
            .lock()
            .map_err(|_| QueueError::Storage("queue state poisoned".to_string()))
    }

    fn reservation_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout =
            chrono::Duration::from_std(self.visibility_timeout).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, queue: &str, mut job: Job) -> Result<JobId, QueueError> {
        let mut queues = self.lock()?;
        let state = queues.entry(queue.to_string()).or_default();
        if state.contains(job.id) {
            return Err(QueueError::AlreadyExists(job.id));
        }

        job.queue = queue.to_string();
        let id = job.id;
        state.ready.push_back(job);
        drop(queues);

        self.available.notify_all();
        debug!(queue, job_id = %id, "enqueued job");
        Ok(id)
    }

    fn reserve(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError> {
        // `None` means the timeout is too large to represent: wait indefinitely.
        let give_up_at = Instant::now().checked_add(timeout);
        let mut queues = self.lock()?;

        loop {
            let now = Utc::now();
            let deadline = self.reservation_deadline(now);
            if let Some(state) = queues.get_mut(queue) {
                state.reclaim_expired(now);
                if let Some(mut job) = state.take_visible(now) {
                    job.attempts += 1;
                    job.visible_after = None;
                    state.reserved.insert(
                        job.id,
                        Reservation {
                            job: job.clone(),
                            deadline,
                        },
                    );
                    debug!(queue, job_id = %job.id, attempts = job.attempts, "reserved job");
                    return Ok(Some(job));
                }
            }

            let remaining = give_up_at
                .map_or(Duration::MAX, |at| at.saturating_duration_since(Instant::now()));
            if remaining.is_zero() {
                return Ok(None);
            }

            let (guard, _) = self
                .available
                .wait_timeout(queues, remaining.min(MAX_WAIT_SLICE))
                .map_err(|_| QueueError::Storage("queue state poisoned".to_string()))?;
            queues = guard;
        }
    }

    fn ack(&self, queue: &str, job_id: JobId) -> Result<(), QueueError> {
        let mut queues = self.lock()?;
        if let Some(state) = queues.get_mut(queue) {
            if state.reserved.remove(&job_id).is_some() {
                debug!(queue, job_id = %job_id, "acked job");
            }
        }
        Ok(())
    }

    fn fail(&self, queue: &str, job_id: JobId, reason: &str) -> Result<(), QueueError> {
        let mut queues = self.lock()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(());
        };
        let Some(reservation) = state.reserved.remove(&job_id) else {
            return Ok(());
        };

        warn!(queue, job_id = %job_id, reason, "job dead-lettered");
        state
            .dead_letters
            .push(DeadLetterEntry::new(reservation.job, reason));
        Ok(())
    }

    fn requeue(&self, queue: &str, mut job: Job, delay: Duration) -> Result<JobId, QueueError> {
        let mut queues = self.lock()?;
        let state = queues.entry(queue.to_string()).or_default();
        state.reserved.remove(&job.id);
        // An expired reservation may already be back in `ready`; the caller's
        // copy wins.
        state.ready.retain(|j| j.id != job.id);

        job.queue = queue.to_string();
        job.visible_after = visible_after(delay);
        let id = job.id;
        state.ready.push_back(job);
        drop(queues);

        self.available.notify_all();
        debug!(queue, job_id = %id, delay_ms = delay.as_millis() as u64, "requeued job");
        Ok(id)
    }

    fn inspect_queue_length(&self, queue: &str) -> Result<usize, QueueError> {
        let queues = self.lock()?;
        let now = Utc::now();
        Ok(queues
            .get(queue)
            .map_or(0, |q| q.ready.iter().filter(|j| j.is_visible_at(now)).count()))
    }

    fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let queues = self.lock()?;
        Ok(queues.get(queue).map_or_else(Vec::new, |q| {
            q.dead_letters.iter().rev().take(limit).cloned().collect()
        }))
    }
}
