//! Redis-backed queue (optional).
//!
//! Keys for queue `q`:
//!
//! - `queue:{q}`: ready list of job ids (LPUSH in, RPOP out)
//! - `queue:{q}:jobs`: hash of job id to job JSON
//! - `queue:{q}:attempts`: hash of job id to reservation count
//! - `queue:{q}:delayed`: zset of job ids scored by visible-at (ms)
//! - `queue:{q}:reserved`: zset of job ids scored by reservation deadline (ms)
//! - `queue:{q}:dlq`: list of dead-letter entries (JSON)
//!
//! Reservation is a single Lua script so promotion of due jobs, reclaiming
//! expired reservations and claiming happen atomically.

use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use redis::{Connection, Script};
use tracing::{debug, instrument, warn};

use streamforge_core::JobId;

use super::queue::{JobQueue, QueueError};
use super::types::{DeadLetterEntry, Job};

const RESERVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[4], id)
  redis.call('LPUSH', KEYS[1], id)
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[5], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[5], id)
  redis.call('RPUSH', KEYS[1], id)
end
while true do
  local id = redis.call('RPOP', KEYS[1])
  if not id then
    return false
  end
  local body = redis.call('HGET', KEYS[2], id)
  if body then
    local attempts = redis.call('HINCRBY', KEYS[3], id, 1)
    redis.call('ZADD', KEYS[5], now + tonumber(ARGV[2]), id)
    return {body, attempts}
  end
end
"#;

/// Removes a reserved job and returns `{body, attempts}`, or nil when the job
/// is not currently reserved.
const TAKE_RESERVED_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return false
end
local body = redis.call('HGET', KEYS[2], ARGV[1])
local attempts = redis.call('HGET', KEYS[3], ARGV[1]) or '0'
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
if not body then
  return false
end
return {body, tonumber(attempts)}
"#;

/// Delay between polls while waiting in `reserve`.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Keys {
    ready: String,
    jobs: String,
    attempts: String,
    delayed: String,
    reserved: String,
    dlq: String,
}

impl Keys {
    fn new(queue: &str) -> Self {
        let ready = format!("queue:{queue}");
        Self {
            jobs: format!("{ready}:jobs"),
            attempts: format!("{ready}:attempts"),
            delayed: format!("{ready}:delayed"),
            reserved: format!("{ready}:reserved"),
            dlq: format!("{ready}:dlq"),
            ready,
        }
    }
}

fn redis_err(e: redis::RedisError) -> QueueError {
    if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
        QueueError::Connection(e.to_string())
    } else {
        QueueError::Command(e.to_string())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Redis list/hash/zset queue with visibility timeouts.
pub struct RedisJobQueue {
    client: redis::Client,
    conn: Mutex<Option<Connection>>,
    visibility_timeout: Duration,
    reserve_script: Script,
    take_reserved_script: Script,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisJobQueue {
    pub fn new(redis_url: impl AsRef<str>, visibility_timeout: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            visibility_timeout,
            reserve_script: Script::new(RESERVE_SCRIPT),
            take_reserved_script: Script::new(TAKE_RESERVED_SCRIPT),
        })
    }

    /// Run `f` on the cached connection, reconnecting once if it was dropped.
    fn with_conn<T>(
        &self,
        f: impl Fn(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T, QueueError> {
        let mut slot = self.slot()?;
        for _ in 0..2 {
            if slot.is_none() {
                *slot = Some(self.client.get_connection().map_err(redis_err)?);
            }
            let Some(conn) = slot.as_mut() else {
                continue;
            };
            match f(conn) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_connection_dropped() || e.is_io_error() => {
                    warn!(error = %e, "redis connection lost; reconnecting");
                    *slot = None;
                }
                Err(e) => return Err(redis_err(e)),
            }
        }
        Err(QueueError::Connection("redis reconnect failed".to_string()))
    }

    fn slot(&self) -> Result<MutexGuard<'_, Option<Connection>>, QueueError> {
        self.conn
            .lock()
            .map_err(|_| QueueError::Storage("redis connection poisoned".to_string()))
    }

    fn store(&self, keys: &Keys, job: &Job, delay: Duration) -> Result<(), QueueError> {
        let body =
            serde_json::to_string(job).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let id = job.id.to_string();
        let visible_at = now_ms() + delay.as_millis() as i64;

        self.with_conn(|conn| {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("HSET")
                .arg(&keys.jobs)
                .arg(&id)
                .arg(&body)
                .ignore()
                .cmd("HSET")
                .arg(&keys.attempts)
                .arg(&id)
                .arg(job.attempts)
                .ignore()
                .cmd("ZREM")
                .arg(&keys.reserved)
                .arg(&id)
                .ignore();
            if delay.is_zero() {
                pipe.cmd("LPUSH")
                    .arg(&keys.ready)
                    .arg(&id)
                    .ignore();
            } else {
                pipe.cmd("ZADD")
                    .arg(&keys.delayed)
                    .arg(visible_at)
                    .arg(&id)
                    .ignore();
            }
            pipe.query::<()>(conn)
        })
    }

    fn try_reserve(&self, queue: &str, keys: &Keys) -> Result<Option<Job>, QueueError> {
        let visibility_ms = self.visibility_timeout.as_millis() as i64;
        let claimed: Option<(String, u32)> = self.with_conn(|conn| {
            self.reserve_script
                .key(&keys.ready)
                .key(&keys.jobs)
                .key(&keys.attempts)
                .key(&keys.delayed)
                .key(&keys.reserved)
                .arg(now_ms())
                .arg(visibility_ms)
                .invoke(conn)
        })?;

        let Some((body, attempts)) = claimed else {
            return Ok(None);
        };
        let mut job: Job =
            serde_json::from_str(&body).map_err(|e| QueueError::Serialization(e.to_string()))?;
        job.attempts = attempts;
        job.queue = queue.to_string();
        job.visible_after = None;
        Ok(Some(job))
    }

    fn take_reserved(&self, keys: &Keys, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let taken: Option<(String, u32)> = self.with_conn(|conn| {
            self.take_reserved_script
                .key(&keys.reserved)
                .key(&keys.jobs)
                .key(&keys.attempts)
                .arg(job_id.to_string())
                .invoke(conn)
        })?;

        let Some((body, attempts)) = taken else {
            return Ok(None);
        };
        let mut job: Job =
            serde_json::from_str(&body).map_err(|e| QueueError::Serialization(e.to_string()))?;
        job.attempts = attempts;
        Ok(Some(job))
    }
}

impl JobQueue for RedisJobQueue {
    #[instrument(level = "debug", skip(self, job), fields(job_id = %job.id))]
    fn enqueue(&self, queue: &str, mut job: Job) -> Result<JobId, QueueError> {
        let keys = Keys::new(queue);
        job.queue = queue.to_string();
        let delay = job
            .visible_after
            .take()
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);

        let id = job.id.to_string();
        let exists: bool = self.with_conn(|conn| {
            redis::cmd("HEXISTS").arg(&keys.jobs).arg(&id).query(conn)
        })?;
        if exists {
            return Err(QueueError::AlreadyExists(job.id));
        }

        self.store(&keys, &job, delay)?;
        debug!(queue, job_id = %job.id, "enqueued job");
        Ok(job.id)
    }

    #[instrument(level = "debug", skip(self))]
    fn reserve(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let keys = Keys::new(queue);
        let give_up_at = Instant::now().checked_add(timeout);
        loop {
            if let Some(job) = self.try_reserve(queue, &keys)? {
                debug!(queue, job_id = %job.id, attempts = job.attempts, "reserved job");
                return Ok(Some(job));
            }
            let remaining = give_up_at
                .map_or(Duration::MAX, |at| at.saturating_duration_since(Instant::now()));
            if remaining.is_zero() {
                return Ok(None);
            }
            thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }

    #[instrument(level = "debug", skip(self, job_id), fields(job_id = %job_id))]
    fn ack(&self, queue: &str, job_id: JobId) -> Result<(), QueueError> {
        let keys = Keys::new(queue);
        let id = job_id.to_string();
        self.with_conn(|conn| {
            redis::pipe()
                .atomic()
                .cmd("ZREM")
                .arg(&keys.reserved)
                .arg(&id)
                .ignore()
                .cmd("HDEL")
                .arg(&keys.jobs)
                .arg(&id)
                .ignore()
                .cmd("HDEL")
                .arg(&keys.attempts)
                .arg(&id)
                .ignore()
                .query::<()>(conn)
        })?;
        debug!(queue, job_id = %job_id, "acked job");
        Ok(())
    }

    #[instrument(level = "debug", skip(self, job_id, reason), fields(job_id = %job_id))]
    fn fail(&self, queue: &str, job_id: JobId, reason: &str) -> Result<(), QueueError> {
        let keys = Keys::new(queue);
        let Some(mut job) = self.take_reserved(&keys, job_id)? else {
            return Ok(());
        };
        job.queue = queue.to_string();

        let entry = DeadLetterEntry::new(job, reason);
        let body =
            serde_json::to_string(&entry).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.with_conn(|conn| {
            redis::cmd("LPUSH").arg(&keys.dlq).arg(&body).query::<()>(conn)
        })?;
        warn!(queue, job_id = %job_id, reason, "job dead-lettered");
        Ok(())
    }

    #[instrument(level = "debug", skip(self, job), fields(job_id = %job.id))]
    fn requeue(&self, queue: &str, mut job: Job, delay: Duration) -> Result<JobId, QueueError> {
        let keys = Keys::new(queue);
        job.queue = queue.to_string();
        job.visible_after = None;
        self.store(&keys, &job, delay)?;
        debug!(queue, job_id = %job.id, delay_ms = delay.as_millis() as u64, "requeued job");
        Ok(job.id)
    }

    fn inspect_queue_length(&self, queue: &str) -> Result<usize, QueueError> {
        let keys = Keys::new(queue);
        self.with_conn(|conn| redis::cmd("LLEN").arg(&keys.ready).query(conn))
    }

    fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = Keys::new(queue);
        let stop = limit.min(isize::MAX as usize) as isize - 1;
        let bodies: Vec<String> = self.with_conn(|conn| {
            redis::cmd("LRANGE")
                .arg(&keys.dlq)
                .arg(0)
                .arg(stop)
                .query(conn)
        })?;
        Ok(bodies
            .iter()
            .filter_map(|body| serde_json::from_str(body).ok())
            .collect())
    }
}
