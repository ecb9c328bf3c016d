//! Generation worker: reserve a job, stream its fragments, settle it.
//!
//! One job runs like this:
//!
//! 1. Reserve the next job (blocking up to `reserve_timeout`).
//! 2. Mark the request running and fetch its cancellation token.
//! 3. Pull fragments from the generator. Each one is published as a `chunk`.
//!    Cancellation (token or control channel) and the generation timeout are
//!    checked between fragments; the timeout also fires the token, so a
//!    generator blocked on it wakes up.
//! 4. Settle:
//!    - completed: mark done, publish `done`, ack
//!    - cancelled: mark cancelled, ack, publish `cancelled`
//!    - failed with attempts left: requeue with backoff, no event
//!    - failed for the last time: dead-letter, mark failed, publish `error`
//!
//! Broker and repository failures are logged and do not change the outcome.
//! Queue failures are returned to the caller.

use std::sync::mpsc::TryRecvError;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use streamforge_core::{JobId, RequestId, RequestStatus, StreamEvent};
use streamforge_events::{Broker, Channel, ControlMessage, Subscription};

use crate::config::Settings;
use crate::generation::{GenerationError, GenerationRequest, Generator};
use crate::jobs::{GenerationPayload, Job, JobQueue, QueueError, RetryPolicy};
use crate::repos::{RequestRepository, Usage};
use crate::streaming::{CancellationCoordinator, CancellationToken};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging.
    pub name: String,
    pub retry: RetryPolicy,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// How long one `reserve` call may block.
    pub reserve_timeout: Duration,
    /// Wall-clock limit on one generation. Expiry cancels the generator's
    /// token and is handled as a retryable failure.
    pub generation_timeout: Option<Duration>,
    /// Model used when a payload names none.
    pub default_model: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "generation-worker".to_string(),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            reserve_timeout: Duration::from_secs(1),
            generation_timeout: None,
            default_model: "echo-1".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: settings.max_attempts,
                backoff_base: settings.backoff_base,
                backoff_unit: settings.backoff_unit,
                max_delay: settings.max_backoff,
            },
            poll_interval: settings.poll_interval,
            reserve_timeout: settings.reserve_timeout,
            generation_timeout: settings.generation_timeout,
            default_model: settings.default_model.clone(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = Some(timeout);
        self
    }

    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// How a processed job was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Completed,
    /// Requeued; visible again after `delay`.
    Retried { delay: Duration },
    DeadLettered,
    Cancelled,
    /// Acked without running (no request id to report to).
    Discarded,
}

/// Result of one `run_once` that found a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub request_id: Option<RequestId>,
    /// Attempts including this one.
    pub attempts: u32,
    /// Chunks published during this attempt.
    pub fragments: u64,
    pub disposition: JobDisposition,
}

/// Runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_cancelled: u64,
    pub jobs_discarded: u64,
    pub queue_errors: u64,
    pub current_running: usize,
}

impl WorkerStats {
    fn record(&mut self, disposition: JobDisposition) {
        self.jobs_processed += 1;
        match disposition {
            JobDisposition::Completed => self.jobs_succeeded += 1,
            JobDisposition::Retried { .. } => self.jobs_retried += 1,
            JobDisposition::DeadLettered => self.jobs_dead_lettered += 1,
            JobDisposition::Cancelled => self.jobs_cancelled += 1,
            JobDisposition::Discarded => self.jobs_discarded += 1,
        }
    }
}

enum StreamEnd {
    Completed { text: String },
    Cancelled,
}

/// Generation worker over any [`JobQueue`].
///
/// `run_once` is safe to call from several threads at once; the queue hands
/// each job to one caller.
pub struct WorkerRunner<Q: JobQueue> {
    queue: Q,
    broker: Arc<dyn Broker>,
    repository: Arc<dyn RequestRepository>,
    generator: Arc<dyn Generator>,
    cancellation: Arc<CancellationCoordinator>,
    config: WorkerConfig,
    stats: Mutex<WorkerStats>,
}

impl<Q: JobQueue> std::fmt::Debug for WorkerRunner<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRunner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Q: JobQueue> WorkerRunner<Q> {
    pub fn new(
        queue: Q,
        broker: Arc<dyn Broker>,
        repository: Arc<dyn RequestRepository>,
        generator: Arc<dyn Generator>,
        cancellation: Arc<CancellationCoordinator>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            broker,
            repository,
            generator,
            cancellation,
            config,
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Process at most one job from `queue_name`.
    ///
    /// Returns `Ok(None)` when no job became available within the reserve
    /// timeout.
    pub fn run_once(&self, queue_name: &str) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.queue.reserve(queue_name, self.config.reserve_timeout)? else {
            return Ok(None);
        };
        debug!(
            worker = %self.config.name,
            queue = queue_name,
            job_id = %job.id,
            attempts = job.attempts,
            "claimed job"
        );

        self.update_stats(|s| s.current_running += 1);
        let result = self.process(queue_name, job);
        self.update_stats(|s| {
            s.current_running = s.current_running.saturating_sub(1);
            match &result {
                Ok(outcome) => s.record(outcome.disposition),
                Err(_) => s.queue_errors += 1,
            }
        });
        result.map(Some)
    }

    /// Poll `queue_name` until `stop` is cancelled.
    ///
    /// Errors are logged; they never end the loop.
    pub fn run_forever(&self, queue_name: &str, stop: &CancellationToken) {
        info!(worker = %self.config.name, queue = queue_name, "worker started");

        while !stop.is_cancelled() {
            match self.run_once(queue_name) {
                Ok(Some(outcome)) => {
                    debug!(
                        worker = %self.config.name,
                        job_id = %outcome.job_id,
                        disposition = ?outcome.disposition,
                        "job settled"
                    );
                }
                Ok(None) => {
                    stop.wait_timeout(self.config.poll_interval);
                }
                Err(e) => {
                    error!(worker = %self.config.name, queue = queue_name, error = %e, "queue operation failed");
                    stop.wait_timeout(self.config.poll_interval);
                }
            }
        }

        info!(worker = %self.config.name, queue = queue_name, "worker stopped");
    }

    fn process(&self, queue_name: &str, job: Job) -> Result<JobOutcome, QueueError> {
        let payload = match job.generation_payload() {
            Ok(payload) => payload,
            Err(QueueError::MissingRequestId) => {
                error!(job_id = %job.id, "job payload has no request_id; discarding");
                self.queue.ack(queue_name, job.id)?;
                return Ok(outcome(&job, None, 0, JobDisposition::Discarded));
            }
            Err(e) => return self.reject_malformed(queue_name, &job, &e),
        };

        let request_id = payload.request_id.clone();
        self.set_status(&request_id, RequestStatus::Running, None);
        let token = self.cancellation.get_or_create_token(&request_id);

        let control = match self.broker.subscribe_control(&request_id) {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "control channel unavailable");
                None
            }
        };

        let mut seq = job.published_seq;
        let result = self.stream_with_deadline(&payload, &token, control.as_ref(), &mut seq);
        if let Some(sub) = &control {
            self.broker.unsubscribe(sub.channel(), sub.subscriber_id());
        }
        let fragments = seq - job.published_seq;

        match result {
            Ok(StreamEnd::Completed { text }) => {
                self.set_status(&request_id, RequestStatus::Done, None);
                let usage = Usage::estimate(&payload.prompt, fragments);
                if let Err(e) = self.repository.record_usage(&request_id, usage) {
                    warn!(request_id = %request_id, error = %e, "failed to record usage");
                }
                self.publish(&request_id, &StreamEvent::done(request_id.clone(), text));
                self.queue.ack(queue_name, job.id)?;
                self.cancellation.remove(&request_id);
                info!(request_id = %request_id, job_id = %job.id, fragments, "generation completed");
                Ok(outcome(&job, Some(request_id), fragments, JobDisposition::Completed))
            }
            Ok(StreamEnd::Cancelled) | Err(GenerationError::Cancelled) => {
                self.set_status(&request_id, RequestStatus::Cancelled, None);
                self.queue.ack(queue_name, job.id)?;
                self.publish(&request_id, &StreamEvent::cancelled(request_id.clone()));
                self.cancellation.remove(&request_id);
                info!(request_id = %request_id, job_id = %job.id, fragments, "generation cancelled");
                Ok(outcome(&job, Some(request_id), fragments, JobDisposition::Cancelled))
            }
            Err(e) => self.settle_failure(queue_name, job, request_id, seq, fragments, &e),
        }
    }

    /// Run [`Self::stream`] with the generation timeout armed on `token`.
    ///
    /// A watchdog cancels the token when the limit passes, which unblocks a
    /// generator waiting inside a step. The fired token is dropped from the
    /// coordinator so a retry starts with a fresh one.
    fn stream_with_deadline(
        &self,
        payload: &GenerationPayload,
        token: &CancellationToken,
        control: Option<&Subscription<ControlMessage>>,
        seq: &mut u64,
    ) -> Result<StreamEnd, GenerationError> {
        let Some(limit) = self.config.generation_timeout else {
            return self.stream(payload, token, control, seq);
        };

        let finished = CancellationToken::new();
        let (result, timed_out) = thread::scope(|scope| {
            let watchdog = scope.spawn(|| {
                if finished.wait_timeout(limit) || token.is_cancelled() {
                    return false;
                }
                token.cancel();
                true
            });
            let result = self.stream(payload, token, control, seq);
            finished.cancel();
            (result, watchdog.join().unwrap_or(false))
        });

        if !timed_out {
            return result;
        }
        self.cancellation.remove(&payload.request_id);
        match result {
            Ok(StreamEnd::Cancelled) | Err(GenerationError::Cancelled) => {
                warn!(request_id = %payload.request_id, limit_ms = limit.as_millis() as u64, "generation timed out");
                Err(GenerationError::Timeout(limit))
            }
            other => other,
        }
    }

    fn stream(
        &self,
        payload: &GenerationPayload,
        token: &CancellationToken,
        control: Option<&Subscription<ControlMessage>>,
        seq: &mut u64,
    ) -> Result<StreamEnd, GenerationError> {
        let started = Instant::now();
        let request = GenerationRequest::from_payload(payload, &self.config.default_model);

        if self.observe_cancel(&request.request_id, token, control) {
            return Ok(StreamEnd::Cancelled);
        }
        let mut fragments = self.generator.generate(&request, token)?;

        let mut text = String::new();
        loop {
            if self.observe_cancel(&request.request_id, token, control) {
                return Ok(StreamEnd::Cancelled);
            }
            if let Some(limit) = self.config.generation_timeout {
                if started.elapsed() >= limit {
                    return Err(GenerationError::Timeout(limit));
                }
            }

            let Some(item) = fragments.next() else {
                break;
            };
            let fragment = item?;

            *seq += 1;
            self.publish(
                &request.request_id,
                &StreamEvent::chunk(request.request_id.clone(), *seq, fragment.as_str()),
            );
            text.push_str(&fragment);
        }

        Ok(StreamEnd::Completed { text })
    }

    /// Apply pending control messages and report whether `token` is set.
    fn observe_cancel(
        &self,
        request_id: &RequestId,
        token: &CancellationToken,
        control: Option<&Subscription<ControlMessage>>,
    ) -> bool {
        if let Some(sub) = control {
            loop {
                match sub.try_recv() {
                    Ok(ControlMessage::Cancel { request_id: target, reason }) => {
                        if &target == request_id {
                            info!(request_id = %request_id, reason = ?reason, "cancel received on control channel");
                            token.cancel();
                        }
                    }
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
        }
        token.is_cancelled()
    }

    fn settle_failure(
        &self,
        queue_name: &str,
        mut job: Job,
        request_id: RequestId,
        seq: u64,
        fragments: u64,
        err: &GenerationError,
    ) -> Result<JobOutcome, QueueError> {
        let reason = err.to_string();

        if self.config.retry.should_retry(job.attempts) {
            let delay = self.config.retry.delay_for_attempt(job.attempts);
            warn!(
                request_id = %request_id,
                job_id = %job.id,
                attempts = job.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "generation failed; retrying"
            );
            let attempts = job.attempts;
            let job_id = job.id;
            job.published_seq = seq;
            self.queue.requeue(queue_name, job, delay)?;
            self.set_status(&request_id, RequestStatus::Pending, Some(&reason));
            return Ok(JobOutcome {
                job_id,
                request_id: Some(request_id),
                attempts,
                fragments,
                disposition: JobDisposition::Retried { delay },
            });
        }

        error!(
            request_id = %request_id,
            job_id = %job.id,
            attempts = job.attempts,
            error = %reason,
            "generation failed; dead-lettering"
        );
        self.queue.fail(queue_name, job.id, &reason)?;
        self.set_status(&request_id, RequestStatus::Failed, Some(&reason));
        self.publish(&request_id, &StreamEvent::error(request_id.clone(), reason));
        self.cancellation.remove(&request_id);
        Ok(outcome(&job, Some(request_id), fragments, JobDisposition::DeadLettered))
    }

    /// A payload with a request id but an unreadable shape cannot succeed on
    /// retry; dead-letter it straight away.
    fn reject_malformed(
        &self,
        queue_name: &str,
        job: &Job,
        err: &QueueError,
    ) -> Result<JobOutcome, QueueError> {
        let reason = format!("malformed payload: {err}");
        error!(job_id = %job.id, error = %reason, "dead-lettering malformed job");
        self.queue.fail(queue_name, job.id, &reason)?;

        let request_id = job
            .payload
            .get("request_id")
            .and_then(|v| v.as_str())
            .and_then(|s| RequestId::new(s).ok());
        if let Some(request_id) = &request_id {
            self.set_status(request_id, RequestStatus::Failed, Some(&reason));
            self.publish(request_id, &StreamEvent::error(request_id.clone(), reason));
        }
        Ok(outcome(job, request_id, 0, JobDisposition::DeadLettered))
    }

    fn publish(&self, request_id: &RequestId, event: &StreamEvent) {
        if let Err(e) = self.broker.publish(&Channel::request(request_id), event) {
            warn!(request_id = %request_id, event = event.kind(), error = %e, "failed to publish stream event");
        }
    }

    fn set_status(&self, request_id: &RequestId, status: RequestStatus, error: Option<&str>) {
        if let Err(e) = self
            .repository
            .update_request_status(request_id, status, error)
        {
            warn!(request_id = %request_id, status = %status, error = %e, "failed to update request status");
        }
    }
}

fn outcome(
    job: &Job,
    request_id: Option<RequestId>,
    fragments: u64,
    disposition: JobDisposition,
) -> JobOutcome {
    JobOutcome {
        job_id: job.id,
        request_id,
        attempts: job.attempts,
        fragments,
        disposition,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ScriptedGenerator;
    use crate::jobs::InMemoryJobQueue;
    use crate::repos::{InMemoryRequestRepository, NewRequest};
    use serde_json::json;
    use streamforge_events::InMemoryBroker;

    const Q: &str = "default";

    struct Harness {
        queue: Arc<InMemoryJobQueue>,
        broker: Arc<InMemoryBroker>,
        repo: Arc<InMemoryRequestRepository>,
        cancellation: Arc<CancellationCoordinator>,
        generator: Arc<ScriptedGenerator>,
        runner: WorkerRunner<Arc<InMemoryJobQueue>>,
    }

    fn harness(generator: ScriptedGenerator, retry: RetryPolicy) -> Harness {
        harness_with(
            generator,
            WorkerConfig::default()
                .with_retry(retry)
                .with_reserve_timeout(Duration::ZERO),
        )
    }

    fn harness_with(generator: ScriptedGenerator, config: WorkerConfig) -> Harness {
        let queue = Arc::new(InMemoryJobQueue::new(Duration::from_secs(30)));
        let broker = Arc::new(InMemoryBroker::new());
        let repo = Arc::new(InMemoryRequestRepository::new());
        let cancellation = Arc::new(CancellationCoordinator::new());
        let generator = Arc::new(generator);
        let runner = WorkerRunner::new(
            queue.clone(),
            broker.clone(),
            repo.clone(),
            generator.clone(),
            cancellation.clone(),
            config,
        );
        Harness {
            queue,
            broker,
            repo,
            cancellation,
            generator,
            runner,
        }
    }

    fn rid() -> RequestId {
        RequestId::new("r1").unwrap()
    }

    fn enqueue(h: &Harness) {
        h.repo
            .create_request(NewRequest {
                request_id: rid(),
                prompt: "say hello".to_string(),
                model: "echo-1".to_string(),
                user_id: None,
            })
            .unwrap();
        let job = Job::generation(&GenerationPayload::new(rid(), "say hello")).unwrap();
        h.queue.enqueue(Q, job).unwrap();
    }

    fn drain(sub: &Subscription<StreamEvent>) -> Vec<StreamEvent> {
        std::iter::from_fn(|| sub.try_recv().ok()).collect()
    }

    #[test]
    fn empty_queue_returns_none() {
        let h = harness(ScriptedGenerator::new(["x"]), RetryPolicy::immediate(3));
        assert!(h.runner.run_once(Q).unwrap().is_none());
    }

    #[test]
    fn completes_and_publishes_in_order() {
        let h = harness(ScriptedGenerator::new(["Hel", "lo"]), RetryPolicy::immediate(3));
        let sub = h.broker.subscribe(&Channel::request(&rid())).unwrap();
        enqueue(&h);

        let outcome = h.runner.run_once(Q).unwrap().unwrap();
        assert_eq!(outcome.disposition, JobDisposition::Completed);
        assert_eq!(outcome.fragments, 2);

        assert_eq!(
            drain(&sub),
            vec![
                StreamEvent::chunk(rid(), 1, "Hel"),
                StreamEvent::chunk(rid(), 2, "lo"),
                StreamEvent::done(rid(), "Hello"),
            ]
        );
        assert_eq!(
            h.repo.status_history(&rid()),
            vec![RequestStatus::Pending, RequestStatus::Running, RequestStatus::Done]
        );
        let usage = h.repo.get_request(&rid()).unwrap().unwrap().usage.unwrap();
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(h.queue.reserved_count(Q).unwrap(), 0);
        assert!(h.cancellation.is_empty());
    }

    #[test]
    fn transient_failure_is_retried_without_events() {
        let h = harness(
            ScriptedGenerator::new(["ok"]).failing_first(1, "flaky"),
            RetryPolicy::immediate(3),
        );
        let sub = h.broker.subscribe(&Channel::request(&rid())).unwrap();
        enqueue(&h);

        let first = h.runner.run_once(Q).unwrap().unwrap();
        assert_eq!(first.disposition, JobDisposition::Retried { delay: Duration::ZERO });
        assert!(drain(&sub).is_empty());
        assert!(h.queue.dead_letters(Q, 10).unwrap().is_empty());

        let second = h.runner.run_once(Q).unwrap().unwrap();
        assert_eq!(second.disposition, JobDisposition::Completed);
        assert_eq!(second.attempts, 2);
        assert_eq!(h.generator.calls(), 2);
        assert_eq!(
            drain(&sub),
            vec![StreamEvent::chunk(rid(), 1, "ok"), StreamEvent::done(rid(), "ok")]
        );
    }

    #[test]
    fn exhausted_job_is_dead_lettered_with_error_event() {
        let h = harness(ScriptedGenerator::always_failing("down"), RetryPolicy::immediate(3));
        let sub = h.broker.subscribe(&Channel::request(&rid())).unwrap();
        enqueue(&h);

        for _ in 0..2 {
            let outcome = h.runner.run_once(Q).unwrap().unwrap();
            assert!(matches!(outcome.disposition, JobDisposition::Retried { .. }));
        }
        let last = h.runner.run_once(Q).unwrap().unwrap();
        assert_eq!(last.disposition, JobDisposition::DeadLettered);
        assert_eq!(last.attempts, 3);
        assert!(h.runner.run_once(Q).unwrap().is_none());

        let dlq = h.queue.dead_letters(Q, 10).unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].job.attempts, 3);
        assert_eq!(
            drain(&sub),
            vec![StreamEvent::error(rid(), "provider error: down")]
        );
        let record = h.repo.get_request(&rid()).unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert_eq!(h.runner.stats().jobs_dead_lettered, 1);
        assert_eq!(h.runner.stats().jobs_retried, 2);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let h = harness(ScriptedGenerator::always_failing("down"), RetryPolicy::default());
        enqueue(&h);

        let first = h.runner.run_once(Q).unwrap().unwrap();
        assert_eq!(first.disposition, JobDisposition::Retried { delay: Duration::from_secs(2) });
        assert_eq!(h.queue.inspect_queue_length(Q).unwrap(), 0);
    }

    #[test]
    fn cancel_before_start_publishes_only_cancelled() {
        let h = harness(ScriptedGenerator::new(["never"]), RetryPolicy::immediate(3));
        let sub = h.broker.subscribe(&Channel::request(&rid())).unwrap();
        enqueue(&h);
        h.cancellation.get_or_create_token(&rid());
        assert!(h.cancellation.cancel(&rid()));

        let outcome = h.runner.run_once(Q).unwrap().unwrap();
        assert_eq!(outcome.disposition, JobDisposition::Cancelled);
        assert_eq!(h.generator.calls(), 0);
        assert_eq!(drain(&sub), vec![StreamEvent::cancelled(rid())]);
        assert_eq!(
            h.repo.get_request(&rid()).unwrap().unwrap().status,
            RequestStatus::Cancelled
        );
        assert!(h.runner.run_once(Q).unwrap().is_none());
    }

    #[test]
    fn control_message_cancels_at_next_fragment() {
        let h = harness(
            ScriptedGenerator::new(["a", "b", "c"]).with_delay(Duration::from_millis(100)),
            RetryPolicy::immediate(3),
        );
        enqueue(&h);

        // The control subscription only exists while the job runs, so send
        // the cancel once the first chunk shows up.
        let sub = h.broker.subscribe(&Channel::request(&rid())).unwrap();
        let broker = h.broker.clone();
        let watcher = std::thread::spawn(move || {
            let first = sub.recv().unwrap();
            broker
                .publish_control(&rid(), &ControlMessage::cancel(rid(), Some("user".into())))
                .unwrap();
            let mut events = vec![first];
            while let Ok(event) = sub.recv_timeout(Duration::from_secs(2)) {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            events
        });

        let outcome = h.runner.run_once(Q).unwrap().unwrap();
        let events = watcher.join().unwrap();

        assert_eq!(outcome.disposition, JobDisposition::Cancelled);
        assert_eq!(events.first(), Some(&StreamEvent::chunk(rid(), 1, "a")));
        assert_eq!(events.last(), Some(&StreamEvent::cancelled(rid())));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Done { .. })));
    }

    #[test]
    fn timeout_counts_as_failure() {
        let h = harness_with(
            ScriptedGenerator::new(["a", "b"]).with_delay(Duration::from_millis(30)),
            WorkerConfig::default()
                .with_retry(RetryPolicy::no_retry())
                .with_reserve_timeout(Duration::ZERO)
                .with_generation_timeout(Duration::from_millis(10)),
        );
        let sub = h.broker.subscribe(&Channel::request(&rid())).unwrap();
        enqueue(&h);

        let outcome = h.runner.run_once(Q).unwrap().unwrap();
        assert_eq!(outcome.disposition, JobDisposition::DeadLettered);
        let events = drain(&sub);
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    }

    /// Yields one fragment, then parks until its token is cancelled.
    struct StallingGenerator;

    impl Generator for StallingGenerator {
        fn generate(
            &self,
            _request: &GenerationRequest,
            token: &CancellationToken,
        ) -> Result<crate::generation::Fragments, GenerationError> {
            let token = token.clone();
            let mut step = 0;
            Ok(Box::new(std::iter::from_fn(move || {
                step += 1;
                match step {
                    1 => Some(Ok("a".to_string())),
                    _ => {
                        token.wait();
                        Some(Err(GenerationError::Cancelled))
                    }
                }
            })))
        }
    }

    #[test]
    fn timeout_unblocks_a_generator_stuck_in_a_step() {
        let queue = Arc::new(InMemoryJobQueue::new(Duration::from_secs(30)));
        let broker = Arc::new(InMemoryBroker::new());
        let repo = Arc::new(InMemoryRequestRepository::new());
        let cancellation = Arc::new(CancellationCoordinator::new());
        let runner = Arc::new(WorkerRunner::new(
            queue.clone(),
            broker.clone(),
            repo.clone(),
            Arc::new(StallingGenerator),
            cancellation.clone(),
            WorkerConfig::default()
                .with_retry(RetryPolicy::immediate(2))
                .with_reserve_timeout(Duration::ZERO)
                .with_generation_timeout(Duration::from_millis(50)),
        ));
        let sub = broker.subscribe(&Channel::request(&rid())).unwrap();
        let job = Job::generation(&GenerationPayload::new(rid(), "stall")).unwrap();
        queue.enqueue(Q, job).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = runner.clone();
        thread::spawn(move || {
            let _ = tx.send(worker.run_once(Q));
        });
        let outcome = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("run_once stayed blocked past the generation timeout")
            .unwrap()
            .unwrap();

        assert_eq!(outcome.disposition, JobDisposition::Retried { delay: Duration::ZERO });
        assert_eq!(drain(&sub), vec![StreamEvent::chunk(rid(), 1, "a")]);
        assert_eq!(queue.inspect_queue_length(Q).unwrap(), 1);
        // The retry must not inherit the fired token.
        assert!(!cancellation.get_or_create_token(&rid()).is_cancelled());
    }

    #[test]
    fn retry_after_partial_output_continues_sequence() {
        let h = harness(
            ScriptedGenerator::new(["a", "b"]).failing_after(1, "cut"),
            RetryPolicy::immediate(2),
        );
        let sub = h.broker.subscribe(&Channel::request(&rid())).unwrap();
        enqueue(&h);

        h.runner.run_once(Q).unwrap().unwrap();
        h.runner.run_once(Q).unwrap().unwrap();

        let seqs: Vec<u64> = drain(&sub)
            .into_iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk { seq, .. } => Some(seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn missing_request_id_is_discarded() {
        let h = harness(ScriptedGenerator::new(["x"]), RetryPolicy::immediate(3));
        h.queue.enqueue(Q, Job::new(json!({"prompt": "hi"}))).unwrap();

        let outcome = h.runner.run_once(Q).unwrap().unwrap();
        assert_eq!(outcome.disposition, JobDisposition::Discarded);
        assert_eq!(h.generator.calls(), 0);
        assert_eq!(h.queue.reserved_count(Q).unwrap(), 0);
        assert!(h.queue.dead_letters(Q, 10).unwrap().is_empty());
    }

    #[test]
    fn malformed_payload_is_dead_lettered() {
        let h = harness(ScriptedGenerator::new(["x"]), RetryPolicy::immediate(3));
        let sub = h.broker.subscribe(&Channel::request(&rid())).unwrap();
        h.queue
            .enqueue(Q, Job::new(json!({"request_id": "r1", "prompt": 42})))
            .unwrap();

        let outcome = h.runner.run_once(Q).unwrap().unwrap();
        assert_eq!(outcome.disposition, JobDisposition::DeadLettered);
        assert_eq!(h.queue.dead_letters(Q, 10).unwrap().len(), 1);
        assert!(matches!(drain(&sub).as_slice(), [StreamEvent::Error { .. }]));
    }

    #[test]
    fn run_forever_stops_on_signal() {
        let h = harness(ScriptedGenerator::new(["x"]), RetryPolicy::immediate(3));
        let runner = Arc::new(h.runner);
        let stop = CancellationToken::new();

        let worker = {
            let runner = runner.clone();
            let stop = stop.clone();
            std::thread::spawn(move || runner.run_forever(Q, &stop))
        };
        std::thread::sleep(Duration::from_millis(20));
        stop.cancel();
        worker.join().unwrap();
        assert_eq!(runner.stats().jobs_processed, 0);
    }
}
