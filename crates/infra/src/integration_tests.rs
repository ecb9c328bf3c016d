//! Integration tests for the full streaming pipeline.
//!
//! Tests: Enqueue → Queue → Worker → Broker → DeliverySession → client
//!
//! Verifies:
//! - A client connected before the worker starts sees every event, in order
//! - Retries continue the chunk sequence and end in `done` or `error`
//! - Cancellation reaches a running worker, including via client departure
//! - The cloud-style backend drives the same flow

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use streamforge_core::{RequestId, RequestStatus, StreamEvent};
use streamforge_events::{Broker, Channel, ControlMessage, InMemoryBroker};

use crate::generation::{
    EchoGenerator, Fragments, GenerationError, GenerationRequest, Generator, ScriptedGenerator,
};
use crate::jobs::{
    CloudJobQueue, GenerationPayload, InMemoryJobQueue, Job, JobQueue, LocalCloudQueue,
    RetryPolicy,
};
use crate::repos::{InMemoryRequestRepository, NewRequest, RequestRepository};
use crate::streaming::{
    CancellationCoordinator, CancellationToken, ConnectionManager, DeliveryEnd, DeliverySession,
    EventSink,
};
use crate::workers::{JobDisposition, WorkerConfig, WorkerPool, WorkerRunner};

const Q: &str = "default";
const POLL: Duration = Duration::from_millis(20);

struct Pipeline<B: JobQueue> {
    queue: Arc<B>,
    broker: Arc<InMemoryBroker>,
    repo: Arc<InMemoryRequestRepository>,
    connections: Arc<ConnectionManager>,
    cancellation: Arc<CancellationCoordinator>,
    runner: Arc<WorkerRunner<Arc<B>>>,
}

impl<B: JobQueue + 'static> Pipeline<B> {
    fn new(queue: B, generator: impl Generator + 'static, retry: RetryPolicy) -> Self {
        let queue = Arc::new(queue);
        let broker = Arc::new(InMemoryBroker::new());
        let repo = Arc::new(InMemoryRequestRepository::new());
        let cancellation = Arc::new(CancellationCoordinator::new());
        let runner = Arc::new(WorkerRunner::new(
            queue.clone(),
            broker.clone(),
            repo.clone(),
            Arc::new(generator),
            cancellation.clone(),
            WorkerConfig::default()
                .with_retry(retry)
                .with_reserve_timeout(Duration::from_millis(10))
                .with_poll_interval(Duration::from_millis(10)),
        ));
        Self {
            queue,
            broker,
            repo,
            connections: Arc::new(ConnectionManager::new()),
            cancellation,
            runner,
        }
    }

    fn submit(&self, request_id: &str, prompt: &str) -> RequestId {
        let request_id = RequestId::new(request_id).unwrap();
        self.repo
            .create_request(NewRequest {
                request_id: request_id.clone(),
                prompt: prompt.to_string(),
                model: "echo-1".to_string(),
                user_id: None,
            })
            .unwrap();
        let job = Job::generation(&GenerationPayload::new(request_id.clone(), prompt)).unwrap();
        self.queue.enqueue(Q, job).unwrap();
        request_id
    }

    fn open(&self, request_id: &RequestId) -> DeliverySession {
        DeliverySession::open(
            request_id.clone(),
            self.broker.clone(),
            self.connections.clone(),
            self.cancellation.clone(),
        )
        .unwrap()
    }

    /// Run jobs on this thread until the queue stays empty.
    fn drain(&self) {
        while self.runner.run_once(Q).unwrap().is_some() {}
    }
}

/// Opens a session on a background thread and collects what it delivers.
fn deliver_in_background(
    session: DeliverySession,
) -> thread::JoinHandle<(DeliveryEnd, Vec<StreamEvent>)> {
    thread::spawn(move || {
        let mut events = Vec::new();
        let end = session.pump(&mut events, POLL);
        (end, events)
    })
}

fn chunks(events: &[StreamEvent]) -> Vec<(u64, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { seq, token, .. } => Some((*seq, token.clone())),
            _ => None,
        })
        .collect()
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn client_receives_chunks_then_done() {
    let p = Pipeline::new(
        InMemoryJobQueue::default(),
        ScriptedGenerator::new(["Hel", "lo"]),
        RetryPolicy::immediate(3),
    );
    let id = p.submit("r1", "greet");
    let delivery = deliver_in_background(p.open(&id));

    p.drain();
    let (end, events) = delivery.join().unwrap();

    assert_eq!(end, DeliveryEnd::Terminal("done"));
    assert_eq!(
        events,
        vec![
            StreamEvent::chunk(id.clone(), 1, "Hel"),
            StreamEvent::chunk(id.clone(), 2, "lo"),
            StreamEvent::done(id.clone(), "Hello"),
        ]
    );
    assert_eq!(
        p.repo.status_history(&id),
        vec![RequestStatus::Pending, RequestStatus::Running, RequestStatus::Done]
    );
    assert!(p.cancellation.is_empty());
    assert_eq!(p.connections.total_connections(), 0);
}

#[test]
fn retry_exhaustion_dead_letters_and_reports_error() {
    let p = Pipeline::new(
        InMemoryJobQueue::default(),
        ScriptedGenerator::always_failing("provider down"),
        RetryPolicy::immediate(3),
    );
    let id = p.submit("r1", "greet");
    let delivery = deliver_in_background(p.open(&id));

    let mut dispositions = Vec::new();
    while let Some(outcome) = p.runner.run_once(Q).unwrap() {
        dispositions.push(outcome.disposition);
    }
    let (end, events) = delivery.join().unwrap();

    assert_eq!(dispositions.len(), 3);
    assert!(matches!(dispositions[0], JobDisposition::Retried { .. }));
    assert!(matches!(dispositions[1], JobDisposition::Retried { .. }));
    assert_eq!(dispositions[2], JobDisposition::DeadLettered);

    assert_eq!(end, DeliveryEnd::Terminal("error"));
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Error { error, .. } if error.contains("provider down")));

    let dead = p.queue.dead_letters(Q, 10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.attempts, 3);
    assert_eq!(p.queue.inspect_queue_length(Q).unwrap(), 0);
    assert_eq!(
        p.repo.get_request(&id).unwrap().unwrap().status,
        RequestStatus::Failed
    );
}

#[test]
fn partial_output_retry_continues_sequence() {
    // First call emits one fragment then fails; the retry succeeds.
    struct FlakyOnce {
        inner: ScriptedGenerator,
        fallback: ScriptedGenerator,
        failed: AtomicBool,
    }

    impl Generator for FlakyOnce {
        fn generate(
            &self,
            request: &GenerationRequest,
            token: &CancellationToken,
        ) -> Result<Fragments, GenerationError> {
            if self.failed.swap(true, Ordering::SeqCst) {
                self.fallback.generate(request, token)
            } else {
                self.inner.generate(request, token)
            }
        }
    }

    let generator = FlakyOnce {
        inner: ScriptedGenerator::new(["a", "b"]).failing_after(1, "cut"),
        fallback: ScriptedGenerator::new(["a", "b"]),
        failed: AtomicBool::new(false),
    };
    let p = Pipeline::new(InMemoryJobQueue::default(), generator, RetryPolicy::immediate(3));
    let id = p.submit("r1", "x");
    let delivery = deliver_in_background(p.open(&id));

    p.drain();
    let (end, events) = delivery.join().unwrap();

    assert_eq!(end, DeliveryEnd::Terminal("done"));
    let seqs: Vec<u64> = chunks(&events).into_iter().map(|(seq, _)| seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[test]
fn control_cancel_stops_running_worker() {
    let p = Pipeline::new(
        InMemoryJobQueue::default(),
        ScriptedGenerator::new((0..100).map(|n| format!("t{n} "))).with_delay(Duration::from_millis(20)),
        RetryPolicy::immediate(3),
    );
    let id = p.submit("r1", "long");
    let delivery = deliver_in_background(p.open(&id));

    let runner = p.runner.clone();
    let worker = thread::spawn(move || runner.run_once(Q).unwrap().unwrap());

    assert!(wait_until(|| p.cancellation.len() == 1));
    thread::sleep(Duration::from_millis(60));
    p.broker
        .publish_control(&id, &ControlMessage::cancel(id.clone(), Some("user".to_string())))
        .unwrap();

    let outcome = worker.join().unwrap();
    let (end, events) = delivery.join().unwrap();

    assert_eq!(outcome.disposition, JobDisposition::Cancelled);
    assert_eq!(end, DeliveryEnd::Terminal("cancelled"));
    assert!(chunks(&events).len() < 100);
    assert_eq!(
        p.repo.get_request(&id).unwrap().unwrap().status,
        RequestStatus::Cancelled
    );
    assert_eq!(p.queue.inspect_queue_length(Q).unwrap(), 0);
}

#[test]
fn last_client_leaving_cancels_generation() {
    struct LeavesAfter {
        remaining: usize,
    }

    impl EventSink for LeavesAfter {
        fn send(&mut self, _event: &StreamEvent) -> bool {
            self.remaining = self.remaining.saturating_sub(1);
            self.remaining > 0
        }

        fn is_open(&self) -> bool {
            self.remaining > 0
        }
    }

    let p = Pipeline::new(
        InMemoryJobQueue::default(),
        ScriptedGenerator::new((0..100).map(|n| format!("t{n} "))).with_delay(Duration::from_millis(10)),
        RetryPolicy::immediate(3),
    );
    let id = p.submit("r1", "long");
    let session = p.open(&id);
    let client = thread::spawn(move || session.pump(&mut LeavesAfter { remaining: 3 }, POLL));

    let outcome = p.runner.run_once(Q).unwrap().unwrap();

    assert_eq!(client.join().unwrap(), DeliveryEnd::ClientGone);
    assert_eq!(outcome.disposition, JobDisposition::Cancelled);
    assert!(outcome.fragments < 100);
    assert_eq!(p.connections.active_subscribers(&id), 0);
}

#[test]
fn two_clients_see_identical_streams() {
    let p = Pipeline::new(
        InMemoryJobQueue::default(),
        EchoGenerator::new(),
        RetryPolicy::immediate(3),
    );
    let id = p.submit("r1", "one two three");
    let first = deliver_in_background(p.open(&id));
    let second = deliver_in_background(p.open(&id));
    assert_eq!(p.connections.active_subscribers(&id), 2);

    p.drain();
    let (_, a) = first.join().unwrap();
    let (_, b) = second.join().unwrap();

    assert_eq!(a, b);
    assert_eq!(a.last(), Some(&StreamEvent::done(id, "one two three")));
}

#[test]
fn late_subscriber_sees_only_later_events() {
    let p = Pipeline::new(
        InMemoryJobQueue::default(),
        ScriptedGenerator::new(["a"]),
        RetryPolicy::immediate(3),
    );
    let id = p.submit("r1", "x");
    p.drain();

    // The earlier `chunk`/`done` are gone; only what follows the open arrives.
    let session = p.open(&id);
    p.broker
        .publish(&Channel::request(&id), &StreamEvent::cancelled(id.clone()))
        .unwrap();
    let mut events = Vec::new();
    assert_eq!(session.pump(&mut events, POLL), DeliveryEnd::Terminal("cancelled"));
    assert_eq!(events, vec![StreamEvent::cancelled(id)]);
}

#[test]
fn pool_processes_many_requests_in_per_request_order() {
    let p = Pipeline::new(
        InMemoryJobQueue::default(),
        EchoGenerator::new(),
        RetryPolicy::immediate(3),
    );
    let ids: Vec<RequestId> = (0..8)
        .map(|n| p.submit(&format!("r{n}"), "a b c d"))
        .collect();
    let deliveries: Vec<_> = ids
        .iter()
        .map(|id| deliver_in_background(p.open(id)))
        .collect();

    let pool = WorkerPool::spawn(p.runner.clone(), Q, 3).unwrap();
    let results: Vec<_> = deliveries.into_iter().map(|d| d.join().unwrap()).collect();
    pool.shutdown();

    for (end, events) in results {
        assert_eq!(end, DeliveryEnd::Terminal("done"));
        let seqs: Vec<u64> = chunks(&events).into_iter().map(|(seq, _)| seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }
}

#[test]
fn cloud_backend_runs_the_same_flow() {
    let queue = CloudJobQueue::new(
        Arc::new(LocalCloudQueue::new()),
        "local://queues",
        Duration::from_secs(30),
    );
    let p = Pipeline::new(
        queue,
        ScriptedGenerator::new(["Hel", "lo"]).failing_first(1, "flaky"),
        RetryPolicy::immediate(3),
    );
    let id = p.submit("r1", "greet");
    let delivery = deliver_in_background(p.open(&id));

    p.drain();
    let (end, events) = delivery.join().unwrap();

    assert_eq!(end, DeliveryEnd::Terminal("done"));
    assert_eq!(
        chunks(&events),
        vec![(1, "Hel".to_string()), (2, "lo".to_string())]
    );
    assert_eq!(p.queue.inspect_queue_length(Q).unwrap(), 0);
    assert_eq!(p.runner.stats().jobs_retried, 1);
}
