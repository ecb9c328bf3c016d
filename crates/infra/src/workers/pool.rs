//! A fixed set of worker threads sharing one runner.

use std::io;
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::jobs::JobQueue;
use crate::streaming::CancellationToken;

use super::runner::{WorkerRunner, WorkerStats};

/// Handle to control and join a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle<Q: JobQueue> {
    stop: CancellationToken,
    joins: Vec<thread::JoinHandle<()>>,
    runner: Arc<WorkerRunner<Q>>,
}

impl<Q: JobQueue> WorkerPoolHandle<Q> {
    /// Ask every worker to stop after its current job and wait for them.
    pub fn shutdown(mut self) {
        self.stop.cancel();
        for join in self.joins.drain(..) {
            if join.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        info!("worker pool stopped");
    }

    /// Aggregate statistics across all workers.
    pub fn stats(&self) -> WorkerStats {
        self.runner.stats()
    }

    pub fn size(&self) -> usize {
        self.joins.len()
    }
}

/// Spawns `concurrency` threads running [`WorkerRunner::run_forever`].
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn<Q>(
        runner: Arc<WorkerRunner<Q>>,
        queue_name: impl Into<String>,
        concurrency: usize,
    ) -> io::Result<WorkerPoolHandle<Q>>
    where
        Q: JobQueue + 'static,
    {
        let queue_name = queue_name.into();
        let stop = CancellationToken::new();
        let mut handle = WorkerPoolHandle {
            stop: stop.clone(),
            joins: Vec::with_capacity(concurrency),
            runner: runner.clone(),
        };

        for n in 0..concurrency.max(1) {
            let runner = runner.clone();
            let stop = stop.clone();
            let queue_name = queue_name.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{n}", runner.config().name))
                .spawn(move || runner.run_forever(&queue_name, &stop));

            match spawned {
                Ok(join) => handle.joins.push(join),
                Err(e) => {
                    handle.shutdown();
                    return Err(e);
                }
            }
        }

        info!(queue = %queue_name, workers = handle.joins.len(), "worker pool started");
        Ok(handle)
    }
}
