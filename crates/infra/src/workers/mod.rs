//! Background generation workers.

pub mod pool;
pub mod runner;

pub use pool::{WorkerPool, WorkerPoolHandle};
pub use runner::{JobDisposition, JobOutcome, WorkerConfig, WorkerRunner, WorkerStats};
