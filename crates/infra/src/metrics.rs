//! Queue metrics reporting.

use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::jobs::JobQueue;

/// Metric name for the visible queue depth.
pub const QUEUE_DEPTH: &str = "QueueDepth";

/// Destination for numeric metrics.
pub trait MetricsSink: Send + Sync {
    fn put_metric(&self, name: &str, value: f64, dimensions: &[(&str, &str)]);
}

/// Emits each metric as a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn put_metric(&self, name: &str, value: f64, dimensions: &[(&str, &str)]) {
        info!(metric = name, value, dimensions = ?dimensions, "metric");
    }
}

/// A recorded data point.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub value: f64,
    pub dimensions: Vec<(String, String)>,
}

/// Keeps every data point in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    points: Mutex<Vec<MetricPoint>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn put_metric(&self, name: &str, value: f64, dimensions: &[(&str, &str)]) {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MetricPoint {
                name: name.to_string(),
                value,
                dimensions: dimensions
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
    }
}

/// Report the depth of `queue_name`. Failures are logged and swallowed.
pub fn publish_queue_metrics(queue: &dyn JobQueue, queue_name: &str, sink: &dyn MetricsSink) {
    match queue.inspect_queue_length(queue_name) {
        Ok(depth) => sink.put_metric(QUEUE_DEPTH, depth as f64, &[("queue", queue_name)]),
        Err(e) => warn!(queue = queue_name, error = %e, "failed to read queue depth"),
    }
}
