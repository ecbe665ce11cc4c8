use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{AckOptions, DequeueOptions, EnqueueOptions, Job};

pub mod memory;

/// Minimum capability set a durable queue backend must provide.
///
/// A dequeued job stays hidden from other consumers for
/// `DequeueOptions::invisible_sec`; if it is never acked it reappears after
/// that window, which is what makes delivery at-least-once. Implementations
/// must be safe to invoke concurrently from many worker loops.
///
/// Optional capabilities (bulk dequeue, bulk ack, metrics export) are probed
/// through the `as_*` accessors; the default implementations advertise
/// nothing.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Hand out one job, or `Err(WorkError::EmptyQueue)` when none is ready
    /// at `opt.at`.
    async fn dequeue(&self, opt: &DequeueOptions) -> Result<Job>;

    /// Add a job, or reschedule it if the id is already present.
    async fn enqueue(&self, job: &Job, opt: &EnqueueOptions) -> Result<()>;

    /// Permanently remove a job from the queue.
    async fn ack(&self, job: &Job, opt: &AckOptions) -> Result<()>;

    fn as_bulk_dequeuer(&self) -> Option<&dyn BulkDequeuer> {
        None
    }

    fn as_bulk_acker(&self) -> Option<&dyn BulkAcker> {
        None
    }

    fn as_metrics_exporter(&self) -> Option<&dyn MetricsExporter> {
        None
    }
}

/// Optional capability: dequeue several jobs in one backend call.
#[async_trait]
pub trait BulkDequeuer: Send + Sync {
    /// Hand out up to `count` jobs. An empty vec and
    /// `Err(WorkError::EmptyQueue)` are equivalent.
    async fn bulk_dequeue(&self, count: u64, opt: &DequeueOptions) -> Result<Vec<Job>>;
}

/// Optional capability: acknowledge several jobs in one backend call.
#[async_trait]
pub trait BulkAcker: Send + Sync {
    async fn bulk_ack(&self, jobs: &[Job], opt: &AckOptions) -> Result<()>;
}

/// Optional capability: per-queue snapshot for [`Worker::export_metrics`].
///
/// [`Worker::export_metrics`]: crate::worker::Worker::export_metrics
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    async fn get_queue_metrics(&self, opt: &QueueMetricsOptions) -> Result<QueueMetrics>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetricsOptions {
    pub namespace: String,
    pub queue_id: String,
    /// Snapshot instant.
    pub at: DateTime<Utc>,
}

/// Point-in-time snapshot of one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub namespace: String,
    pub queue_id: String,
    /// Jobs ready for dequeue at the snapshot instant.
    pub ready_total: u64,
    /// Jobs scheduled for a future instant.
    pub scheduled_total: u64,
}

/// Aggregate snapshot over all registered queues.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub queue: Vec<QueueMetrics>,
}
