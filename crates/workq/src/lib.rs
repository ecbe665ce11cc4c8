//! Queue-backed job worker runtime.
//!
//! `workq` drives units of work pulled from pluggable durable queues through
//! user handlers under bounded concurrency. It owns the delivery contracts a
//! host would otherwise have to get right by hand: visibility timeouts,
//! at-least-once acknowledgement with batched acks, retry with randomized
//! exponential backoff, panic isolation, and graceful shutdown.
//!
//! Backends plug in through the [`Queue`] trait; optional capabilities
//! (bulk dequeue, bulk ack, metrics export) are probed at runtime and used
//! when present.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use workq::{InMemoryQueue, JobOptions, Worker, WorkerOptions};
//!
//! #[tokio::main]
//! async fn main() -> workq::Result<()> {
//!     let queue = Arc::new(InMemoryQueue::new());
//!     let mut worker = Worker::new(WorkerOptions {
//!         namespace: "app".into(),
//!         queue,
//!         error_sink: None,
//!     });
//!
//!     worker.register(
//!         "emails",
//!         |job, _opt| async move {
//!             println!("sending email {}", job.id);
//!             Ok(())
//!         },
//!         JobOptions::new()
//!             .max_execution_time(Duration::from_secs(10))
//!             .idle_wait(Duration::from_millis(250))
//!             .parallelism(4),
//!     )?;
//!
//!     worker.start();
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!     worker.stop().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod error;
pub mod job;
pub mod middleware;
pub mod queue;
pub mod worker;

pub use backoff::ExponentialBackoff;
pub use error::{Result, WorkError};
pub use job::{AckOptions, DequeueOptions, EnqueueOptions, Job};
pub use middleware::{
    BoxFuture, DequeueFn, DequeueMiddleware, ErrorSink, HandleFn, HandleMiddleware,
};
pub use queue::memory::InMemoryQueue;
pub use queue::{
    BulkAcker, BulkDequeuer, Metrics, MetricsExporter, Queue, QueueMetrics, QueueMetricsOptions,
};
pub use worker::{JobOptions, Worker, WorkerOptions};
