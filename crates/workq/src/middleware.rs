//! Function-shaped middleware around dequeue and handle operations.
//!
//! A middleware transforms a function of the same shape (a decorator). The
//! worker folds each handler's ordered middleware lists around the base
//! operations; the first list element wraps the innermost call, so a
//! middleware appended last observes the outcome of everything below it.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backoff::ExponentialBackoff;
use crate::error::{Result, WorkError};
use crate::job::{DequeueOptions, EnqueueOptions, Job};
use crate::queue::Queue;

/// Boxed future returned by dequeue and handle functions.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Produces one job per call.
pub type DequeueFn = Arc<dyn Fn(DequeueOptions) -> BoxFuture<Result<Job>> + Send + Sync>;

/// Wraps a [`DequeueFn`] with new behavior.
pub type DequeueMiddleware = Arc<dyn Fn(DequeueFn) -> DequeueFn + Send + Sync>;

/// Runs one job.
pub type HandleFn = Arc<dyn Fn(Job, DequeueOptions) -> BoxFuture<Result<()>> + Send + Sync>;

/// Wraps a [`HandleFn`] with new behavior.
pub type HandleMiddleware = Arc<dyn Fn(HandleFn) -> HandleFn + Send + Sync>;

/// Runs one job under a cancellation/deadline token.
pub type ContextHandleFn =
    Arc<dyn Fn(CancellationToken, Job, DequeueOptions) -> BoxFuture<Result<()>> + Send + Sync>;

/// Receives errors the worker absorbs instead of stopping (dequeue failures,
/// flush failures, re-enqueue failures). Must be safe to call concurrently
/// from any loop.
pub type ErrorSink = Arc<dyn Fn(&WorkError) + Send + Sync>;

/// Fold `middleware` around `base`, first element innermost.
pub fn wrap_dequeue(base: DequeueFn, middleware: &[DequeueMiddleware]) -> DequeueFn {
    middleware.iter().fold(base, |f, mw| mw(f))
}

/// Fold `middleware` around `base`, first element innermost.
pub fn wrap_handle(base: HandleFn, middleware: &[HandleMiddleware]) -> HandleFn {
    middleware.iter().fold(base, |f, mw| mw(f))
}

/// Paces polling: on an empty queue, sleep up to `idle` or until the loop is
/// cancelled, then propagate the empty-queue signal. Everything else passes
/// through untouched.
pub(crate) fn idle_wait(cancel: CancellationToken, idle: Duration) -> DequeueMiddleware {
    Arc::new(move |next: DequeueFn| {
        let cancel = cancel.clone();
        Arc::new(move |opt: DequeueOptions| -> BoxFuture<Result<Job>> {
            let next = next.clone();
            let cancel = cancel.clone();
            Box::pin(async move {
                match next(opt).await {
                    Err(err) if err.is_empty_queue() => {
                        tokio::select! {
                            _ = tokio::time::sleep(idle) => {}
                            _ = cancel.cancelled() => {}
                        }
                        Err(err)
                    }
                    other => other,
                }
            })
        })
    })
}

/// Converts an unwinding handler into an ordinary error so a panic never
/// crosses the loop boundary. The error message carries the panic payload
/// and a backtrace marker.
pub(crate) fn catch_panic() -> HandleMiddleware {
    Arc::new(|next: HandleFn| {
        Arc::new(move |job: Job, opt: DequeueOptions| -> BoxFuture<Result<()>> {
            let next = next.clone();
            Box::pin(async move {
                match AssertUnwindSafe(next(job, opt)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(WorkError::panicked(format!(
                        "{}\n\nstack backtrace:\n{}",
                        panic_message(&panic),
                        Backtrace::force_capture(),
                    ))),
                }
            })
        })
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(nested) = panic.downcast_ref::<Box<dyn Any + Send>>() {
        // some panics that unwind across a nested boxed future get re-boxed
        // by the runtime before we see them; unwrap one level and retry.
        panic_message(&**nested)
    } else {
        "unknown panic".to_string()
    }
}

/// Decides a failed job's fate.
///
/// Unrecoverable errors are swallowed so the caller acks; do-not-retry
/// errors are returned without side effects, leaving the job to the
/// visibility timeout; anything else re-enqueues a copy with updated retry
/// state at a backoff-delayed instant and returns the original error.
pub(crate) fn retry(queue: Arc<dyn Queue>, sink: ErrorSink) -> HandleMiddleware {
    Arc::new(move |next: HandleFn| {
        let queue = queue.clone();
        let sink = sink.clone();
        Arc::new(move |job: Job, opt: DequeueOptions| -> BoxFuture<Result<()>> {
            let next = next.clone();
            let queue = queue.clone();
            let sink = sink.clone();
            Box::pin(async move {
                let err = match next(job.clone(), opt.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                };
                if matches!(err, WorkError::Unrecoverable) {
                    // discard by acking
                    return Ok(());
                }
                if err.is_do_not_retry() {
                    return Err(err);
                }

                let now = Utc::now();
                let mut job = job;
                job.retries += 1;
                job.last_error = Some(err.to_string());
                job.updated_at = now;
                let delay = ExponentialBackoff::default().delay(job.retries);
                job.enqueued_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);

                debug!(
                    job_id = %job.id,
                    retries = job.retries,
                    delay_ms = delay.as_millis() as u64,
                    "job scheduled for retry"
                );

                let enqueue_opt = EnqueueOptions {
                    namespace: opt.namespace.clone(),
                    queue_id: opt.queue_id.clone(),
                };
                if let Err(enqueue_err) = queue.enqueue(&job, &enqueue_opt).await {
                    // the visibility timeout still redelivers the job, with
                    // stale retry state
                    sink(&enqueue_err);
                }
                Err(err)
            })
        })
    })
}
