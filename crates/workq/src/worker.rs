//! Worker supervisor: handler registry, loop lifecycle, batched acks.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Result, WorkError};
use crate::job::{AckOptions, DequeueOptions, Job};
use crate::middleware::{
    catch_panic, idle_wait, retry, wrap_dequeue, wrap_handle, BoxFuture, ContextHandleFn,
    DequeueFn, DequeueMiddleware, ErrorSink, HandleFn, HandleMiddleware,
};
use crate::queue::{Metrics, Queue, QueueMetricsOptions};

/// Interval between ack-buffer flushes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Flush immediately once this many handled jobs await acknowledgement.
const ACK_BUFFER_LIMIT: usize = 1000;

/// Worker-level defaults shared by every registered handler.
#[derive(Clone)]
pub struct WorkerOptions {
    pub namespace: String,
    pub queue: Arc<dyn Queue>,
    pub error_sink: Option<ErrorSink>,
}

/// Per-queue execution policy.
///
/// Overrides worker-level defaults so each handler can run against its own
/// queue, namespace, and error sink. Validated at registration and immutable
/// afterwards.
#[derive(Clone)]
pub struct JobOptions {
    /// Deadline for a single handler invocation.
    pub max_execution_time: Duration,
    /// How long a loop sleeps when its queue is empty.
    pub idle_wait: Duration,
    /// Number of concurrent loops for this queue.
    pub parallelism: usize,
    pub namespace: Option<String>,
    pub queue: Option<Arc<dyn Queue>>,
    pub error_sink: Option<ErrorSink>,
    /// Applied around the dequeue call, first element innermost.
    pub dequeue_middleware: Vec<DequeueMiddleware>,
    /// Applied around the handler, first element innermost.
    pub handle_middleware: Vec<HandleMiddleware>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_execution_time: Duration::from_secs(30),
            idle_wait: Duration::from_secs(1),
            parallelism: 1,
            namespace: None,
            queue: None,
            error_sink: None,
            dequeue_middleware: Vec::new(),
            handle_middleware: Vec::new(),
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_execution_time(mut self, d: Duration) -> Self {
        self.max_execution_time = d;
        self
    }

    pub fn idle_wait(mut self, d: Duration) -> Self {
        self.idle_wait = d;
        self
    }

    pub fn parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = Some(sink);
        self
    }

    pub fn add_dequeue_middleware(mut self, mw: DequeueMiddleware) -> Self {
        self.dequeue_middleware.push(mw);
        self
    }

    pub fn add_handle_middleware(mut self, mw: HandleMiddleware) -> Self {
        self.handle_middleware.push(mw);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_execution_time.is_zero() {
            return Err(WorkError::InvalidMaxExecutionTime);
        }
        if self.idle_wait.is_zero() {
            return Err(WorkError::InvalidIdleWait);
        }
        if self.parallelism == 0 {
            return Err(WorkError::InvalidParallelism);
        }
        Ok(())
    }
}

struct Handler {
    queue_id: String,
    handle: ContextHandleFn,
    opt: JobOptions,
}

/// Runs jobs pulled from queues through registered handlers.
///
/// One worker owns many handler registrations; [`start`](Self::start) spawns
/// `parallelism` loops per registration on a shared cancellation scope and
/// [`stop`](Self::stop) tears them all down, flushing pending acks on the
/// way out.
pub struct Worker {
    opt: WorkerOptions,
    handlers: HashMap<String, Arc<Handler>>,
    cancel: Option<CancellationToken>,
    loops: Vec<JoinHandle<()>>,
}

impl Worker {
    pub fn new(opt: WorkerOptions) -> Self {
        Self {
            opt,
            handlers: HashMap::new(),
            cancel: None,
            loops: Vec::new(),
        }
    }

    /// Register a handler for `queue_id`.
    ///
    /// A second registration with the same id replaces the first.
    /// Registering after [`start`](Self::start) is undefined: loops read the
    /// registry once when they are spawned.
    pub fn register<F, Fut>(&mut self, queue_id: &str, handle: F, opt: JobOptions) -> Result<()>
    where
        F: Fn(Job, DequeueOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_with_context(queue_id, move |_cancel, job, opt| handle(job, opt), opt)
    }

    /// Like [`register`](Self::register), with a handler that also receives
    /// a cancellation token.
    ///
    /// The token is cancelled when the worker stops or when
    /// `max_execution_time` elapses. Handlers doing long I/O should observe
    /// it; one that does not will stall shutdown for up to its deadline.
    pub fn register_with_context<F, Fut>(
        &mut self,
        queue_id: &str,
        handle: F,
        opt: JobOptions,
    ) -> Result<()>
    where
        F: Fn(CancellationToken, Job, DequeueOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        opt.validate()?;
        let max_execution_time = opt.max_execution_time;
        let handle = Arc::new(handle);
        let with_deadline: ContextHandleFn = Arc::new(
            move |cancel: CancellationToken, job: Job, opt: DequeueOptions| -> BoxFuture<Result<()>> {
                let handle = handle.clone();
                Box::pin(async move {
                    let deadline = cancel.child_token();
                    match tokio::time::timeout(max_execution_time, handle(deadline.clone(), job, opt))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => {
                            deadline.cancel();
                            Err(WorkError::job_failed("max execution time exceeded"))
                        }
                    }
                })
            },
        );
        self.handlers.insert(
            queue_id.to_string(),
            Arc::new(Handler {
                queue_id: queue_id.to_string(),
                handle: with_deadline,
                opt,
            }),
        );
        Ok(())
    }

    /// Spawn `parallelism` loops per registered handler. Non-blocking.
    pub fn start(&mut self) {
        let cancel = CancellationToken::new();
        for handler in self.handlers.values() {
            for _ in 0..handler.opt.parallelism {
                let handler = handler.clone();
                let defaults = self.opt.clone();
                let cancel = cancel.clone();
                self.loops.push(tokio::spawn(run_loop(handler, defaults, cancel)));
            }
        }
        info!(loops = self.loops.len(), "worker started");
        self.cancel = Some(cancel);
    }

    /// Cancel every loop and wait for each to run its terminal ack flush.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        for task in self.loops.drain(..) {
            let _ = task.await;
        }
        info!("worker stopped");
    }

    /// Snapshot every registered queue that advertises the metrics
    /// capability. Queues without it are skipped; the first backend error
    /// aborts the export.
    pub async fn export_metrics(&self) -> Result<Metrics> {
        let mut metrics = Metrics::default();
        for handler in self.handlers.values() {
            let queue = handler
                .opt
                .queue
                .clone()
                .unwrap_or_else(|| self.opt.queue.clone());
            let namespace = handler
                .opt
                .namespace
                .clone()
                .unwrap_or_else(|| self.opt.namespace.clone());
            let Some(exporter) = queue.as_metrics_exporter() else {
                continue;
            };
            let snapshot = exporter
                .get_queue_metrics(&QueueMetricsOptions {
                    namespace,
                    queue_id: handler.queue_id.clone(),
                    at: Utc::now(),
                })
                .await?;
            metrics.queue.push(snapshot);
        }
        Ok(metrics)
    }
}

/// Errors are absorbed by the loops; log them so problems are noticeable
/// even when the host wires no sink.
fn default_error_sink() -> ErrorSink {
    Arc::new(|err: &WorkError| error!(error = %err, "worker error"))
}

/// Visibility handed to the backend: a job stays hidden from peers at least
/// until its execution deadline plus one full flush cycle, twice over.
fn invisible_seconds(max_execution_time: Duration) -> u64 {
    (2 * (max_execution_time + FLUSH_INTERVAL)).as_secs()
}

async fn run_loop(handler: Arc<Handler>, defaults: WorkerOptions, cancel: CancellationToken) {
    let queue = handler.opt.queue.clone().unwrap_or(defaults.queue);
    let namespace = handler.opt.namespace.clone().unwrap_or(defaults.namespace);
    let sink = handler
        .opt
        .error_sink
        .clone()
        .or(defaults.error_sink)
        .unwrap_or_else(default_error_sink);

    let dequeue = {
        let base = dequeue_source(queue.clone());
        let chained = wrap_dequeue(base, &handler.opt.dequeue_middleware);
        // outermost so it paces polling regardless of user middleware
        idle_wait(cancel.clone(), handler.opt.idle_wait)(chained)
    };

    let handle = {
        let base: HandleFn = {
            let inner = handler.handle.clone();
            let cancel = cancel.clone();
            Arc::new(move |job: Job, opt: DequeueOptions| -> BoxFuture<Result<()>> {
                inner(cancel.clone(), job, opt)
            })
        };
        let chained = wrap_handle(base, &handler.opt.handle_middleware);
        // panic isolation sits inside retry so an unwind becomes retryable
        retry(queue.clone(), sink.clone())(catch_panic()(chained))
    };

    let invisible_sec = invisible_seconds(handler.opt.max_execution_time);
    let ack_opt = AckOptions {
        namespace: namespace.clone(),
        queue_id: handler.queue_id.clone(),
    };

    let mut ack_buffer: Vec<Job> = Vec::new();
    let mut flush_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + FLUSH_INTERVAL,
        FLUSH_INTERVAL,
    );
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(queue_id = %handler.queue_id, "handler loop started");

    loop {
        let opt = DequeueOptions {
            namespace: namespace.clone(),
            queue_id: handler.queue_id.clone(),
            at: Utc::now(),
            invisible_sec,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = flush_tick.tick() => {
                if let Err(err) = flush_acks(queue.as_ref(), &mut ack_buffer, &ack_opt).await {
                    sink(&err);
                }
            }
            dequeued = dequeue(opt.clone()) => {
                match dequeued {
                    // the idle-wait middleware has already slept
                    Err(err) if err.is_empty_queue() => {}
                    Err(err) => sink(&err),
                    Ok(job) => {
                        // a failing handle has had its fate decided by the
                        // retry middleware; only successes are acked
                        if handle(job.clone(), opt).await.is_ok() {
                            ack_buffer.push(job);
                            if ack_buffer.len() >= ACK_BUFFER_LIMIT {
                                if let Err(err) =
                                    flush_acks(queue.as_ref(), &mut ack_buffer, &ack_opt).await
                                {
                                    sink(&err);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    // terminal best-effort flush
    if let Err(err) = flush_acks(queue.as_ref(), &mut ack_buffer, &ack_opt).await {
        sink(&err);
    }
    debug!(queue_id = %handler.queue_id, "handler loop stopped");
}

/// Flush pending acks, in bulk when the backend supports it. On failure the
/// unacked tail stays buffered for a later flush.
async fn flush_acks(queue: &dyn Queue, buffer: &mut Vec<Job>, opt: &AckOptions) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    if let Some(bulk) = queue.as_bulk_acker() {
        bulk.bulk_ack(buffer, opt).await?;
        buffer.clear();
        return Ok(());
    }
    let mut acked = 0;
    while acked < buffer.len() {
        if let Err(err) = queue.ack(&buffer[acked], opt).await {
            buffer.drain(..acked);
            return Err(err);
        }
        acked += 1;
    }
    buffer.clear();
    Ok(())
}

/// Single-job producer over the backend.
///
/// With the bulk-dequeue capability, a loop-local prefetch buffer is
/// refilled with `max(1, 60 / invisible_sec)` jobs at a visibility scaled by
/// the batch size, so the last prefetched job cannot time out before the
/// loop reaches it and steady work costs at most one bulk call a minute.
fn dequeue_source(queue: Arc<dyn Queue>) -> DequeueFn {
    if queue.as_bulk_dequeuer().is_none() {
        return Arc::new(move |opt: DequeueOptions| -> BoxFuture<Result<Job>> {
            let queue = queue.clone();
            Box::pin(async move { queue.dequeue(&opt).await })
        });
    }

    let prefetched: Arc<Mutex<VecDeque<Job>>> = Arc::new(Mutex::new(VecDeque::new()));
    Arc::new(move |opt: DequeueOptions| -> BoxFuture<Result<Job>> {
        let queue = queue.clone();
        let prefetched = prefetched.clone();
        Box::pin(async move {
            if let Some(job) = pop_prefetched(&prefetched)? {
                return Ok(job);
            }
            let Some(bulk) = queue.as_bulk_dequeuer() else {
                return queue.dequeue(&opt).await;
            };
            let count = (60 / opt.invisible_sec).max(1);
            let mut bulk_opt = opt.clone();
            bulk_opt.invisible_sec = opt.invisible_sec * count;
            let jobs = bulk.bulk_dequeue(count, &bulk_opt).await?;
            if jobs.is_empty() {
                return Err(WorkError::EmptyQueue);
            }
            {
                let mut buffer = prefetched
                    .lock()
                    .map_err(|_| WorkError::backend("prefetch lock poisoned"))?;
                buffer.extend(jobs);
            }
            match pop_prefetched(&prefetched)? {
                Some(job) => Ok(job),
                None => Err(WorkError::EmptyQueue),
            }
        })
    })
}

fn pop_prefetched(buffer: &Mutex<VecDeque<Job>>) -> Result<Option<Job>> {
    Ok(buffer
        .lock()
        .map_err(|_| WorkError::backend("prefetch lock poisoned"))?
        .pop_front())
}
