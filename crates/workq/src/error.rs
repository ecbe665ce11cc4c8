use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkError>;

#[derive(Debug, Error)]
pub enum WorkError {
    /// No job is ready for dequeue. The only non-failure signal in the
    /// taxonomy; the idle-wait middleware turns it into a bounded sleep.
    #[error("empty queue")]
    EmptyQueue,

    /// The job should neither be acked nor re-enqueued by the retry
    /// middleware; the handler has taken responsibility for its disposition.
    #[error("do not retry")]
    DoNotRetry,

    /// The job is broken beyond retrying and will be discarded (acked).
    #[error("permanent error: do not retry")]
    Unrecoverable,

    /// The queue is not known to the backend.
    #[error("queue is not found")]
    QueueNotFound,

    /// The backend does not implement the requested optional capability.
    #[error("unsupported")]
    Unsupported,

    #[error("max execution time should be > 0")]
    InvalidMaxExecutionTime,

    #[error("idle wait should be > 0")]
    InvalidIdleWait,

    #[error("parallelism should be > 0")]
    InvalidParallelism,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("panic: {0}")]
    Panicked(String),
}

impl WorkError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn panicked(msg: impl Into<String>) -> Self {
        Self::Panicked(msg.into())
    }

    /// True for errors the retry middleware must not re-enqueue.
    /// `Unrecoverable` is a refinement of `DoNotRetry`, so it matches too.
    pub fn is_do_not_retry(&self) -> bool {
        matches!(self, Self::DoNotRetry | Self::Unrecoverable)
    }

    pub fn is_empty_queue(&self) -> bool {
        matches!(self, Self::EmptyQueue)
    }
}
