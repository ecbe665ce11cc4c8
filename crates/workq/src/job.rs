use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// A unit of work pulled from a queue.
///
/// The payload is opaque to the runtime. Only the retry bookkeeping fields
/// (`retries`, `last_error`, `enqueued_at`, `updated_at`) are ever mutated by
/// the worker, and only when a handler fails with a retryable error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub retries: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Job {
    /// Create a new job with a random id and a null payload.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            retries: 0,
            last_error: None,
            enqueued_at: now,
            updated_at: now,
            payload: serde_json::Value::Null,
        }
    }

    /// Serialize `data` into the payload.
    pub fn set_payload<T: Serialize>(&mut self, data: &T) -> Result<()> {
        self.payload = serde_json::to_value(data)?;
        Ok(())
    }

    /// Deserialize the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for a single dequeue call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DequeueOptions {
    /// Tenant/key prefix; must match the one used to enqueue.
    pub namespace: String,
    pub queue_id: String,
    /// Wall-clock instant used for time-based dequeue.
    pub at: DateTime<Utc>,
    /// How long the backend must hide the job from other consumers once it
    /// is handed out.
    pub invisible_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub namespace: String,
    pub queue_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckOptions {
    pub namespace: String,
    pub queue_id: String,
}
