//! In-memory queue backend (not persistent, for testing/dev).

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::{BulkAcker, BulkDequeuer, MetricsExporter, Queue, QueueMetrics, QueueMetricsOptions};
use crate::error::{Result, WorkError};
use crate::job::{AckOptions, DequeueOptions, EnqueueOptions, Job};

#[derive(Debug, Clone)]
struct Stored {
    job: Job,
    invisible_until: DateTime<Utc>,
}

/// In-memory implementation of the full queue capability set.
///
/// Visibility works the way a durable backend's does: a dequeued job is
/// hidden until its timeout elapses, then redelivered. Safe to share across
/// loops via `Arc`.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, Vec<Stored>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, queue_id: &str) -> String {
        format!("{namespace}:{queue_id}")
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<Stored>>>> {
        self.queues
            .lock()
            .map_err(|_| WorkError::backend("lock poisoned"))
    }

    /// Hand out up to `count` visible jobs, oldest enqueue time first,
    /// hiding each until `opt.at + opt.invisible_sec`.
    fn take_ready(&self, count: usize, opt: &DequeueOptions) -> Result<Vec<Job>> {
        let mut queues = self.lock()?;
        let Some(jobs) = queues.get_mut(&Self::key(&opt.namespace, &opt.queue_id)) else {
            return Err(WorkError::EmptyQueue);
        };

        let mut order: Vec<usize> = (0..jobs.len()).collect();
        order.sort_by_key(|&i| jobs[i].job.enqueued_at);

        let invisible_until = opt.at + Duration::seconds(opt.invisible_sec as i64);
        let mut out = Vec::new();
        for i in order {
            if out.len() == count {
                break;
            }
            let stored = &mut jobs[i];
            if stored.job.enqueued_at <= opt.at && stored.invisible_until <= opt.at {
                stored.invisible_until = invisible_until;
                out.push(stored.job.clone());
            }
        }
        if out.is_empty() {
            return Err(WorkError::EmptyQueue);
        }
        Ok(out)
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn dequeue(&self, opt: &DequeueOptions) -> Result<Job> {
        Ok(self.take_ready(1, opt)?.remove(0))
    }

    async fn enqueue(&self, job: &Job, opt: &EnqueueOptions) -> Result<()> {
        let mut queues = self.lock()?;
        let entries = queues
            .entry(Self::key(&opt.namespace, &opt.queue_id))
            .or_default();
        match entries.iter_mut().find(|s| s.job.id == job.id) {
            Some(existing) => {
                // reschedule: visibility is governed by enqueued_at again
                existing.job = job.clone();
                existing.invisible_until = DateTime::<Utc>::MIN_UTC;
            }
            None => entries.push(Stored {
                job: job.clone(),
                invisible_until: DateTime::<Utc>::MIN_UTC,
            }),
        }
        Ok(())
    }

    async fn ack(&self, job: &Job, opt: &AckOptions) -> Result<()> {
        let mut queues = self.lock()?;
        if let Some(entries) = queues.get_mut(&Self::key(&opt.namespace, &opt.queue_id)) {
            entries.retain(|s| s.job.id != job.id);
        }
        Ok(())
    }

    fn as_bulk_dequeuer(&self) -> Option<&dyn BulkDequeuer> {
        Some(self)
    }

    fn as_bulk_acker(&self) -> Option<&dyn BulkAcker> {
        Some(self)
    }

    fn as_metrics_exporter(&self) -> Option<&dyn MetricsExporter> {
        Some(self)
    }
}

#[async_trait]
impl BulkDequeuer for InMemoryQueue {
    async fn bulk_dequeue(&self, count: u64, opt: &DequeueOptions) -> Result<Vec<Job>> {
        self.take_ready(count as usize, opt)
    }
}

#[async_trait]
impl BulkAcker for InMemoryQueue {
    async fn bulk_ack(&self, jobs: &[Job], opt: &AckOptions) -> Result<()> {
        let ids: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        let mut queues = self.lock()?;
        if let Some(entries) = queues.get_mut(&Self::key(&opt.namespace, &opt.queue_id)) {
            entries.retain(|s| !ids.contains(s.job.id.as_str()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsExporter for InMemoryQueue {
    async fn get_queue_metrics(&self, opt: &QueueMetricsOptions) -> Result<QueueMetrics> {
        let queues = self.lock()?;
        let (ready, scheduled) = queues
            .get(&Self::key(&opt.namespace, &opt.queue_id))
            .map(|jobs| {
                jobs.iter().fold((0u64, 0u64), |(ready, scheduled), s| {
                    if s.job.enqueued_at > opt.at {
                        (ready, scheduled + 1)
                    } else if s.invisible_until <= opt.at {
                        (ready + 1, scheduled)
                    } else {
                        // in flight: counted in neither bucket
                        (ready, scheduled)
                    }
                })
            })
            .unwrap_or((0, 0));
        Ok(QueueMetrics {
            namespace: opt.namespace.clone(),
            queue_id: opt.queue_id.clone(),
            ready_total: ready,
            scheduled_total: scheduled,
        })
    }
}
