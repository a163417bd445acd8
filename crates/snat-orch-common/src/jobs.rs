//! Per-key serialized job streams over a bounded worker pool.

use crate::task::{TaskError, TaskResult, TaskStatus};
use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{debug, warn};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};

/// A re-runnable unit of work.
///
/// The closure is invoked once per attempt, so a retried job re-drives its
/// full sequence from the start.
#[derive(Clone)]
pub struct Job(Arc<dyn Fn() -> BoxFuture<'static, TaskResult<()>> + Send + Sync>);

impl Job {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        Job(Arc::new(move || Box::pin(f())))
    }

    fn run(&self) -> BoxFuture<'static, TaskResult<()>> {
        (self.0)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Job")
    }
}

/// Final result of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: TaskStatus,
    /// Number of times the job ran (1 + retries).
    pub attempts: u32,
    pub error: Option<TaskError>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Configuration for [`KeyedJobQueue`].
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Maximum number of jobs running at once across all keys.
    pub workers: usize,
    /// Automatic retries after the first attempt, for retryable errors only.
    pub max_retries: u32,
    /// Base delay before a retry; the n-th retry waits n times this long.
    pub retry_backoff: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl JobQueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

struct PendingJob {
    job: Job,
    recovery: Option<Job>,
    reply: oneshot::Sender<JobOutcome>,
}

#[derive(Default)]
struct KeyState {
    pending: VecDeque<PendingJob>,
    running: bool,
}

struct Inner<K> {
    streams: DashMap<K, KeyState>,
    permits: Semaphore,
    config: JobQueueConfig,
}

/// Runs jobs one at a time per key, with different keys in parallel.
///
/// Each key owns a FIFO of pending jobs and at most one drain task. Drain
/// tasks compete for `workers` permits, so the number of concurrently
/// executing jobs is bounded regardless of how many keys are active. Jobs
/// for the same key never overlap and run in submission order; there is no
/// ordering between keys.
///
/// `submit` spawns onto the current tokio runtime and must be called from
/// within one.
pub struct KeyedJobQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for KeyedJobQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> KeyedJobQueue<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    pub fn new(config: JobQueueConfig) -> Self {
        let workers = config.workers.max(1);
        Self {
            inner: Arc::new(Inner {
                streams: DashMap::new(),
                permits: Semaphore::new(workers),
                config,
            }),
        }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.inner.config
    }

    /// Queues `job` behind any pending jobs for `key`.
    pub fn submit(&self, key: K, job: Job) -> oneshot::Receiver<JobOutcome> {
        self.enqueue(key, job, None)
    }

    /// Queues `job`; if it finishes unsuccessfully, `recovery` runs in the
    /// same slot before the next job for `key` starts.
    pub fn submit_with_recovery(
        &self,
        key: K,
        job: Job,
        recovery: Job,
    ) -> oneshot::Receiver<JobOutcome> {
        self.enqueue(key, job, Some(recovery))
    }

    /// Number of jobs waiting (not running) for `key`.
    pub fn pending(&self, key: &K) -> usize {
        self.inner
            .streams
            .get(key)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    /// Number of keys with a running or waiting job.
    pub fn active_keys(&self) -> usize {
        self.inner.streams.len()
    }

    /// Stops starting new jobs. Jobs not yet started complete as `Failed`.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    fn enqueue(&self, key: K, job: Job, recovery: Option<Job>) -> oneshot::Receiver<JobOutcome> {
        let (reply, rx) = oneshot::channel();
        let start_drain = {
            let mut state = self.inner.streams.entry(key.clone()).or_default();
            state.pending.push_back(PendingJob {
                job,
                recovery,
                reply,
            });
            !std::mem::replace(&mut state.running, true)
        };

        if start_drain {
            tokio::spawn(Arc::clone(&self.inner).drain(key));
        }
        rx
    }
}

impl<K> Inner<K>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
{
    async fn drain(self: Arc<Self>, key: K) {
        loop {
            let next = {
                let Some(mut state) = self.streams.get_mut(&key) else {
                    return;
                };
                let next = state.pending.pop_front();
                if next.is_none() {
                    state.running = false;
                }
                next
            };

            let Some(pending) = next else {
                // A submit racing with this check sees running == false and
                // starts its own drain, so only an idle stream is removed.
                self.streams
                    .remove_if(&key, |_, s| !s.running && s.pending.is_empty());
                return;
            };

            let outcome = self.execute(&key, &pending).await;
            if pending.reply.send(outcome).is_err() {
                debug!("JobQueue: outcome receiver for {} dropped", key);
            }
        }
    }

    async fn execute(&self, key: &K, pending: &PendingJob) -> JobOutcome {
        let Ok(_permit) = self.permits.acquire().await else {
            return JobOutcome {
                status: TaskStatus::Failed,
                attempts: 0,
                error: Some(TaskError::aborted("job queue closed")),
            };
        };

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            let err = match pending.job.run().await {
                Ok(()) => {
                    break JobOutcome {
                        status: TaskStatus::Success,
                        attempts,
                        error: None,
                    }
                }
                Err(err) => err,
            };

            let status = err.to_status();
            if status.is_retryable() && attempts <= self.config.max_retries {
                warn!(
                    "JobQueue: job for {} failed on attempt {}, retrying: {}",
                    key, attempts, err
                );
                tokio::time::sleep(self.config.retry_backoff * attempts).await;
                continue;
            }

            if status.is_retryable() {
                warn!(
                    "JobQueue: job for {} exhausted {} attempts: {}",
                    key, attempts, err
                );
            } else if status.is_failure() {
                warn!("JobQueue: job for {} failed: {}", key, err);
            } else {
                debug!("JobQueue: job for {} ignored: {}", key, err);
            }
            break JobOutcome {
                status,
                attempts,
                error: Some(err),
            };
        };

        if !outcome.is_success() {
            if let Some(recovery) = &pending.recovery {
                if let Err(err) = recovery.run().await {
                    warn!("JobQueue: recovery for {} failed: {}", key, err);
                }
            }
        }
        outcome
    }
}
