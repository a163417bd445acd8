//! Common orchestration primitives for the centralized SNAT control plane.
//!
//! - [`TaskError`] / [`TaskStatus`]: result classification deciding whether a
//!   failed job is retried
//! - [`SyncMap`]: map that never auto-creates entries, with underflow-safe
//!   reference counters ([`HasRefCount`])
//! - [`KeyedJobQueue`]: one serialized job stream per key (router id),
//!   multiplexed over a bounded worker pool, with bounded retries
//!
//! # Architecture
//!
//! Every inbound event is turned into a job keyed by the router it affects:
//!
//! 1. The daemon submits the job to the router's queue
//! 2. At most one job per router runs at a time; other routers run in parallel
//! 3. A failed job is retried while its error classifies as retryable
//! 4. The submitter receives the final [`JobOutcome`] through a oneshot channel

mod jobs;
mod sync_map;
mod task;

pub use jobs::{Job, JobOutcome, JobQueueConfig, KeyedJobQueue};
pub use sync_map::{HasRefCount, SyncMap, SyncMapError};
pub use task::{TaskError, TaskResult, TaskResultExt, TaskStatus};
