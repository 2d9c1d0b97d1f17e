//! Broker backends.
//!
//! Every queue and worker handle talks to the broker through the
//! [`QueueBackend`] trait. Two implementations exist:
//!
//! - [`RedisQueueBackend`]: durable storage shared across processes.
//! - [`InMemoryQueueBackend`]: process-local storage for tests and
//!   single-process development.
//!
//! One backend instance is created per process and shared (via
//! [`SharedBackend`]) by every handle, so the Redis connection is shared too.

pub mod queue_in_memory;
pub mod queue_redis;

use std::sync::Arc;

use async_trait::async_trait;
use jobhost_core::types::TimestampMs;
use serde_json::Value;

pub use queue_in_memory::InMemoryQueueBackend;
pub use queue_redis::RedisQueueBackend;

use crate::connection::{BrokerConfig, StorageType};
use crate::error::QueueResult;
use crate::job::{Job, JobCounts, JobFailure, JobOptions, JobProgress, JobState, KeepJobs};

/// Shared handle to the process-wide broker backend.
pub type SharedBackend = Arc<dyn QueueBackend>;

/// Broker operations the harness relies on.
///
/// Claiming is atomic: a job id handed out by [`claim_next`] is held by
/// exactly one caller until it is moved to completed, failed or delayed, or
/// until its lock expires. A claimed job whose lock is not renewed through
/// [`extend_lock`] is considered stalled and is handed out again by a later
/// [`claim_next`].
///
/// [`claim_next`]: QueueBackend::claim_next
/// [`extend_lock`]: QueueBackend::extend_lock
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Key namespace for every queue of this backend.
    fn prefix(&self) -> &str;

    /// `<prefix>:<queue>`.
    fn qualified_name(&self, queue: &str) -> String {
        format!("{}:{}", self.prefix(), queue)
    }

    /// Check that the broker is reachable.
    async fn ping(&self) -> QueueResult<()>;

    /// Store a new job and make it claimable (or delayed when `opts.delay > 0`).
    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        opts: JobOptions,
    ) -> QueueResult<Job>;

    async fn get_job(&self, queue: &str, id: &str) -> QueueResult<Option<Job>>;

    /// Jobs currently in any of `states`, grouped in the order given.
    async fn get_jobs(&self, queue: &str, states: &[JobState]) -> QueueResult<Vec<Job>>;

    async fn get_job_counts(&self, queue: &str) -> QueueResult<JobCounts>;

    /// Re-queue stalled active jobs and promote due delayed jobs, then
    /// atomically move the oldest waiting job to active, locked for
    /// `lock_ms`. Returns `None` when nothing is waiting.
    async fn claim_next(&self, queue: &str, lock_ms: u64) -> QueueResult<Option<Job>>;

    /// Push the lock of an active job `lock_ms` into the future. Returns
    /// `false` when the job no longer holds a lock (it finished or was
    /// recovered as stalled).
    async fn extend_lock(&self, queue: &str, id: &str, lock_ms: u64) -> QueueResult<bool>;

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &JobProgress,
    ) -> QueueResult<()>;

    /// Append a log line to the job; returns the new number of log lines.
    async fn add_log(&self, queue: &str, id: &str, line: &str) -> QueueResult<u64>;

    async fn get_logs(&self, queue: &str, id: &str) -> QueueResult<Vec<String>>;

    /// Move an active job to completed, then trim completed jobs to `keep`.
    async fn move_to_completed(
        &self,
        queue: &str,
        id: &str,
        return_value: Value,
        keep: KeepJobs,
    ) -> QueueResult<Job>;

    /// Record a final failure, move the job to failed, then trim to `keep`.
    async fn move_to_failed(
        &self,
        queue: &str,
        id: &str,
        failure: &JobFailure,
        keep: KeepJobs,
    ) -> QueueResult<Job>;

    /// Record a failed attempt and schedule the job again after `delay_ms`.
    async fn retry_later(
        &self,
        queue: &str,
        id: &str,
        failure: &JobFailure,
        delay_ms: u64,
    ) -> QueueResult<Job>;
}

/// `now + delay_ms`, saturating at the far end of the timestamp range.
pub(crate) fn due_at(now: TimestampMs, delay_ms: u64) -> TimestampMs {
    now.saturating_add(i64::try_from(delay_ms).unwrap_or(i64::MAX))
}

/// Open the backend selected by `config`.
///
/// For Redis this establishes the shared connection, bounded by
/// `config.connection_timeout_ms`.
pub async fn connect(config: &BrokerConfig) -> QueueResult<SharedBackend> {
    match config.storage_type {
        StorageType::Redis => {
            let backend = RedisQueueBackend::connect(config).await?;
            Ok(Arc::new(backend))
        }
        StorageType::InMemory => {
            tracing::warn!("Using in-memory queue storage; jobs are not shared between processes");
            Ok(Arc::new(InMemoryQueueBackend::new(config.prefix.clone())))
        }
    }
}
