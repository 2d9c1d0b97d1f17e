//! Tunables of the example module.

use jobhost_queue::{Backoff, JobOptions, KeepJobs, WorkerOptions};

pub const QUEUE_NAME: &str = "example";

pub const MAX_COMPLETED_JOBS_TO_KEEP: usize = 1000;
pub const MAX_FAILED_JOBS_TO_KEEP: usize = 5000;

/// Attempts before a job is marked failed.
pub const JOB_RETRY_ATTEMPTS: u32 = 3;
/// Base delay of the exponential backoff between attempts.
pub const RETRY_BACKOFF_DELAY_MS: u64 = 30_000;

/// Jobs processed simultaneously, from `WORKER_CONCURRENT_JOBS` (default 1).
///
/// # Panics
///
/// Panics if the variable is set to anything but a positive integer.
pub fn concurrent_jobs() -> usize {
    let jobs: usize = std::env::var("WORKER_CONCURRENT_JOBS")
        .unwrap_or_else(|_| "1".into())
        .parse()
        .expect("WORKER_CONCURRENT_JOBS must be a valid usize");
    assert!(jobs > 0, "WORKER_CONCURRENT_JOBS must be positive");
    jobs
}

pub fn default_job_options() -> JobOptions {
    JobOptions {
        attempts: JOB_RETRY_ATTEMPTS,
        delay: 0,
        backoff: Some(Backoff::exponential(RETRY_BACKOFF_DELAY_MS)),
    }
}

pub fn worker_options() -> WorkerOptions {
    WorkerOptions {
        concurrency: concurrent_jobs(),
        remove_on_complete: KeepJobs::Last(MAX_COMPLETED_JOBS_TO_KEEP),
        remove_on_fail: KeepJobs::Last(MAX_FAILED_JOBS_TO_KEEP),
        ..WorkerOptions::default()
    }
}
