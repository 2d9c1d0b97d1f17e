//! Consumer-side handle: claims jobs of one queue and runs a [`Processor`]
//! on them with bounded concurrency.
//!
//! A job's attempt ends in one of three ways:
//!
//! - the processor returns `Ok`: the job moves to completed;
//! - it returns `Err` (or panics) and attempts remain: the job is
//!   rescheduled after its backoff delay;
//! - it fails on its last attempt: the job moves to failed.
//!
//! Every outcome is also published as a [`WorkerEvent`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::SharedBackend;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobFailure, JobProgress, KeepJobs};

/// Capacity of the per-worker event channel. Slow subscribers lag rather
/// than block the worker.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default pause between claim attempts when the queue is empty.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default time a claimed job stays locked without renewal.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// User code run for every claimed job.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Process one job. The returned value is stored as the job's return
    /// value; an error fails the attempt.
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<Value>;
}

/// What a processor sees of the job it is running.
pub struct JobContext {
    job: Job,
    queue: String,
    backend: SharedBackend,
    events: broadcast::Sender<WorkerEvent>,
}

impl JobContext {
    /// Snapshot of the job as it was when claimed.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn data(&self) -> &Value {
        &self.job.data
    }

    /// Persist progress and notify subscribers.
    pub async fn update_progress(&self, progress: impl Into<JobProgress>) -> QueueResult<()> {
        let progress = progress.into();
        self.backend
            .update_progress(&self.queue, &self.job.id, &progress)
            .await?;
        let _ = self.events.send(WorkerEvent::Progress {
            job_id: self.job.id.clone(),
            progress,
        });
        Ok(())
    }

    /// Append a line to the job's log.
    pub async fn log(&self, line: impl AsRef<str>) -> QueueResult<u64> {
        self.backend
            .add_log(&self.queue, &self.job.id, line.as_ref())
            .await
    }
}

// ---------------------------------------------------------------------------
// Options and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum number of jobs processed at the same time.
    pub concurrency: usize,
    pub remove_on_complete: KeepJobs,
    pub remove_on_fail: KeepJobs,
    pub poll_interval: Duration,
    /// How long a claimed job stays locked. The lock is renewed at half this
    /// interval while the processor runs; a job whose lock lapses (its worker
    /// died) is handed out again by the next claim.
    pub lock_duration: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            remove_on_complete: KeepJobs::All,
            remove_on_fail: KeepJobs::All,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lock_duration: DEFAULT_LOCK_DURATION,
        }
    }
}

/// Lifecycle notifications published by a running worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Progress {
        job_id: String,
        progress: JobProgress,
    },
    Completed {
        job_id: String,
        return_value: Value,
    },
    Failed {
        job_id: String,
        /// Failed attempts so far, this one included.
        attempts_made: u32,
        /// Attempts allowed in total.
        attempts: u32,
        error: String,
        will_retry: bool,
    },
    /// The worker itself hit an error (broker unreachable, bookkeeping failed).
    Error { message: String },
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Everything the claim loop and its job tasks share.
struct Shared {
    queue: String,
    processor: Arc<dyn Processor>,
    options: WorkerOptions,
    backend: SharedBackend,
    events: broadcast::Sender<WorkerEvent>,
}

pub struct Worker {
    name: String,
    qualified_name: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    /// Cancelled when the claim loop stops without `close` being called.
    crashed: CancellationToken,
    crash_reason: Arc<OnceLock<String>>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("qualified_name", &self.qualified_name)
            .field("options", &self.shared.options)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Create a worker for `queue_name`. It does not claim anything until
    /// [`run`](Self::run) is called.
    pub fn new(
        queue_name: impl Into<String>,
        processor: Arc<dyn Processor>,
        options: WorkerOptions,
        backend: SharedBackend,
    ) -> Self {
        let name = queue_name.into();
        let qualified_name = backend.qualified_name(&name);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                queue: name.clone(),
                processor,
                options: WorkerOptions {
                    concurrency: options.concurrency.max(1),
                    ..options
                },
                backend,
                events,
            }),
            name,
            qualified_name,
            cancel: CancellationToken::new(),
            crashed: CancellationToken::new(),
            crash_reason: Arc::new(OnceLock::new()),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.shared.options
    }

    /// Receive this worker's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    /// Start claiming jobs. Calling it again while running does nothing.
    pub fn run(&mut self) {
        if self.handle.is_some() {
            debug!(queue = %self.name, "Worker already started");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let crashed = self.crashed.clone();
        let crash_reason = Arc::clone(&self.crash_reason);

        info!(
            queue = %self.name,
            concurrency = shared.options.concurrency,
            "Worker started"
        );

        self.handle = Some(tokio::spawn(async move {
            let outcome = AssertUnwindSafe(claim_loop(Arc::clone(&shared), cancel.clone()))
                .catch_unwind()
                .await;

            let reason = match outcome {
                Err(panic) => format!("claim loop panicked: {}", panic_message(&*panic)),
                Ok(()) if !cancel.is_cancelled() => "claim loop stopped".to_string(),
                Ok(()) => return,
            };

            error!(queue = %shared.queue, reason = %reason, "Worker exited unexpectedly");
            let _ = shared.events.send(WorkerEvent::Error {
                message: reason.clone(),
            });
            let _ = crash_reason.set(reason);
            crashed.cancel();
        }));
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished()) && !self.cancel.is_cancelled()
    }

    /// Resolves with a reason if the worker stops without [`close`](Self::close)
    /// being called. Never resolves otherwise.
    pub fn unexpected_exit(&self) -> impl Future<Output = String> + Send + 'static {
        let crashed = self.crashed.clone();
        let reason = Arc::clone(&self.crash_reason);
        let queue = self.name.clone();
        async move {
            crashed.cancelled().await;
            let reason = reason
                .get()
                .cloned()
                .unwrap_or_else(|| "worker stopped".to_string());
            format!("worker for queue '{queue}': {reason}")
        }
    }

    /// Stop claiming and wait for in-flight jobs to finish.
    pub async fn close(&mut self) -> QueueResult<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| QueueError::Worker(format!("claim loop for '{}': {e}", self.name)))?;
            info!(queue = %self.name, "Worker closed");
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Claim loop
// ---------------------------------------------------------------------------

async fn claim_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut in_flight = JoinSet::new();
    let concurrency = shared.options.concurrency;

    loop {
        while let Some(joined) = in_flight.try_join_next() {
            log_join(&shared.queue, joined);
        }

        if cancel.is_cancelled() {
            break;
        }

        if in_flight.len() >= concurrency {
            tokio::select! {
                Some(joined) = in_flight.join_next() => log_join(&shared.queue, joined),
                _ = cancel.cancelled() => {}
            }
            continue;
        }

        // The claim itself is never raced with cancellation: a job moved to
        // active must be handed to a task.
        match shared
            .backend
            .claim_next(&shared.queue, lock_ms(shared.options.lock_duration))
            .await
        {
            Ok(Some(job)) => {
                debug!(queue = %shared.queue, job_id = %job.id, "Claimed job");
                in_flight.spawn(process_job(Arc::clone(&shared), job));
            }
            Ok(None) => idle(shared.options.poll_interval, &cancel).await,
            Err(e) => {
                warn!(queue = %shared.queue, error = %e, "Failed to claim job");
                let _ = shared.events.send(WorkerEvent::Error {
                    message: e.to_string(),
                });
                idle(shared.options.poll_interval, &cancel).await;
            }
        }
    }

    if !in_flight.is_empty() {
        info!(
            queue = %shared.queue,
            in_flight = in_flight.len(),
            "Waiting for in-flight jobs"
        );
    }
    while let Some(joined) = in_flight.join_next().await {
        log_join(&shared.queue, joined);
    }
}

fn lock_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn idle(interval: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = cancel.cancelled() => {}
    }
}

fn log_join(queue: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(queue, error = %e, "Job task aborted");
    }
}

async fn process_job(shared: Arc<Shared>, job: Job) {
    let ctx = JobContext {
        job,
        queue: shared.queue.clone(),
        backend: Arc::clone(&shared.backend),
        events: shared.events.clone(),
    };

    let lock_duration = shared.options.lock_duration;
    let outcome = {
        let processing = AssertUnwindSafe(shared.processor.process(&ctx)).catch_unwind();
        tokio::pin!(processing);

        let mut renew = tokio::time::interval((lock_duration / 2).max(Duration::from_millis(1)));
        renew.tick().await;

        loop {
            tokio::select! {
                outcome = &mut processing => break outcome,
                _ = renew.tick() => renew_lock(&shared, &ctx.job.id, lock_duration).await,
            }
        }
    };

    let result = match outcome {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "processor panicked: {}",
            panic_message(&*panic)
        )),
    };

    let job = ctx.job;
    match result {
        Ok(return_value) => {
            match shared
                .backend
                .move_to_completed(
                    &shared.queue,
                    &job.id,
                    return_value.clone(),
                    shared.options.remove_on_complete,
                )
                .await
            {
                Ok(_) => {
                    let _ = shared.events.send(WorkerEvent::Completed {
                        job_id: job.id,
                        return_value,
                    });
                }
                Err(e) => report_bookkeeping_error(&shared, &job.id, "complete", e),
            }
        }
        Err(err) => {
            let failure = JobFailure {
                reason: err.to_string(),
                stack_trace: format!("{err:?}"),
            };
            let attempts_made = job.attempts_made + 1;
            let attempts = job.opts.max_attempts();
            let will_retry = attempts_made < attempts;

            let stored = if will_retry {
                let delay = job.opts.retry_delay(attempts_made);
                debug!(queue = %shared.queue, job_id = %job.id, delay_ms = delay, "Scheduling retry");
                shared
                    .backend
                    .retry_later(&shared.queue, &job.id, &failure, delay)
                    .await
            } else {
                shared
                    .backend
                    .move_to_failed(
                        &shared.queue,
                        &job.id,
                        &failure,
                        shared.options.remove_on_fail,
                    )
                    .await
            };

            match stored {
                Ok(_) => {
                    let _ = shared.events.send(WorkerEvent::Failed {
                        job_id: job.id,
                        attempts_made,
                        attempts,
                        error: failure.reason,
                        will_retry,
                    });
                }
                Err(e) => report_bookkeeping_error(&shared, &job.id, "record failure of", e),
            }
        }
    }
}

async fn renew_lock(shared: &Shared, job_id: &str, lock_duration: Duration) {
    match shared
        .backend
        .extend_lock(&shared.queue, job_id, lock_ms(lock_duration))
        .await
    {
        Ok(true) => {}
        Ok(false) => warn!(queue = %shared.queue, job_id, "Job lock was lost while processing"),
        Err(e) => warn!(queue = %shared.queue, job_id, error = %e, "Failed to renew job lock"),
    }
}

fn report_bookkeeping_error(shared: &Shared, job_id: &str, action: &str, err: QueueError) {
    error!(queue = %shared.queue, job_id, error = %err, "Failed to {action} job");
    let _ = shared.events.send(WorkerEvent::Error {
        message: format!("failed to {action} job {job_id}: {err}"),
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
