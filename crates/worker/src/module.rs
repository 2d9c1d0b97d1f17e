//! The contract every worker module implements.

use std::sync::Arc;

use jobhost_queue::{JobProgress, Queue, SharedBackend, Worker, WorkerEvent};
use tokio::sync::broadcast::error::RecvError;

/// A self-contained job type: one queue, one processor, and the options the
/// worker runs with.
pub trait WorkerModule: Send + Sync {
    /// Unique across the manifest; also the broker queue name.
    fn queue_name(&self) -> &str;

    /// Handle to this module's queue. Safe to call repeatedly: every call
    /// refers to the same broker queue.
    fn create_queue(&self, backend: &SharedBackend) -> Queue;

    /// Build the worker, attach its event handlers, then start it.
    fn create_worker(&self, backend: &SharedBackend) -> Worker;
}

pub type ModuleRef = Arc<dyn WorkerModule>;

/// Subscribe the standard tracing handlers to `worker`, then run it.
///
/// Subscribing first means no event of the first claimed job is missed.
pub fn start_with_logging(mut worker: Worker) -> Worker {
    let mut events = worker.subscribe();
    let queue = worker.name().to_string();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&queue, &event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(queue = %queue, skipped, "Worker event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    worker.run();
    worker
}

fn log_event(queue: &str, event: &WorkerEvent) {
    match event {
        WorkerEvent::Progress { job_id, progress } => match progress {
            JobProgress::Percent(percent) => {
                tracing::info!(queue, job_id = %job_id, "Job {job_id} is {percent}% ready");
            }
            JobProgress::Status(status) => {
                tracing::info!(
                    queue,
                    job_id = %job_id,
                    "Job {job_id} update: {}",
                    serde_json::Value::Object(status.clone())
                );
            }
        },
        WorkerEvent::Completed { job_id, .. } => {
            tracing::debug!(queue, job_id = %job_id, "Job completed");
        }
        WorkerEvent::Failed {
            job_id,
            attempts_made,
            attempts,
            error,
            will_retry,
        } => {
            tracing::error!(
                queue,
                job_id = %job_id,
                will_retry,
                error = %error,
                "Failed job #{job_id}! Tried {attempts_made}/{attempts} times"
            );
        }
        WorkerEvent::Error { message } => {
            tracing::error!(queue, error = %message, "Worker error");
        }
    }
}
