//! End-to-end worker behaviour against the in-memory backend.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use jobhost_queue::{
    InMemoryQueueBackend, JobContext, JobOptions, JobOptionsOverride, JobProgress, JobState,
    KeepJobs, Processor, Queue, QueueBackend, SharedBackend, Worker, WorkerEvent, WorkerOptions,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn backend() -> SharedBackend {
    Arc::new(InMemoryQueueBackend::default())
}

fn fast_options() -> WorkerOptions {
    WorkerOptions {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Wait (bounded) for the first event matching `pred`.
async fn wait_for(
    rx: &mut broadcast::Receiver<WorkerEvent>,
    pred: impl Fn(&WorkerEvent) -> bool,
) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for worker event")
}

fn is_completed(event: &WorkerEvent) -> bool {
    matches!(event, WorkerEvent::Completed { .. })
}

fn is_final_failure(event: &WorkerEvent) -> bool {
    matches!(event, WorkerEvent::Failed { will_retry: false, .. })
}

struct Echo;

#[async_trait]
impl Processor for Echo {
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<Value> {
        Ok(json!({ "echo": ctx.data().clone() }))
    }
}

/// Fails until it has been called `failures` times.
struct Flaky {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl Processor for Flaky {
    async fn process(&self, _ctx: &JobContext) -> anyhow::Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            anyhow::bail!("attempt {call} failed");
        }
        Ok(json!("recovered"))
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_job_is_completed_with_return_value() {
    let backend = backend();
    let queue = Queue::new("echo", backend.clone());
    let mut worker = Worker::new("echo", Arc::new(Echo), fast_options(), backend);
    let mut events = worker.subscribe();
    worker.run();

    let job = queue.add("jobtest", json!({"foo": "bar"}), None).await.unwrap();

    let event = wait_for(&mut events, is_completed).await;
    assert_eq!(
        event,
        WorkerEvent::Completed {
            job_id: job.id.clone(),
            return_value: json!({"echo": {"foo": "bar"}}),
        }
    );

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.return_value, Some(json!({"echo": {"foo": "bar"}})));
    assert_eq!(stored.attempts_started, 1);
    assert_eq!(stored.attempts_made, 0);
    assert!(stored.finished_on.is_some());
    assert_eq!(queue.get_job_counts().await.unwrap().completed, 1);

    worker.close().await.unwrap();
}

#[tokio::test]
async fn failed_attempt_is_retried_until_success() {
    let backend = backend();
    let queue = Queue::new("flaky", backend.clone());
    let processor = Arc::new(Flaky {
        failures: 1,
        calls: AtomicU32::new(0),
    });
    let mut worker = Worker::new("flaky", processor.clone(), fast_options(), backend);
    let mut events = worker.subscribe();
    worker.run();

    let overrides = JobOptionsOverride {
        attempts: Some(3),
        ..Default::default()
    };
    let job = queue.add("flaky", json!({}), Some(overrides)).await.unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, WorkerEvent::Failed { .. })).await;
    assert_matches!(
        failed,
        WorkerEvent::Failed { attempts_made: 1, attempts: 3, will_retry: true, ref error, .. }
            if error == "attempt 1 failed"
    );
    wait_for(&mut events, is_completed).await;

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts_made, 1);
    assert_eq!(stored.attempts_started, 2);
    assert_eq!(stored.stack_trace.len(), 1);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);

    worker.close().await.unwrap();
}

#[tokio::test]
async fn exhausted_job_moves_to_failed() {
    let backend = backend();
    let queue = Queue::new("doomed", backend.clone());
    let processor = Arc::new(Flaky {
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let mut worker = Worker::new("doomed", processor, fast_options(), backend);
    let mut events = worker.subscribe();
    worker.run();

    let overrides = JobOptionsOverride {
        attempts: Some(2),
        ..Default::default()
    };
    let job = queue.add("doomed", json!({}), Some(overrides)).await.unwrap();

    let event = wait_for(&mut events, is_final_failure).await;
    assert_matches!(event, WorkerEvent::Failed { attempts_made: 2, attempts: 2, .. });

    let failed = queue.get_jobs_in(&[JobState::Failed]).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, job.id);
    assert_eq!(failed[0].failed_reason.as_deref(), Some("attempt 2 failed"));
    assert_eq!(failed[0].stack_trace.len(), 2);

    worker.close().await.unwrap();
}

#[tokio::test]
async fn panicking_processor_fails_the_job() {
    struct Panics;

    #[async_trait]
    impl Processor for Panics {
        async fn process(&self, _ctx: &JobContext) -> anyhow::Result<Value> {
            panic!("processor blew up");
        }
    }

    let backend = backend();
    let queue = Queue::new("panics", backend.clone());
    let mut worker = Worker::new("panics", Arc::new(Panics), fast_options(), backend);
    let mut events = worker.subscribe();
    worker.run();

    queue.add("boom", json!({}), None).await.unwrap();

    let event = wait_for(&mut events, is_final_failure).await;
    assert_matches!(event, WorkerEvent::Failed { ref error, .. } if error.contains("processor blew up"));
    assert!(worker.is_running(), "a job panic must not stop the worker");

    worker.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completed_jobs_are_trimmed_to_retention() {
    let backend = backend();
    let queue = Queue::new("trim", backend.clone());
    let options = WorkerOptions {
        remove_on_complete: KeepJobs::Last(2),
        ..fast_options()
    };
    let mut worker = Worker::new("trim", Arc::new(Echo), options, backend);
    let mut events = worker.subscribe();
    worker.run();

    for i in 0..5 {
        queue.add("jobtest", json!(i), None).await.unwrap();
    }
    for _ in 0..5 {
        wait_for(&mut events, is_completed).await;
    }

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.completed, 2);
    assert!(queue.get_job("1").await.unwrap().is_none());
    assert!(queue.get_job("5").await.unwrap().is_some());

    worker.close().await.unwrap();
}

#[tokio::test]
async fn concurrency_bounds_parallel_jobs() {
    struct Tracking {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Processor for Tracking {
        async fn process(&self, _ctx: &JobContext) -> anyhow::Result<Value> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    let backend = backend();
    let queue = Queue::new("parallel", backend.clone());
    let processor = Arc::new(Tracking {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let options = WorkerOptions {
        concurrency: 2,
        ..fast_options()
    };
    let mut worker = Worker::new("parallel", processor.clone(), options, backend);
    let mut events = worker.subscribe();

    for _ in 0..6 {
        queue.add("sleep", json!({}), None).await.unwrap();
    }
    worker.run();
    for _ in 0..6 {
        wait_for(&mut events, is_completed).await;
    }

    assert_eq!(processor.peak.load(Ordering::SeqCst), 2);
    worker.close().await.unwrap();
}

#[tokio::test]
async fn delayed_job_waits_before_processing() {
    let backend = backend();
    let queue = Queue::new("later", backend.clone());
    let mut worker = Worker::new("later", Arc::new(Echo), fast_options(), backend);
    let mut events = worker.subscribe();
    worker.run();

    let overrides = JobOptionsOverride {
        delay: Some(100),
        ..Default::default()
    };
    let job = queue.add("later", json!({}), Some(overrides)).await.unwrap();
    assert_eq!(queue.get_job_counts().await.unwrap().delayed, 1);

    wait_for(&mut events, is_completed).await;
    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    let processed_on = stored.processed_on.unwrap();
    assert!(processed_on >= job.timestamp + 100);

    worker.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Progress and logs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_and_logs_are_persisted_and_published() {
    struct Reporting;

    #[async_trait]
    impl Processor for Reporting {
        async fn process(&self, ctx: &JobContext) -> anyhow::Result<Value> {
            ctx.log("starting").await?;
            ctx.update_progress(50u8).await?;
            Ok(Value::Null)
        }
    }

    let backend = backend();
    let queue = Queue::new("reporting", backend.clone());
    let mut worker = Worker::new("reporting", Arc::new(Reporting), fast_options(), backend);
    let mut events = worker.subscribe();
    worker.run();

    let job = queue.add("report", json!({}), None).await.unwrap();

    let progress = wait_for(&mut events, |e| matches!(e, WorkerEvent::Progress { .. })).await;
    assert_eq!(
        progress,
        WorkerEvent::Progress {
            job_id: job.id.clone(),
            progress: JobProgress::Percent(50.0),
        }
    );
    wait_for(&mut events, is_completed).await;

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.progress, JobProgress::Percent(50.0));
    assert_eq!(queue.get_job_logs(&job.id).await.unwrap(), vec!["starting"]);

    worker.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn job_of_a_dead_worker_is_picked_up_again() {
    let backend = backend();
    let queue = Queue::new("orphans", backend.clone());
    let job = queue.add("orphan", json!({"n": 1}), None).await.unwrap();

    // A worker that claimed the job and died before ever renewing its lock.
    backend.claim_next("orphans", 0).await.unwrap().unwrap();
    assert_eq!(queue.get_job_counts().await.unwrap().active, 1);

    let mut worker = Worker::new("orphans", Arc::new(Echo), fast_options(), backend);
    let mut events = worker.subscribe();
    worker.run();

    let event = wait_for(&mut events, is_completed).await;
    assert_matches!(event, WorkerEvent::Completed { ref job_id, .. } if *job_id == job.id);

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts_started, 2);
    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.active, 0);
    assert_eq!(counts.completed, 1);

    worker.close().await.unwrap();
}

#[tokio::test]
async fn running_job_keeps_its_lock_past_the_lock_duration() {
    struct Slow;

    #[async_trait]
    impl Processor for Slow {
        async fn process(&self, _ctx: &JobContext) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_millis(600)).await;
            Ok(json!("done"))
        }
    }

    let backend = backend();
    let queue = Queue::new("renewed", backend.clone());
    let options = WorkerOptions {
        lock_duration: Duration::from_millis(200),
        ..fast_options()
    };
    let mut worker = Worker::new("renewed", Arc::new(Slow), options, backend.clone());
    let mut events = worker.subscribe();
    worker.run();

    let job = queue.add("slow", json!({}), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Past the original lock expiry: a competing claim must not steal it.
    assert_matches!(backend.claim_next("renewed", 200).await, Ok(None));

    wait_for(&mut events, is_completed).await;
    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts_started, 1);

    worker.close().await.unwrap();
}

#[tokio::test]
async fn close_waits_for_in_flight_job() {
    struct Slow;

    #[async_trait]
    impl Processor for Slow {
        async fn process(&self, _ctx: &JobContext) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!("done"))
        }
    }

    let backend = backend();
    let queue = Queue::new("slow", backend.clone());
    let mut worker = Worker::new("slow", Arc::new(Slow), fast_options(), backend);
    worker.run();

    let job = queue.add("slow", json!({}), None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.get_job_counts().await.unwrap().active == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job was never claimed");

    worker.close().await.unwrap();
    assert!(!worker.is_running());

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.return_value, Some(json!("done")));
    assert_eq!(queue.get_job_counts().await.unwrap().active, 0);
}

#[tokio::test]
async fn closed_worker_claims_nothing_and_reports_no_crash() {
    let backend = backend();
    let queue = Queue::new("closed", backend.clone());
    let mut worker = Worker::new("closed", Arc::new(Echo), fast_options(), backend);
    worker.run();
    worker.run();
    worker.close().await.unwrap();

    queue
        .add("ignored", json!({}), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(queue.get_job_counts().await.unwrap().waiting, 1);
    let crash = tokio::time::timeout(Duration::from_millis(50), worker.unexpected_exit()).await;
    assert!(crash.is_err(), "closing must not count as an unexpected exit");
}

#[tokio::test]
async fn default_job_options_apply_backoff_to_retries() {
    let backend = backend();
    let queue = Queue::new("backoff", backend.clone()).with_default_job_options(JobOptions {
        attempts: 2,
        delay: 0,
        backoff: Some(jobhost_queue::Backoff::fixed(60_000)),
    });
    let processor = Arc::new(Flaky {
        failures: 1,
        calls: AtomicU32::new(0),
    });
    let mut worker = Worker::new("backoff", processor, fast_options(), backend);
    let mut events = worker.subscribe();
    worker.run();

    queue.add("flaky", json!({}), None).await.unwrap();
    wait_for(&mut events, |e| matches!(e, WorkerEvent::Failed { .. })).await;

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.active, 0);

    worker.close().await.unwrap();
}
