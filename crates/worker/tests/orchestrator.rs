//! Orchestrator launch, fatal detection and shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use jobhost_queue::job::{Job, JobCounts, JobFailure, JobOptions, JobProgress, JobState, KeepJobs};
use jobhost_queue::{
    InMemoryQueueBackend, JobContext, Processor, Queue, QueueBackend, QueueResult,
    SharedBackend, Worker, WorkerOptions,
};
use jobhost_worker::module::start_with_logging;
use jobhost_worker::{
    ModuleRef, Orchestrator, OrchestratorError, OrchestratorState, RegistryError, WorkerModule,
    WorkerRegistry,
};
use serde_json::{json, Value};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Echo;

#[async_trait]
impl Processor for Echo {
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<Value> {
        Ok(ctx.data().clone())
    }
}

/// Module that records when its worker was created.
struct Recording {
    name: String,
    launches: Arc<Mutex<Vec<Instant>>>,
}

impl WorkerModule for Recording {
    fn queue_name(&self) -> &str {
        &self.name
    }

    fn create_queue(&self, backend: &SharedBackend) -> Queue {
        Queue::new(self.name.clone(), Arc::clone(backend))
    }

    fn create_worker(&self, backend: &SharedBackend) -> Worker {
        self.launches.lock().unwrap().push(Instant::now());
        let options = WorkerOptions {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        start_with_logging(Worker::new(
            self.name.clone(),
            Arc::new(Echo),
            options,
            Arc::clone(backend),
        ))
    }
}

fn recording_registry(
    names: &[&str],
    backend: SharedBackend,
) -> (WorkerRegistry, Arc<Mutex<Vec<Instant>>>) {
    let launches = Arc::new(Mutex::new(Vec::new()));
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let shared = Arc::clone(&launches);

    let registry = WorkerRegistry::new(
        move || {
            names
                .iter()
                .map(|name| {
                    Arc::new(Recording {
                        name: name.clone(),
                        launches: Arc::clone(&shared),
                    }) as ModuleRef
                })
                .collect()
        },
        backend,
    );
    (registry, launches)
}

fn memory_backend() -> SharedBackend {
    Arc::new(InMemoryQueueBackend::default())
}

// ---------------------------------------------------------------------------
// Launch
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn launch_creates_one_queue_and_worker_per_module_at_intervals() {
    let (registry, launches) = recording_registry(&["a", "b", "c"], memory_backend());
    let mut orchestrator = Orchestrator::new(registry);
    assert_eq!(orchestrator.state(), OrchestratorState::NotStarted);

    let launched = orchestrator.launch_all().await.unwrap();

    assert_eq!(launched, 3);
    assert_eq!(orchestrator.state(), OrchestratorState::Running);
    assert_eq!(orchestrator.queues().len(), 3);
    assert_eq!(orchestrator.workers().len(), 3);
    assert!(orchestrator.workers().iter().all(Worker::is_running));

    let launches = launches.lock().unwrap().clone();
    assert_eq!(launches.len(), 3);
    for pair in launches.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(1));
    }

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn launched_workers_process_submitted_jobs() {
    let (registry, _) = recording_registry(&["echo"], memory_backend());
    let mut orchestrator = Orchestrator::new(registry).with_launch_interval(Duration::ZERO);
    orchestrator.launch_all().await.unwrap();

    let queue = orchestrator.queues()[0].clone();
    let job = queue.add("jobtest", json!({"foo": "bar"}), None).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.get_job_counts().await.unwrap().completed == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job was never completed");

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.return_value, Some(json!({"foo": "bar"})));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn second_launch_is_rejected() {
    let (registry, _) = recording_registry(&["once"], memory_backend());
    let mut orchestrator = Orchestrator::new(registry).with_launch_interval(Duration::ZERO);
    orchestrator.launch_all().await.unwrap();

    assert_matches!(
        orchestrator.launch_all().await,
        Err(OrchestratorError::InvalidState(OrchestratorState::Running))
    );
    assert_eq!(orchestrator.workers().len(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn duplicate_module_names_abort_launch() {
    let (registry, launches) = recording_registry(&["dup", "dup"], memory_backend());
    let mut orchestrator = Orchestrator::new(registry);

    assert_matches!(
        orchestrator.launch_all().await,
        Err(OrchestratorError::Registry(RegistryError::DuplicateQueue(_)))
    );
    assert!(launches.lock().unwrap().is_empty());
    assert!(orchestrator.workers().is_empty());
}

// ---------------------------------------------------------------------------
// Shutdown and fatal errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_closes_every_worker() {
    let (registry, _) = recording_registry(&["x", "y"], memory_backend());
    let mut orchestrator = Orchestrator::new(registry).with_launch_interval(Duration::ZERO);
    orchestrator.launch_all().await.unwrap();

    orchestrator.shutdown().await;

    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    assert!(orchestrator.workers().is_empty());
    assert!(orchestrator.queues().is_empty());
}

#[tokio::test]
async fn wait_for_fatal_stays_pending_without_workers() {
    let (registry, _) = recording_registry(&[], memory_backend());
    let mut orchestrator = Orchestrator::new(registry);
    assert_eq!(orchestrator.launch_all().await.unwrap(), 0);

    let fatal = tokio::time::timeout(Duration::from_millis(50), orchestrator.wait_for_fatal()).await;
    assert!(fatal.is_err());
}

/// Backend whose claim panics, killing the worker's claim loop.
struct BrokenClaims {
    inner: InMemoryQueueBackend,
}

#[async_trait]
impl QueueBackend for BrokenClaims {
    fn prefix(&self) -> &str {
        self.inner.prefix()
    }

    async fn ping(&self) -> QueueResult<()> {
        self.inner.ping().await
    }

    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        opts: JobOptions,
    ) -> QueueResult<Job> {
        self.inner.add_job(queue, name, data, opts).await
    }

    async fn get_job(&self, queue: &str, id: &str) -> QueueResult<Option<Job>> {
        self.inner.get_job(queue, id).await
    }

    async fn get_jobs(&self, queue: &str, states: &[JobState]) -> QueueResult<Vec<Job>> {
        self.inner.get_jobs(queue, states).await
    }

    async fn get_job_counts(&self, queue: &str) -> QueueResult<JobCounts> {
        self.inner.get_job_counts(queue).await
    }

    async fn claim_next(&self, _queue: &str, _lock_ms: u64) -> QueueResult<Option<Job>> {
        panic!("claim bookkeeping corrupted");
    }

    async fn extend_lock(&self, queue: &str, id: &str, lock_ms: u64) -> QueueResult<bool> {
        self.inner.extend_lock(queue, id, lock_ms).await
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &JobProgress,
    ) -> QueueResult<()> {
        self.inner.update_progress(queue, id, progress).await
    }

    async fn add_log(&self, queue: &str, id: &str, line: &str) -> QueueResult<u64> {
        self.inner.add_log(queue, id, line).await
    }

    async fn get_logs(&self, queue: &str, id: &str) -> QueueResult<Vec<String>> {
        self.inner.get_logs(queue, id).await
    }

    async fn move_to_completed(
        &self,
        queue: &str,
        id: &str,
        return_value: Value,
        keep: KeepJobs,
    ) -> QueueResult<Job> {
        self.inner.move_to_completed(queue, id, return_value, keep).await
    }

    async fn move_to_failed(
        &self,
        queue: &str,
        id: &str,
        failure: &JobFailure,
        keep: KeepJobs,
    ) -> QueueResult<Job> {
        self.inner.move_to_failed(queue, id, failure, keep).await
    }

    async fn retry_later(
        &self,
        queue: &str,
        id: &str,
        failure: &JobFailure,
        delay_ms: u64,
    ) -> QueueResult<Job> {
        self.inner.retry_later(queue, id, failure, delay_ms).await
    }
}

#[tokio::test]
async fn dead_worker_is_reported_as_fatal() {
    let backend: SharedBackend = Arc::new(BrokenClaims {
        inner: InMemoryQueueBackend::default(),
    });
    let (registry, _) = recording_registry(&["fragile"], backend);
    let mut orchestrator = Orchestrator::new(registry).with_launch_interval(Duration::ZERO);
    orchestrator.launch_all().await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(5), orchestrator.wait_for_fatal())
        .await
        .expect("fatal exit was never reported");
    assert!(reason.contains("fragile"), "unexpected reason: {reason}");
    assert!(reason.contains("claim bookkeeping corrupted"), "unexpected reason: {reason}");

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
}
