//! Launches one worker per registered module and drains them on shutdown.

use std::time::Duration;

use futures::future::{select_all, BoxFuture, FutureExt};
use jobhost_queue::{Queue, Worker};
use tracing::{error, info};

use crate::registry::{RegistryError, WorkerRegistry};

/// Default pause between two worker launches.
pub const DEFAULT_LAUNCH_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    NotStarted,
    Launching,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Cannot launch workers from state {0:?}")]
    InvalidState(OrchestratorState),
}

/// Why the process is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// A worker died unexpectedly.
    Fatal(String),
}

impl ShutdownTrigger {
    /// Process exit status for this trigger: `128 + signo` for signals.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownTrigger::Interrupt => 128 + 2,
            ShutdownTrigger::Terminate => 128 + 15,
            ShutdownTrigger::Fatal(_) => 1,
        }
    }
}

/// Owns every queue and worker handle it launched.
#[derive(Debug)]
pub struct Orchestrator {
    registry: WorkerRegistry,
    launch_interval: Duration,
    state: OrchestratorState,
    queues: Vec<Queue>,
    workers: Vec<Worker>,
}

impl Orchestrator {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self {
            registry,
            launch_interval: DEFAULT_LAUNCH_INTERVAL,
            state: OrchestratorState::NotStarted,
            queues: Vec::new(),
            workers: Vec::new(),
        }
    }

    pub fn with_launch_interval(mut self, interval: Duration) -> Self {
        self.launch_interval = interval;
        self
    }

    /// Launch interval from `WORKER_LAUNCH_INTERVAL_MS` (default 1000).
    ///
    /// # Panics
    ///
    /// Panics if the variable is set but not a valid number.
    pub fn launch_interval_from_env() -> Duration {
        let ms: u64 = std::env::var("WORKER_LAUNCH_INTERVAL_MS")
            .unwrap_or_else(|_| DEFAULT_LAUNCH_INTERVAL.as_millis().to_string())
            .parse()
            .expect("WORKER_LAUNCH_INTERVAL_MS must be a valid u64");
        Duration::from_millis(ms)
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Create a queue and a running worker for every module, pausing the
    /// launch interval between two modules. Returns the number launched.
    pub async fn launch_all(&mut self) -> Result<usize, OrchestratorError> {
        if self.state != OrchestratorState::NotStarted {
            return Err(OrchestratorError::InvalidState(self.state));
        }

        let modules = self.registry.list_modules()?;
        self.state = OrchestratorState::Launching;

        for (index, module) in modules.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.launch_interval).await;
            }

            info!(queue = module.queue_name(), "Launching worker");
            let backend = self.registry.backend();
            self.queues.push(module.create_queue(backend));
            self.workers.push(module.create_worker(backend));
        }

        self.state = OrchestratorState::Running;
        info!(workers = self.workers.len(), "All workers launched");
        Ok(self.workers.len())
    }

    /// Resolves with a reason as soon as any launched worker dies without
    /// being closed. Stays pending if there are no workers.
    pub fn wait_for_fatal(&self) -> BoxFuture<'static, String> {
        if self.workers.is_empty() {
            return futures::future::pending().boxed();
        }

        let exits: Vec<_> = self
            .workers
            .iter()
            .map(|worker| worker.unexpected_exit().boxed())
            .collect();
        select_all(exits).map(|(reason, _, _)| reason).boxed()
    }

    /// Close every worker one after the other. A failing close is logged
    /// and does not stop the others from being closed.
    pub async fn shutdown(&mut self) {
        self.state = OrchestratorState::ShuttingDown;

        for worker in &mut self.workers {
            info!(worker = worker.qualified_name(), "Shutting down worker");
            if let Err(e) = worker.close().await {
                error!(worker = worker.qualified_name(), error = %e, "Failed to close worker");
            }
        }

        self.workers.clear();
        self.queues.clear();
        self.state = OrchestratorState::Stopped;
        info!("All workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_map_to_conventional_exit_codes() {
        assert_eq!(ShutdownTrigger::Interrupt.exit_code(), 130);
        assert_eq!(ShutdownTrigger::Terminate.exit_code(), 143);
        assert_eq!(ShutdownTrigger::Fatal("boom".into()).exit_code(), 1);
    }
}
