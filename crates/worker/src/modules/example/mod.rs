//! Reference module: a queue named `example` whose jobs simulate two steps
//! of work.

pub mod config;
pub mod processor;

use std::sync::Arc;

use jobhost_queue::{Queue, SharedBackend, Worker};

use crate::module::{start_with_logging, WorkerModule};
use config::QUEUE_NAME;
pub use processor::ExampleProcessor;

#[derive(Debug, Default)]
pub struct ExampleModule;

impl WorkerModule for ExampleModule {
    fn queue_name(&self) -> &str {
        QUEUE_NAME
    }

    fn create_queue(&self, backend: &SharedBackend) -> Queue {
        Queue::new(QUEUE_NAME, Arc::clone(backend))
            .with_default_job_options(config::default_job_options())
    }

    fn create_worker(&self, backend: &SharedBackend) -> Worker {
        let worker = Worker::new(
            QUEUE_NAME,
            Arc::new(ExampleProcessor::default()),
            config::worker_options(),
            Arc::clone(backend),
        );
        start_with_logging(worker)
    }
}
