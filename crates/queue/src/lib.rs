//! Broker client for the job host.
//!
//! Provides named [`Queue`] handles for producers and [`Worker`] handles for
//! consumers, both talking to one process-wide [`QueueBackend`] (Redis in
//! production, in-memory for tests and local runs).

pub mod backend;
pub mod connection;
pub mod error;
pub mod job;
pub mod queue;
pub mod worker;

pub use backend::{connect, InMemoryQueueBackend, QueueBackend, RedisQueueBackend, SharedBackend};
pub use connection::{BrokerConfig, RedisConfig, StorageType};
pub use error::{QueueError, QueueResult};
pub use job::{
    Backoff, BackoffKind, Job, JobCounts, JobOptions, JobOptionsOverride, JobProgress, JobState,
    KeepJobs,
};
pub use queue::Queue;
pub use worker::{JobContext, Processor, Worker, WorkerEvent, WorkerOptions};
