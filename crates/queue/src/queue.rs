//! Producer-side handle for one named queue.

use std::fmt;

use serde_json::Value;

use crate::backend::SharedBackend;
use crate::error::QueueResult;
use crate::job::{Job, JobCounts, JobOptions, JobOptionsOverride, JobState};

/// Handle used to submit and inspect jobs of one queue.
///
/// Cheap to clone; every clone shares the process-wide backend.
#[derive(Clone)]
pub struct Queue {
    name: String,
    qualified_name: String,
    default_job_options: JobOptions,
    backend: SharedBackend,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("qualified_name", &self.qualified_name)
            .field("default_job_options", &self.default_job_options)
            .finish_non_exhaustive()
    }
}

impl Queue {
    pub fn new(name: impl Into<String>, backend: SharedBackend) -> Self {
        let name = name.into();
        let qualified_name = backend.qualified_name(&name);
        Self {
            name,
            qualified_name,
            default_job_options: JobOptions::default(),
            backend,
        }
    }

    /// Options applied to every job added through this handle unless the
    /// submitter overrides them.
    pub fn with_default_job_options(mut self, options: JobOptions) -> Self {
        self.default_job_options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<prefix>:<name>`.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn default_job_options(&self) -> &JobOptions {
        &self.default_job_options
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Submit a job. `overrides` takes precedence over the queue defaults.
    pub async fn add(
        &self,
        job_name: &str,
        data: Value,
        overrides: Option<JobOptionsOverride>,
    ) -> QueueResult<Job> {
        let opts = match overrides {
            Some(overrides) => self.default_job_options.merged_with(&overrides),
            None => self.default_job_options.clone(),
        };
        let job = self.backend.add_job(&self.name, job_name, data, opts).await?;
        tracing::debug!(queue = %self.name, job_id = %job.id, job_name, "Job submitted");
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> QueueResult<Option<Job>> {
        self.backend.get_job(&self.name, id).await
    }

    /// Every job of the queue, whatever its state.
    pub async fn get_jobs(&self) -> QueueResult<Vec<Job>> {
        self.backend.get_jobs(&self.name, &JobState::ALL).await
    }

    pub async fn get_jobs_in(&self, states: &[JobState]) -> QueueResult<Vec<Job>> {
        self.backend.get_jobs(&self.name, states).await
    }

    pub async fn get_job_counts(&self) -> QueueResult<JobCounts> {
        self.backend.get_job_counts(&self.name).await
    }

    pub async fn get_job_logs(&self, id: &str) -> QueueResult<Vec<String>> {
        self.backend.get_logs(&self.name, id).await
    }
}
