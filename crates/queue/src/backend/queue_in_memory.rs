//! In-memory implementation of [`QueueBackend`].
//!
//! All queues live behind a single mutex, which makes every operation
//! (claim included) atomic with respect to the others. Jobs are lost when the
//! process exits.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use jobhost_core::types::{now_ms, TimestampMs};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use super::{due_at, QueueBackend};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobCounts, JobFailure, JobOptions, JobProgress, JobState, KeepJobs};

#[derive(Debug, Default)]
struct QueueState {
    last_id: u64,
    jobs: HashMap<String, Job>,
    logs: HashMap<String, Vec<String>>,
    waiting: VecDeque<String>,
    active: Vec<String>,
    /// Lock expiry of every active id.
    locks: HashMap<String, TimestampMs>,
    /// `(due_at, id)` pairs, unordered.
    delayed: Vec<(TimestampMs, String)>,
    /// Oldest first.
    completed: VecDeque<String>,
    /// Oldest first.
    failed: VecDeque<String>,
}

impl QueueState {
    fn ids_in(&self, state: JobState) -> Vec<String> {
        match state {
            JobState::Waiting => self.waiting.iter().cloned().collect(),
            JobState::Active => self.active.clone(),
            JobState::Delayed => {
                let mut delayed = self.delayed.clone();
                delayed.sort();
                delayed.into_iter().map(|(_, id)| id).collect()
            }
            JobState::Completed => self.completed.iter().cloned().collect(),
            JobState::Failed => self.failed.iter().cloned().collect(),
            JobState::Paused | JobState::Prioritized | JobState::WaitingChildren => Vec::new(),
        }
    }

    /// Move every delayed job due at or before `now` to the waiting list,
    /// earliest first.
    fn promote_due(&mut self, now: TimestampMs) {
        let (mut due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = pending;
        due.sort();
        self.waiting.extend(due.into_iter().map(|(_, id)| id));
    }

    /// Put active jobs whose lock expired at or before `now` back at the
    /// front of the waiting list, oldest claim first.
    fn recover_stalled(&mut self, queue: &str, now: TimestampMs) {
        let locks = &self.locks;
        let (stalled, held): (Vec<_>, Vec<_>) = self
            .active
            .drain(..)
            .partition(|id| !matches!(locks.get(id), Some(until) if *until > now));
        self.active = held;

        for id in stalled.into_iter().rev() {
            warn!(queue, job_id = %id, "Recovered stalled job");
            self.locks.remove(&id);
            self.waiting.push_front(id);
        }
    }

    fn take_active(&mut self, id: &str) {
        self.active.retain(|active| active != id);
        self.locks.remove(id);
    }

    /// Drop the oldest entries of a finished collection beyond `keep`.
    fn trim(&mut self, state: JobState, keep: KeepJobs) {
        let list = match state {
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            _ => return,
        };
        let excess = keep.excess(list.len());
        let removed: Vec<String> = list.drain(..excess).collect();
        for id in removed {
            self.jobs.remove(&id);
            self.logs.remove(&id);
        }
    }

    fn job_mut(&mut self, queue: &str, id: &str) -> QueueResult<&mut Job> {
        self.jobs.get_mut(id).ok_or_else(|| QueueError::JobNotFound {
            queue: queue.to_string(),
            id: id.to_string(),
        })
    }

    fn record_failure(&mut self, queue: &str, id: &str, failure: &JobFailure) -> QueueResult<()> {
        self.take_active(id);
        let job = self.job_mut(queue, id)?;
        job.attempts_made += 1;
        job.failed_reason = Some(failure.reason.clone());
        job.stack_trace.push(failure.stack_trace.clone());
        Ok(())
    }
}

/// Process-local queue storage.
#[derive(Debug)]
pub struct InMemoryQueueBackend {
    prefix: String,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InMemoryQueueBackend {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            queues: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new(crate::connection::DEFAULT_QUEUE_PREFIX)
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        opts: JobOptions,
    ) -> QueueResult<Job> {
        let qualified = self.qualified_name(queue);
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        state.last_id += 1;
        let id = state.last_id.to_string();
        let now = now_ms();
        let job = Job::new(id.clone(), name, data, opts, now, qualified);

        if job.opts.delay > 0 {
            state.delayed.push((due_at(now, job.opts.delay), id.clone()));
        } else {
            state.waiting.push_back(id.clone());
        }
        state.jobs.insert(id, job.clone());

        Ok(job)
    }

    async fn get_job(&self, queue: &str, id: &str) -> QueueResult<Option<Job>> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).and_then(|s| s.jobs.get(id)).cloned())
    }

    async fn get_jobs(&self, queue: &str, states: &[JobState]) -> QueueResult<Vec<Job>> {
        let queues = self.queues.lock().await;
        let Some(state) = queues.get(queue) else {
            return Ok(Vec::new());
        };

        Ok(states
            .iter()
            .flat_map(|s| state.ids_in(*s))
            .filter_map(|id| state.jobs.get(&id).cloned())
            .collect())
    }

    async fn get_job_counts(&self, queue: &str) -> QueueResult<JobCounts> {
        let queues = self.queues.lock().await;
        let Some(state) = queues.get(queue) else {
            return Ok(JobCounts::default());
        };

        Ok(JobCounts {
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            delayed: state.delayed.len() as u64,
            failed: state.failed.len() as u64,
            paused: 0,
            prioritized: 0,
            waiting: state.waiting.len() as u64,
            waiting_children: 0,
        })
    }

    async fn claim_next(&self, queue: &str, lock_ms: u64) -> QueueResult<Option<Job>> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = now_ms();
        state.recover_stalled(queue, now);
        state.promote_due(now);

        while let Some(id) = state.waiting.pop_front() {
            // Ids whose job was trimmed away are skipped.
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.attempts_started += 1;
            job.processed_on = Some(now);
            let claimed = job.clone();
            state.locks.insert(id.clone(), due_at(now, lock_ms));
            state.active.push(id);
            return Ok(Some(claimed));
        }

        Ok(None)
    }

    async fn extend_lock(&self, queue: &str, id: &str, lock_ms: u64) -> QueueResult<bool> {
        let mut queues = self.queues.lock().await;
        let Some(lock) = queues.get_mut(queue).and_then(|s| s.locks.get_mut(id)) else {
            return Ok(false);
        };
        *lock = due_at(now_ms(), lock_ms);
        Ok(true)
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &JobProgress,
    ) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.job_mut(queue, id)?.progress = progress.clone();
        Ok(())
    }

    async fn add_log(&self, queue: &str, id: &str, line: &str) -> QueueResult<u64> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.job_mut(queue, id)?;

        let logs = state.logs.entry(id.to_string()).or_default();
        logs.push(line.to_string());
        Ok(logs.len() as u64)
    }

    async fn get_logs(&self, queue: &str, id: &str) -> QueueResult<Vec<String>> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .and_then(|s| s.logs.get(id))
            .cloned()
            .unwrap_or_default())
    }

    async fn move_to_completed(
        &self,
        queue: &str,
        id: &str,
        return_value: Value,
        keep: KeepJobs,
    ) -> QueueResult<Job> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        state.take_active(id);
        let job = state.job_mut(queue, id)?;
        job.finished_on = Some(now_ms());
        job.return_value = Some(return_value);
        let finished = job.clone();

        state.completed.push_back(id.to_string());
        state.trim(JobState::Completed, keep);
        Ok(finished)
    }

    async fn move_to_failed(
        &self,
        queue: &str,
        id: &str,
        failure: &JobFailure,
        keep: KeepJobs,
    ) -> QueueResult<Job> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        state.record_failure(queue, id, failure)?;
        let job = state.job_mut(queue, id)?;
        job.finished_on = Some(now_ms());
        let finished = job.clone();

        state.failed.push_back(id.to_string());
        state.trim(JobState::Failed, keep);
        Ok(finished)
    }

    async fn retry_later(
        &self,
        queue: &str,
        id: &str,
        failure: &JobFailure,
        delay_ms: u64,
    ) -> QueueResult<Job> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        state.record_failure(queue, id, failure)?;
        let retried = state.job_mut(queue, id)?.clone();

        if delay_ms > 0 {
            state.delayed.push((due_at(now_ms(), delay_ms), id.to_string()));
        } else {
            state.waiting.push_back(id.to_string());
        }
        Ok(retried)
    }
}
