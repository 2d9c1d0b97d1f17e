//! Job data model shared by every broker backend.
//!
//! A [`Job`] is created by [`Queue::add`](crate::queue::Queue::add), claimed
//! by a [`Worker`](crate::worker::Worker), and finishes in either the
//! completed or the failed collection. Its status is not stored on the job
//! itself; it is implied by which broker collection holds the job id.

use jobhost_core::types::{JobId, TimestampMs};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A single unit of work stored in a named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Broker-assigned id, unique within its queue.
    pub id: JobId,
    /// Job-type tag chosen by the submitter.
    pub name: String,
    /// Opaque payload handed to the processor unchanged.
    pub data: Value,
    /// Options the job was created with, after queue defaults were applied.
    pub opts: JobOptions,
    pub progress: JobProgress,
    /// Initial delay in milliseconds (copied from `opts.delay`).
    pub delay: u64,
    /// Creation time.
    pub timestamp: TimestampMs,
    /// Number of attempts that ended in failure.
    pub attempts_made: u32,
    /// Number of times a worker claimed the job.
    pub attempts_started: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_on: Option<TimestampMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_on: Option<TimestampMs>,
    #[serde(rename = "returnvalue", default)]
    pub return_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    /// One entry per failed attempt, oldest first.
    #[serde(rename = "stacktrace", default)]
    pub stack_trace: Vec<String>,
    /// `<prefix>:<queue name>` of the queue holding the job.
    pub queue_qualified_name: String,
}

impl Job {
    /// Build a freshly submitted job that has not been claimed yet.
    pub fn new(
        id: JobId,
        name: impl Into<String>,
        data: Value,
        opts: JobOptions,
        timestamp: TimestampMs,
        queue_qualified_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            data,
            delay: opts.delay,
            opts,
            progress: JobProgress::default(),
            timestamp,
            attempts_made: 0,
            attempts_started: 0,
            processed_on: None,
            finished_on: None,
            return_value: None,
            failed_reason: None,
            stack_trace: Vec::new(),
            queue_qualified_name: queue_qualified_name.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-job options: retry attempts, backoff policy and initial delay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Total attempts allowed. `0` and `1` both mean "no retries".
    pub attempts: u32,
    /// Milliseconds to wait before the job becomes claimable.
    pub delay: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

impl JobOptions {
    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Apply submitter overrides on top of these (queue default) options.
    pub fn merged_with(&self, overrides: &JobOptionsOverride) -> JobOptions {
        JobOptions {
            attempts: overrides.attempts.unwrap_or(self.attempts),
            delay: overrides.delay.unwrap_or(self.delay),
            backoff: overrides.backoff.clone().or_else(|| self.backoff.clone()),
        }
    }

    /// Delay before the retry that follows the `attempts_made`-th failure.
    pub fn retry_delay(&self, attempts_made: u32) -> u64 {
        self.backoff
            .as_ref()
            .map(|b| b.delay_for(attempts_made))
            .unwrap_or(0)
    }
}

/// Options supplied at submission time; unset fields fall back to the
/// queue's default job options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptionsOverride {
    pub attempts: Option<u32>,
    pub delay: Option<u64>,
    pub backoff: Option<Backoff>,
}

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    #[serde(default)]
    pub delay: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl Backoff {
    pub fn fixed(delay: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
        }
    }

    pub fn exponential(delay: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
        }
    }

    /// Delay in milliseconds after the `attempts_made`-th failure (1-based).
    ///
    /// Exponential backoff doubles the base delay on every failure:
    /// `delay * 2^(attempts_made - 1)`, saturating at `u64::MAX`.
    pub fn delay_for(&self, attempts_made: u32) -> u64 {
        match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(63);
                self.delay.saturating_mul(1u64 << exponent)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress reported by a processor: a percentage or a structured status.
///
/// Percentages are kept within `0..=100`. Whole percentages serialize as
/// integers, so `50.0` is stored as `50`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum JobProgress {
    Percent(f64),
    Status(serde_json::Map<String, Value>),
}

impl JobProgress {
    /// A percentage clamped to `0..=100`. `NaN` counts as no progress.
    pub fn percent(value: f64) -> Self {
        if value.is_nan() {
            JobProgress::Percent(0.0)
        } else {
            JobProgress::Percent(value.clamp(0.0, 100.0))
        }
    }
}

impl Default for JobProgress {
    fn default() -> Self {
        JobProgress::Percent(0.0)
    }
}

impl Serialize for JobProgress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JobProgress::Percent(p) if p.fract() == 0.0 && (0.0..=100.0).contains(p) => {
                serializer.serialize_u64(*p as u64)
            }
            JobProgress::Percent(p) => serializer.serialize_f64(*p),
            JobProgress::Status(status) => status.serialize(serializer),
        }
    }
}

impl From<f64> for JobProgress {
    fn from(percent: f64) -> Self {
        JobProgress::percent(percent)
    }
}

impl From<u8> for JobProgress {
    fn from(percent: u8) -> Self {
        JobProgress::percent(f64::from(percent))
    }
}

impl From<serde_json::Map<String, Value>> for JobProgress {
    fn from(status: serde_json::Map<String, Value>) -> Self {
        JobProgress::Status(status)
    }
}

// ---------------------------------------------------------------------------
// States and counts
// ---------------------------------------------------------------------------

/// Broker collection a job id can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
    Prioritized,
    WaitingChildren,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Delayed,
        JobState::Prioritized,
        JobState::Paused,
        JobState::WaitingChildren,
        JobState::Completed,
        JobState::Failed,
    ];

    /// Key suffix of the broker collection holding jobs in this state.
    pub fn key_suffix(self) -> &'static str {
        match self {
            JobState::Waiting => "wait",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Paused => "paused",
            JobState::Prioritized => "prioritized",
            JobState::WaitingChildren => "waiting-children",
        }
    }

    /// Whether the collection is a list (FIFO) rather than a scored set.
    pub fn is_list(self) -> bool {
        matches!(
            self,
            JobState::Waiting | JobState::Active | JobState::Paused
        )
    }
}

/// Number of jobs in each status bucket of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub active: u64,
    pub completed: u64,
    pub delayed: u64,
    pub failed: u64,
    pub paused: u64,
    pub prioritized: u64,
    pub waiting: u64,
    #[serde(rename = "waiting-children")]
    pub waiting_children: u64,
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// How many finished jobs of one kind the broker keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeepJobs {
    #[default]
    All,
    /// Keep only the most recent `n` jobs; older ones are removed.
    Last(usize),
}

impl KeepJobs {
    /// Number of oldest entries to drop from a collection of `len` jobs.
    pub fn excess(self, len: usize) -> usize {
        match self {
            KeepJobs::All => 0,
            KeepJobs::Last(n) => len.saturating_sub(n),
        }
    }
}

/// Failure details recorded on a job when an attempt fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// Short human-readable reason (the error's display form).
    pub reason: String,
    /// Full error chain.
    pub stack_trace: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
