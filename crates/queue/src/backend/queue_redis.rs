//! Redis implementation of [`QueueBackend`].
//!
//! Key layout, for a queue `q` under prefix `p`:
//!
//! | Key              | Type | Contents                                  |
//! |------------------|------|-------------------------------------------|
//! | `p:q:id`         | str  | last assigned job id (`INCR`)             |
//! | `p:q:<id>`       | hash | job fields                                |
//! | `p:q:<id>:logs`  | list | log lines                                 |
//! | `p:q:wait`       | list | claimable ids, newest at the head         |
//! | `p:q:active`     | list | claimed ids                               |
//! | `p:q:locks`      | zset | claimed ids scored by lock expiry (ms)    |
//! | `p:q:delayed`    | zset | ids scored by due time (ms)               |
//! | `p:q:completed`  | zset | ids scored by `finishedOn`                |
//! | `p:q:failed`     | zset | ids scored by `finishedOn`                |
//!
//! Claiming relies on `LMOVE` being atomic, so two workers never receive the
//! same id. Promotion of due delayed jobs and recovery of stalled jobs only
//! re-queue an id when this caller's `ZREM` removed it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use jobhost_core::types::{now_ms, TimestampMs};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{due_at, QueueBackend};
use crate::connection::BrokerConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobCounts, JobFailure, JobOptions, JobProgress, JobState, KeepJobs};

/// Key suffix of the zset holding the lock expiry of every claimed id.
const LOCKS_SUFFIX: &str = "locks";

#[derive(Clone)]
pub struct RedisQueueBackend {
    conn: ConnectionManager,
    prefix: String,
}

impl fmt::Debug for RedisQueueBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueueBackend")
            .field("conn", &"<ConnectionManager>")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisQueueBackend {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    /// Open the shared connection described by `config`.
    ///
    /// Fails with [`QueueError::ConnectTimeout`] if the connection is not
    /// established within `config.connection_timeout_ms`.
    pub async fn connect(config: &BrokerConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis.connection_info())?;
        let limit = Duration::from_millis(config.connection_timeout_ms);

        let conn = tokio::time::timeout(limit, ConnectionManager::new(client))
            .await
            .map_err(|_| QueueError::ConnectTimeout(config.connection_timeout_ms))??;

        info!(
            host = %config.redis.host,
            port = config.redis.port,
            db = config.redis.db,
            prefix = %config.prefix,
            "Connected to Redis"
        );
        Ok(Self::new(conn, config.prefix.clone()))
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    fn logs_key(&self, queue: &str, id: &str) -> String {
        format!("{}:{}:{}:logs", self.prefix, queue, id)
    }

    async fn load_job(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        id: &str,
    ) -> QueueResult<Option<Job>> {
        let fields: HashMap<String, String> = conn.hgetall(self.key(queue, id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(id, &self.qualified_name(queue), &fields).map(Some)
    }

    async fn require_job(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        id: &str,
    ) -> QueueResult<Job> {
        self.load_job(conn, queue, id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound {
                queue: queue.to_string(),
                id: id.to_string(),
            })
    }

    async fn require_exists(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        id: &str,
    ) -> QueueResult<()> {
        let exists: bool = conn.exists(self.key(queue, id)).await?;
        if exists {
            Ok(())
        } else {
            Err(QueueError::JobNotFound {
                queue: queue.to_string(),
                id: id.to_string(),
            })
        }
    }

    /// Move due delayed ids to the wait list.
    async fn promote_delayed(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        now: TimestampMs,
    ) -> QueueResult<()> {
        let delayed_key = self.key(queue, JobState::Delayed.key_suffix());
        let wait_key = self.key(queue, JobState::Waiting.key_suffix());

        let due: Vec<String> = conn.zrangebyscore(&delayed_key, "-inf", now).await?;
        for id in due {
            let removed: i64 = conn.zrem(&delayed_key, &id).await?;
            if removed == 1 {
                let _: () = conn.lpush(&wait_key, &id).await?;
                debug!(queue, job_id = %id, "Promoted delayed job");
            }
        }
        Ok(())
    }

    /// Put claimed ids whose lock expired back at the claim end of the wait
    /// list.
    async fn recover_stalled(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        now: TimestampMs,
    ) -> QueueResult<()> {
        let locks_key = self.key(queue, LOCKS_SUFFIX);
        let active_key = self.key(queue, JobState::Active.key_suffix());
        let wait_key = self.key(queue, JobState::Waiting.key_suffix());

        let expired: Vec<String> = conn.zrangebyscore(&locks_key, "-inf", now).await?;
        for id in expired {
            let released: i64 = conn.zrem(&locks_key, &id).await?;
            if released != 1 {
                continue;
            }
            // A holder that finished in the meantime already left active.
            let removed: i64 = conn.lrem(&active_key, 1, &id).await?;
            if removed == 1 {
                let _: () = conn.rpush(&wait_key, &id).await?;
                warn!(queue, job_id = %id, "Recovered stalled job");
            }
        }
        Ok(())
    }

    /// Remove the oldest finished jobs beyond `keep`, hashes and logs included.
    ///
    /// Only the ids read here are removed from the set, so concurrent trims
    /// never drop a job whose hash they did not delete.
    async fn trim_finished(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        state: JobState,
        keep: KeepJobs,
    ) -> QueueResult<()> {
        let KeepJobs::Last(keep) = keep else {
            return Ok(());
        };

        // Everything but the newest `keep` entries, read in one command.
        let set_key = self.key(queue, state.key_suffix());
        let stop = -isize::try_from(keep).unwrap_or(isize::MAX) - 1;
        let ids: Vec<String> = conn.zrange(&set_key, 0, stop).await?;
        if ids.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.del(self.key(queue, id)).ignore();
            pipe.del(self.logs_key(queue, id)).ignore();
        }
        pipe.zrem(&set_key, &ids).ignore();
        let _: () = pipe.query_async(conn).await?;

        debug!(queue, state = state.key_suffix(), removed = ids.len(), "Trimmed finished jobs");
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        opts: JobOptions,
    ) -> QueueResult<Job> {
        let mut conn = self.conn.clone();

        let id: u64 = conn.incr(self.key(queue, "id"), 1).await?;
        let id = id.to_string();
        let now = now_ms();
        let job = Job::new(id.clone(), name, data, opts, now, self.qualified_name(queue));

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(self.key(queue, &id), encode_job(&job)?.as_slice())
            .ignore();
        if job.opts.delay > 0 {
            let due = due_at(now, job.opts.delay);
            pipe.zadd(self.key(queue, JobState::Delayed.key_suffix()), &id, due)
                .ignore();
        } else {
            pipe.lpush(self.key(queue, JobState::Waiting.key_suffix()), &id)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(queue, job_id = %id, name, "Job added");
        Ok(job)
    }

    async fn get_job(&self, queue: &str, id: &str) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        self.load_job(&mut conn, queue, id).await
    }

    async fn get_jobs(&self, queue: &str, states: &[JobState]) -> QueueResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let mut jobs = Vec::new();

        for state in states {
            let key = self.key(queue, state.key_suffix());
            let ids: Vec<String> = if state.is_list() {
                // Lists are pushed at the head; report oldest first.
                let mut ids: Vec<String> = conn.lrange(&key, 0, -1).await?;
                ids.reverse();
                ids
            } else {
                conn.zrange(&key, 0, -1).await?
            };

            for id in ids {
                match self.load_job(&mut conn, queue, &id).await? {
                    Some(job) => jobs.push(job),
                    None => warn!(queue, job_id = %id, "Listed job has no stored data"),
                }
            }
        }

        Ok(jobs)
    }

    async fn get_job_counts(&self, queue: &str) -> QueueResult<JobCounts> {
        let mut conn = self.conn.clone();
        let key = |state: JobState| self.key(queue, state.key_suffix());

        let mut pipe = redis::pipe();
        pipe.llen(key(JobState::Active))
            .zcard(key(JobState::Completed))
            .zcard(key(JobState::Delayed))
            .zcard(key(JobState::Failed))
            .llen(key(JobState::Paused))
            .zcard(key(JobState::Prioritized))
            .llen(key(JobState::Waiting))
            .zcard(key(JobState::WaitingChildren));

        let (active, completed, delayed, failed, paused, prioritized, waiting, waiting_children): (
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
        ) = pipe.query_async(&mut conn).await?;

        Ok(JobCounts {
            active,
            completed,
            delayed,
            failed,
            paused,
            prioritized,
            waiting,
            waiting_children,
        })
    }

    async fn claim_next(&self, queue: &str, lock_ms: u64) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        self.recover_stalled(&mut conn, queue, now).await?;
        self.promote_delayed(&mut conn, queue, now).await?;

        let wait_key = self.key(queue, JobState::Waiting.key_suffix());
        let active_key = self.key(queue, JobState::Active.key_suffix());

        loop {
            let id: Option<String> = redis::cmd("LMOVE")
                .arg(&wait_key)
                .arg(&active_key)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            let Some(id) = id else {
                return Ok(None);
            };

            let job_key = self.key(queue, &id);
            let exists: bool = conn.exists(&job_key).await?;
            if !exists {
                warn!(queue, job_id = %id, "Dropping claimed id without stored data");
                let _: () = conn.lrem(&active_key, 1, &id).await?;
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.hincr(&job_key, "attemptsStarted", 1).ignore();
            pipe.hset(&job_key, "processedOn", now).ignore();
            pipe.zadd(self.key(queue, LOCKS_SUFFIX), &id, due_at(now, lock_ms))
                .ignore();
            let _: () = pipe.query_async(&mut conn).await?;

            return self.load_job(&mut conn, queue, &id).await;
        }
    }

    async fn extend_lock(&self, queue: &str, id: &str, lock_ms: u64) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let locks_key = self.key(queue, LOCKS_SUFFIX);

        // ZADD XX only touches a lock that still exists; the score read in
        // the same transaction tells whether it did.
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zscore(&locks_key, id);
        pipe.cmd("ZADD")
            .arg(&locks_key)
            .arg("XX")
            .arg(due_at(now_ms(), lock_ms))
            .arg(id)
            .ignore();
        let (previous,): (Option<f64>,) = pipe.query_async(&mut conn).await?;

        Ok(previous.is_some())
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &JobProgress,
    ) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        self.require_exists(&mut conn, queue, id).await?;

        let encoded = serde_json::to_string(progress)?;
        let _: () = conn.hset(self.key(queue, id), "progress", encoded).await?;
        Ok(())
    }

    async fn add_log(&self, queue: &str, id: &str, line: &str) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        self.require_exists(&mut conn, queue, id).await?;

        let count: u64 = conn.rpush(self.logs_key(queue, id), line).await?;
        Ok(count)
    }

    async fn get_logs(&self, queue: &str, id: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let lines: Vec<String> = conn.lrange(self.logs_key(queue, id), 0, -1).await?;
        Ok(lines)
    }

    async fn move_to_completed(
        &self,
        queue: &str,
        id: &str,
        return_value: Value,
        keep: KeepJobs,
    ) -> QueueResult<Job> {
        let mut conn = self.conn.clone();
        let mut job = self.require_job(&mut conn, queue, id).await?;

        let finished_on = now_ms();
        job.finished_on = Some(finished_on);
        job.return_value = Some(return_value);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(self.key(queue, JobState::Active.key_suffix()), 1, id)
            .ignore();
        pipe.zrem(self.key(queue, LOCKS_SUFFIX), id).ignore();
        pipe.hset_multiple(self.key(queue, id), encode_job(&job)?.as_slice())
            .ignore();
        pipe.zadd(self.key(queue, JobState::Completed.key_suffix()), id, finished_on)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        self.trim_finished(&mut conn, queue, JobState::Completed, keep)
            .await?;
        Ok(job)
    }

    async fn move_to_failed(
        &self,
        queue: &str,
        id: &str,
        failure: &JobFailure,
        keep: KeepJobs,
    ) -> QueueResult<Job> {
        let mut conn = self.conn.clone();
        let mut job = self.require_job(&mut conn, queue, id).await?;

        let finished_on = now_ms();
        record_failure(&mut job, failure);
        job.finished_on = Some(finished_on);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(self.key(queue, JobState::Active.key_suffix()), 1, id)
            .ignore();
        pipe.zrem(self.key(queue, LOCKS_SUFFIX), id).ignore();
        pipe.hset_multiple(self.key(queue, id), encode_job(&job)?.as_slice())
            .ignore();
        pipe.zadd(self.key(queue, JobState::Failed.key_suffix()), id, finished_on)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        self.trim_finished(&mut conn, queue, JobState::Failed, keep)
            .await?;
        Ok(job)
    }

    async fn retry_later(
        &self,
        queue: &str,
        id: &str,
        failure: &JobFailure,
        delay_ms: u64,
    ) -> QueueResult<Job> {
        let mut conn = self.conn.clone();
        let mut job = self.require_job(&mut conn, queue, id).await?;
        record_failure(&mut job, failure);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(self.key(queue, JobState::Active.key_suffix()), 1, id)
            .ignore();
        pipe.zrem(self.key(queue, LOCKS_SUFFIX), id).ignore();
        pipe.hset_multiple(self.key(queue, id), encode_job(&job)?.as_slice())
            .ignore();
        if delay_ms > 0 {
            let due = due_at(now_ms(), delay_ms);
            pipe.zadd(self.key(queue, JobState::Delayed.key_suffix()), id, due)
                .ignore();
        } else {
            pipe.lpush(self.key(queue, JobState::Waiting.key_suffix()), id)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(job)
    }
}

fn record_failure(job: &mut Job, failure: &JobFailure) {
    job.attempts_made += 1;
    job.failed_reason = Some(failure.reason.clone());
    job.stack_trace.push(failure.stack_trace.clone());
}

// ---------------------------------------------------------------------------
// Hash encoding
// ---------------------------------------------------------------------------

/// Flatten a job into hash fields. Unset optional fields are omitted.
fn encode_job(job: &Job) -> QueueResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("name", job.name.clone()),
        ("data", serde_json::to_string(&job.data)?),
        ("opts", serde_json::to_string(&job.opts)?),
        ("progress", serde_json::to_string(&job.progress)?),
        ("delay", job.delay.to_string()),
        ("timestamp", job.timestamp.to_string()),
        ("attemptsMade", job.attempts_made.to_string()),
        ("attemptsStarted", job.attempts_started.to_string()),
        ("stacktrace", serde_json::to_string(&job.stack_trace)?),
    ];
    if let Some(processed_on) = job.processed_on {
        fields.push(("processedOn", processed_on.to_string()));
    }
    if let Some(finished_on) = job.finished_on {
        fields.push(("finishedOn", finished_on.to_string()));
    }
    if let Some(return_value) = &job.return_value {
        fields.push(("returnvalue", serde_json::to_string(return_value)?));
    }
    if let Some(reason) = &job.failed_reason {
        fields.push(("failedReason", reason.clone()));
    }
    Ok(fields)
}

/// Rebuild a job from its hash. Missing counters default to zero.
fn decode_job(id: &str, qualified: &str, fields: &HashMap<String, String>) -> QueueResult<Job> {
    fn number<T: std::str::FromStr>(
        fields: &HashMap<String, String>,
        name: &str,
    ) -> QueueResult<Option<T>> {
        fields
            .get(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|_| QueueError::InvalidData(format!("field '{name}' is not a number: {raw}")))
            })
            .transpose()
    }

    fn json<T: serde::de::DeserializeOwned>(
        fields: &HashMap<String, String>,
        name: &str,
    ) -> QueueResult<Option<T>> {
        fields
            .get(name)
            .map(|raw| serde_json::from_str(raw).map_err(QueueError::from))
            .transpose()
    }

    let name = fields
        .get("name")
        .cloned()
        .ok_or_else(|| QueueError::InvalidData(format!("job {id} has no name")))?;

    Ok(Job {
        id: id.to_string(),
        name,
        data: json(fields, "data")?.unwrap_or(Value::Null),
        opts: json(fields, "opts")?.unwrap_or_default(),
        progress: json(fields, "progress")?.unwrap_or_default(),
        delay: number(fields, "delay")?.unwrap_or(0),
        timestamp: number(fields, "timestamp")?.unwrap_or(0),
        attempts_made: number(fields, "attemptsMade")?.unwrap_or(0),
        attempts_started: number(fields, "attemptsStarted")?.unwrap_or(0),
        processed_on: number(fields, "processedOn")?,
        finished_on: number(fields, "finishedOn")?,
        return_value: json(fields, "returnvalue")?,
        failed_reason: fields.get("failedReason").cloned(),
        stack_trace: json(fields, "stacktrace")?.unwrap_or_default(),
        queue_qualified_name: qualified.to_string(),
    })
}
