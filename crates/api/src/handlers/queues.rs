//! Handlers for the `/queues` resource.
//!
//! All endpoints require authentication via [`AuthUser`]. Queues are looked
//! up in the worker registry, so only queues declared by a worker module are
//! reachable.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use jobhost_core::error::CoreError;
use jobhost_queue::job::{Job, JobCounts, JobOptionsOverride};
use jobhost_queue::Queue;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub name: String,
    pub qualified_name: String,
    pub counts: JobCounts,
}

#[derive(Debug, Serialize)]
pub struct QueueList {
    pub queues: Vec<QueueSummary>,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct JobEnvelope {
    pub job: Job,
}

#[derive(Debug, Serialize)]
pub struct JobCreated {
    pub message: &'static str,
    pub job: Job,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve a queue declared by a worker module, or `NotFound`.
fn find_queue(state: &AppState, queue_name: &str) -> AppResult<Queue> {
    state
        .registry
        .find_queue(queue_name)?
        .ok_or_else(|| AppError::Core(CoreError::not_found("Queue", queue_name)))
}

/// A validated submission body.
#[derive(Debug)]
struct NewJob {
    name: String,
    data: Value,
    options: Option<JobOptionsOverride>,
}

/// Validate a raw submission body.
///
/// `jobName` must be a non-empty string and `jobData` must be present and
/// not `null`. `jobOptions` is optional; only `attempts`, `delay` and
/// `backoff` are honoured.
fn parse_new_job(body: &[u8]) -> Result<NewJob, CoreError> {
    let value: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(body)
            .map_err(|e| CoreError::Validation(format!("Request body is not valid JSON: {e}")))?
    };

    let Value::Object(mut fields) = value else {
        return Err(CoreError::Validation(
            "Request body must be a JSON object with jobName and jobData".into(),
        ));
    };

    let name = match fields.get("jobName") {
        Some(Value::String(name)) if !name.is_empty() => Some(name.clone()),
        _ => None,
    };
    let has_data = !matches!(fields.get("jobData"), None | Some(Value::Null));

    let Some(name) = name.filter(|_| has_data) else {
        return Err(CoreError::Validation(format!(
            "jobName and jobData are required; received fields: [{}]",
            received_fields(&fields)
        )));
    };

    let data = fields.remove("jobData").unwrap_or(Value::Null);
    let options = match fields.remove("jobOptions") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<JobOptionsOverride>(raw)
                .map_err(|e| CoreError::Validation(format!("Invalid jobOptions: {e}")))?,
        ),
    };

    Ok(NewJob {
        name,
        data,
        options,
    })
}

fn received_fields(fields: &Map<String, Value>) -> String {
    fields.keys().map(String::as_str).collect::<Vec<_>>().join(", ")
}

// ---------------------------------------------------------------------------
// List queues
// ---------------------------------------------------------------------------

/// GET /queues
///
/// Every queue declared by a worker module, with its job counts.
pub async fn list_queues(
    _auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<Json<QueueList>> {
    let mut queues = Vec::new();

    for queue in state.registry.list_queues()? {
        let counts = queue.get_job_counts().await?;
        queues.push(QueueSummary {
            name: queue.name().to_string(),
            qualified_name: queue.qualified_name().to_string(),
            counts,
        });
    }

    Ok(Json(QueueList { queues }))
}

// ---------------------------------------------------------------------------
// Jobs in a queue
// ---------------------------------------------------------------------------

/// GET /queues/{queue_name}
///
/// Every job stored in the queue, across all states.
pub async fn list_jobs(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
) -> AppResult<Json<JobList>> {
    let queue = find_queue(&state, &queue_name)?;
    let jobs = queue.get_jobs().await?;
    Ok(Json(JobList { jobs }))
}

/// POST /queues/{queue_name}
///
/// Submit a job. The queue is resolved before the body is looked at, so an
/// unknown queue is a 404 whatever the payload. Returns 201 with the stored
/// job.
pub async fn create_job(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let queue = find_queue(&state, &queue_name)?;
    let new_job = parse_new_job(&body)?;

    let job = queue
        .add(&new_job.name, new_job.data, new_job.options)
        .await?;

    tracing::info!(
        queue = %queue_name,
        job_id = %job.id,
        job_name = %job.name,
        "Job created",
    );

    Ok((
        StatusCode::CREATED,
        Json(JobCreated {
            message: "Job created",
            job,
        }),
    ))
}

/// GET /queues/{queue_name}/{job_id}
pub async fn get_job(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path((queue_name, job_id)): Path<(String, String)>,
) -> AppResult<Json<JobEnvelope>> {
    let queue = find_queue(&state, &queue_name)?;
    let job = queue
        .get_job(&job_id)
        .await?
        .ok_or_else(|| AppError::Core(CoreError::not_found("Job", job_id)))?;
    Ok(Json(JobEnvelope { job }))
}
