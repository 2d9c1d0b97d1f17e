//! Route definitions for the `/queues` resource.
//!
//! All endpoints require authentication.

use axum::routing::get;
use axum::Router;

use crate::handlers::queues;
use crate::state::AppState;

/// Routes mounted at `/queues`.
///
/// ```text
/// GET    /                          -> list_queues
/// GET    /{queue_name}              -> list_jobs
/// POST   /{queue_name}              -> create_job
/// GET    /{queue_name}/{job_id}     -> get_job
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(queues::list_queues))
        .route(
            "/{queue_name}",
            get(queues::list_jobs).post(queues::create_job),
        )
        .route("/{queue_name}/{job_id}", get(queues::get_job))
}
