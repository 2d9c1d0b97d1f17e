pub mod dashboard;
pub mod health;
pub mod queues;

use axum::routing::get;
use axum::Router;

use crate::config::ServerConfig;
use crate::handlers;
use crate::state::AppState;

/// Build the authenticated route tree.
///
/// Route hierarchy:
///
/// ```text
/// /                                  hello (token check)
/// /queues                            list queues with counts
///     /{queue_name}                  list jobs, create job
///     /{queue_name}/{job_id}         get job
/// /ui, /ui/{*path}                   HTML summary (only when enabled)
/// ```
pub fn api_routes(config: &ServerConfig) -> Router<AppState> {
    let router = Router::new()
        .route("/", get(handlers::home::hello))
        .nest("/queues", queues::router());

    if config.dashboard_enabled {
        router.merge(dashboard::router())
    } else {
        router
    }
}
