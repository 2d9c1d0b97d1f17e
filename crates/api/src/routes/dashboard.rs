use axum::routing::get;
use axum::Router;

use crate::handlers::dashboard;
use crate::state::AppState;

/// Routes serving the HTML queue summary.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ui", get(dashboard::overview))
        .route("/ui/{*path}", get(dashboard::overview))
}
