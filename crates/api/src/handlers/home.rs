use axum::Json;
use serde_json::{json, Value};

use crate::middleware::auth::AuthUser;

/// GET /
///
/// Authenticated greeting, handy for checking a token.
pub async fn hello(_auth: AuthUser) -> Json<Value> {
    Json(json!({ "hello": "world" }))
}
