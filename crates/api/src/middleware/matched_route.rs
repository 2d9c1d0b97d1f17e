//! Exposes the route template that handled a request.

use axum::extract::{MatchedPath, Request};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;

pub const MATCHED_ROUTE_HEADER: HeaderName = HeaderName::from_static("x-matched-route");

/// Copy the matched route template (e.g. `/queues/{queue_name}`) into the
/// `x-matched-route` response header.
pub async fn record_matched_route(request: Request, next: Next) -> Response {
    let matched = request
        .extensions()
        .get::<MatchedPath>()
        .and_then(|path| HeaderValue::from_str(path.as_str()).ok());

    let mut response = next.run(request).await;
    if let Some(matched) = matched {
        response.headers_mut().insert(MATCHED_ROUTE_HEADER, matched);
    }
    response
}
