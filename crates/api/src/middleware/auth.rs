//! Token authentication extractor and query-token cookie persistence.

use axum::extract::{FromRequestParts, Query, Request};
use axum::http::header::{AUTHORIZATION, COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Uri};
use axum::middleware::Next;
use axum::response::Response;
use jobhost_core::error::CoreError;
use serde::Deserialize;

use crate::auth::jwt::validate_token;
use crate::error::AppError;
use crate::state::AppState;

/// Name of the query parameter and cookie carrying the token.
pub const TOKEN_PARAM: &str = "token";

/// Caller authenticated by a valid token.
///
/// The token is looked up in the `token` query parameter, then the `token`
/// cookie, then the `Authorization: Bearer` header. Add it as the
/// first extractor of any handler that requires authentication:
///
/// ```ignore
/// async fn my_handler(_auth: AuthUser) -> AppResult<Json<()>> {
///     Ok(Json(()))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The `user` claim, when the token carries one.
    pub user: Option<String>,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_query(&parts.uri)
            .or_else(|| token_from_cookie(&parts.headers))
            .or_else(|| token_from_bearer(&parts.headers))
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized("Missing authentication token".into()))
            })?;

        let claims = validate_token(&token, &state.config.jwt).map_err(|e| {
            tracing::debug!(error = %e, "Rejected token");
            AppError::Core(CoreError::Unauthorized("Invalid or expired token".into()))
        })?;

        Ok(AuthUser { user: claims.user })
    }
}

/// Write a token passed as `?token=` back as an `HttpOnly` cookie so a
/// browser keeps it for subsequent requests. The cookie holds the decoded
/// token.
pub async fn persist_query_token(request: Request, next: Next) -> Response {
    let token = token_from_query(request.uri());
    let mut response = next.run(request).await;

    if let Some(token) = token {
        match HeaderValue::from_str(&format!("{TOKEN_PARAM}={token}; HttpOnly; Path=/")) {
            Ok(cookie) => {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            Err(_) => tracing::debug!("Query token is not a valid cookie value, not persisting"),
        }
    }

    response
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// The percent-decoded `token` query parameter. A query string that does
/// not parse is treated as carrying no token.
fn token_from_query(uri: &Uri) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(uri)
        .ok()?
        .0
        .token
        .filter(|value| !value.is_empty())
}

fn token_from_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn token_from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == TOKEN_PARAM)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_token_is_found_among_other_params() {
        let uri: Uri = "/queues?page=2&token=abc.def.ghi".parse().unwrap();
        assert_eq!(token_from_query(&uri).as_deref(), Some("abc.def.ghi"));

        let uri: Uri = "/queues?page=2".parse().unwrap();
        assert_eq!(token_from_query(&uri), None);
    }

    #[test]
    fn query_token_is_percent_decoded() {
        let uri: Uri = "/queues?token=abc%2Edef%2Eghi".parse().unwrap();
        assert_eq!(token_from_query(&uri).as_deref(), Some("abc.def.ghi"));

        let uri: Uri = "/queues?token=".parse().unwrap();
        assert_eq!(token_from_query(&uri), None);
    }

    #[test]
    fn bearer_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(token_from_bearer(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(token_from_bearer(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn cookie_token_is_picked_from_the_cookie_list() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; token=xyz; lang=en"));
        assert_eq!(token_from_cookie(&headers).as_deref(), Some("xyz"));
    }
}
