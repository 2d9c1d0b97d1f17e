use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use jobhost_core::error::CoreError;
use jobhost_queue::QueueError;
use jobhost_worker::RegistryError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and the broker and registry errors
/// raised while serving a request. Implements [`IntoResponse`] to produce
/// consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `jobhost_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A broker error from `jobhost_queue`.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The worker manifest is inconsistent.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, id } => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("{entity} with id {id} not found"),
                ),
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Unauthorized(msg) => {
                    (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
                }
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    internal()
                }
            },

            // --- Broker errors ---
            AppError::Queue(err) => classify_queue_error(err),

            AppError::Registry(err) => {
                tracing::error!(error = %err, "Worker registry error");
                internal()
            }

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}

/// Classify a broker error into an HTTP status, error code, and message.
///
/// - Connection and IO failures map to 503.
/// - A job that vanished between lookup and use maps to 404.
/// - Everything else maps to 500 with a sanitized message.
fn classify_queue_error(err: &QueueError) -> (StatusCode, &'static str, String) {
    if err.is_connection_error() {
        tracing::warn!(error = %err, "Broker unreachable");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "The job broker is unavailable".to_string(),
        );
    }

    match err {
        QueueError::JobNotFound { id, .. } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("Job with id {id} not found"),
        ),
        other => {
            tracing::error!(error = %other, "Broker error");
            internal()
        }
    }
}
