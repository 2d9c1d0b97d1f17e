#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use jobhost_api::auth::jwt::{encode_claims, generate_token, Claims, JwtConfig};
use jobhost_api::config::ServerConfig;
use jobhost_api::router::build_app_router;
use jobhost_api::state::AppState;
use jobhost_queue::{
    InMemoryQueueBackend, JobContext, Processor, Queue, SharedBackend, Worker, WorkerOptions,
};
use jobhost_worker::{ModuleRef, WorkerModule, WorkerRegistry};

pub const TEST_SECRET: &str = "test-secret-that-is-long-enough-for-hmac";

/// Queue names served by the test registry, in manifest order.
pub const TEST_QUEUES: [&str; 2] = ["test", "reports"];

/// Build a test `ServerConfig` with safe defaults and the dashboard enabled.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        dashboard_enabled: true,
        jwt: JwtConfig {
            secret: TEST_SECRET.to_string(),
            token_expiry_mins: 60,
        },
    }
}

struct Echo;

#[async_trait]
impl Processor for Echo {
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<Value> {
        Ok(ctx.data().clone())
    }
}

/// Module with a plain echo processor. The API never starts its worker.
struct TestModule(&'static str);

impl WorkerModule for TestModule {
    fn queue_name(&self) -> &str {
        self.0
    }

    fn create_queue(&self, backend: &SharedBackend) -> Queue {
        Queue::new(self.0, Arc::clone(backend))
    }

    fn create_worker(&self, backend: &SharedBackend) -> Worker {
        Worker::new(
            self.0,
            Arc::new(Echo),
            WorkerOptions::default(),
            Arc::clone(backend),
        )
    }
}

fn test_registry() -> WorkerRegistry {
    let backend: SharedBackend = Arc::new(InMemoryQueueBackend::default());
    WorkerRegistry::new(
        || {
            TEST_QUEUES
                .into_iter()
                .map(|name| Arc::new(TestModule(name)) as ModuleRef)
                .collect()
        },
        backend,
    )
}

/// Build the full application router over a fresh in-memory broker.
///
/// Uses the same builder as `main.rs`, so tests exercise the production
/// middleware stack. Clones of the returned router share the broker.
pub fn build_test_app() -> Router {
    build_test_app_with(test_config())
}

pub fn build_test_app_with(config: ServerConfig) -> Router {
    let state = AppState {
        registry: test_registry(),
        config: Arc::new(config.clone()),
    };
    build_app_router(state, &config)
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// A token valid for an hour, signed with the test secret.
pub fn valid_token() -> String {
    generate_token("tester", &test_config().jwt).unwrap()
}

/// Sign arbitrary claims with `secret`.
pub fn token_with(claims: &Claims, secret: &str) -> String {
    let config = JwtConfig {
        secret: secret.to_string(),
        token_expiry_mins: 60,
    };
    encode_claims(claims, &config).unwrap()
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub async fn send(app: Router, request: Request<Body>) -> Response<Body> {
    app.oneshot(request).await.unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

pub async fn get_auth(app: Router, uri: &str, token: &str) -> Response<Body> {
    let request = Request::builder()
        .uri(uri)
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn post_json_auth(
    app: Router,
    uri: &str,
    token: &str,
    body: &Value,
) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(AUTHORIZATION, format!("Bearer {token}"))
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    send(app, request).await
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    String::from_utf8(body_bytes(response).await).unwrap()
}
