#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::Path,
    http::{Method, Request},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use practice_observability::{
    create_app,
    observability::{
        current_request_id, set_current_user, ErrorReporter, LogContext, LogLevel, LoggerOptions,
        MemorySink, Metrics, MetricsOptions, RequestInterceptor, ServiceIdentity,
        StructuredLogger,
    },
    ApiError, ApiResult,
};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub const TEST_TIMEOUT: Duration = Duration::from_millis(250);

/// An instrumented router with its own metrics registry and captured logs.
pub struct TestApp {
    pub router: Router,
    pub metrics: Arc<Metrics>,
    pub logs: MemorySink,
}

pub struct TestEnvironment {
    pub client: Client,
    pub base_url: String,
    pub metrics: Arc<Metrics>,
    pub logs: MemorySink,
}

pub fn test_identity() -> ServiceIdentity {
    ServiceIdentity::resolve_with(|key| match key {
        "SERVICE_NAME" => Some("practice-test".to_string()),
        "APP_ENV" => Some("test".to_string()),
        "APP_VERSION" => Some("1.2.3".to_string()),
        _ => None,
    })
}

// Demo handlers
async fn get_client(Path(id): Path<String>) -> ApiResult<Json<Value>> {
    if id == "1" {
        Ok(Json(json!({ "id": id, "name": "Ada" })))
    } else {
        Err(ApiError::not_found("Client not found"))
    }
}

async fn create_session() -> ApiResult<Json<Value>> {
    Err(anyhow::anyhow!("database connection refused: password=hunter2").into())
}

async fn validate_client() -> ApiResult<Json<Value>> {
    Err(ApiError::bad_request(vec![
        "email must be an email".to_string(),
        "name should not be empty".to_string(),
    ]))
}

async fn whoami() -> Json<Value> {
    let attached = set_current_user("user-42");
    Json(json!({
        "attached": attached,
        "requestId": current_request_id(),
    }))
}

async fn panics() -> &'static str {
    if true {
        panic!("handler exploded");
    }
    "unreachable"
}

async fn slow() -> &'static str {
    tokio::time::sleep(TEST_TIMEOUT * 4).await;
    "too late"
}

pub fn demo_routes() -> Router {
    Router::new()
        .route("/clients/:id", get(get_client))
        .route("/clients", post(validate_client))
        .route("/sessions", post(create_session))
        .route("/whoami", get(whoami))
        .route("/panic", get(panics))
        .route("/slow", get(slow))
}

pub fn test_app() -> TestApp {
    let identity = test_identity();
    let logs = MemorySink::new();
    let logger = StructuredLogger::new(
        LoggerOptions {
            level: LogLevel::Debug,
            bindings: LogContext::new(),
        },
        Arc::new(logs.clone()),
    );
    let metrics = Arc::new(
        Metrics::new(MetricsOptions {
            identity,
            collect_process_metrics: false,
            ..Default::default()
        })
        .expect("Failed to create metrics"),
    );
    let interceptor =
        RequestInterceptor::new(logger, metrics.clone(), Arc::new(ErrorReporter::disabled()));

    TestApp {
        router: create_app(demo_routes(), interceptor, Some(TEST_TIMEOUT)),
        metrics,
        logs,
    }
}

pub fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_json(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub async fn body_text(response: Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

impl TestEnvironment {
    pub async fn new() -> Self {
        let TestApp {
            router,
            metrics,
            logs,
        } = test_app();

        // Start server
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind listener");
        let addr = listener.local_addr().expect("Failed to get local address");
        let base_url = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("Failed to serve app");
        });

        // Wait for server to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            client: Client::new(),
            base_url,
            metrics,
            logs,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}
