pub mod health;
pub mod metrics;

pub use health::*;
pub use metrics::*;

use axum::{middleware, routing::get, Router};
use std::{sync::Arc, time::Duration};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer};

use crate::observability::{observability_middleware, panic_response, Metrics, RequestInterceptor};

/// Health and scrape endpoints: `/health`, `/ready` and `/metrics`.
pub fn observability_routes(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Wrap `router` with request observability.
///
/// Layers run outer to inner: the observability middleware, the request
/// timeout, then panic capture, so a panicking handler still produces an
/// error envelope and a closed span.
pub fn instrument(
    router: Router,
    interceptor: RequestInterceptor,
    request_timeout: Option<Duration>,
) -> Router {
    let router = router.layer(CatchPanicLayer::custom(panic_response));

    let router = match request_timeout {
        Some(timeout) => router.layer(TimeoutLayer::new(timeout)),
        None => router,
    };

    router.layer(middleware::from_fn_with_state(
        interceptor,
        observability_middleware,
    ))
}

/// The application router: built-in endpoints merged with `routes`, instrumented.
pub fn create_app(
    routes: Router,
    interceptor: RequestInterceptor,
    request_timeout: Option<Duration>,
) -> Router {
    let metrics = interceptor.metrics().clone();
    instrument(
        observability_routes(metrics).merge(routes),
        interceptor,
        request_timeout,
    )
}
