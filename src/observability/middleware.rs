use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use std::{any::Any, net::SocketAddr};
use tracing::warn;

use super::interceptor::{ErrorEnvelope, Failure, RequestInterceptor, RequestMeta};
use super::logger::ErrorDetail;
use super::tags::REQUEST_ID_HEADER;
use super::telemetry::{extract_remote_context, request_hook};

/// Route pattern supplied by an outer routing layer when `MatchedPath` is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHint(pub String);

/// Request observability for an axum router.
///
/// Install with `axum::middleware::from_fn_with_state(interceptor, observability_middleware)`
/// as the outermost layer. Handlers report failures by returning a response
/// carrying a [`Failure`] extension (see [`failure_response`]); the middleware
/// turns it into the error envelope.
pub async fn observability_middleware(
    State(interceptor): State<RequestInterceptor>,
    mut request: Request,
    next: Next,
) -> Response {
    let meta = request_meta(&request);
    let active = interceptor.enter(meta);
    request_hook(active.otel_context(), request.headers());

    let request_id = active.request_id().to_string();
    request.extensions_mut().insert(active.context().clone());

    let mut response = active.scope(next.run(request)).await;

    match response.extensions_mut().remove::<Failure>() {
        Some(failure) => {
            let envelope = active.fail(&failure);
            response = envelope_response(envelope);
        }
        None => active.succeed(response.status().as_u16()),
    }

    match HeaderValue::from_str(&request_id) {
        Ok(value) => {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        Err(e) => warn!(error = %e, "Request id is not a valid header value"),
    }

    response
}

fn request_meta(request: &Request) -> RequestMeta {
    let headers = request.headers();
    let extensions = request.extensions();

    RequestMeta {
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        query: request.uri().query().map(str::to_string),
        route: extensions
            .get::<MatchedPath>()
            .map(|matched_path| matched_path.as_str().to_string()),
        route_hint: extensions.get::<RouteHint>().map(|hint| hint.0.clone()),
        request_id: header_str(headers, REQUEST_ID_HEADER).map(str::to_string),
        client_ip: client_ip(headers).or_else(|| {
            extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        }),
        user_agent: header_str(headers, "user-agent").map(str::to_string),
        parent: Some(extract_remote_context(headers)),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// First address from X-Forwarded-For, else X-Real-IP.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

fn envelope_response(envelope: ErrorEnvelope) -> Response {
    let status =
        StatusCode::from_u16(envelope.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope)).into_response()
}

/// A bodyless response that asks [`observability_middleware`] to render `failure`.
pub fn failure_response(failure: Failure) -> Response {
    let status = StatusCode::from_u16(failure.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = status.into_response();
    response.extensions_mut().insert(failure);
    response
}

/// Panic handler for `tower_http::catch_panic::CatchPanicLayer::custom`.
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = payload.downcast_ref::<String>() {
        ErrorDetail::new("Panic", message.clone())
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        ErrorDetail::new("Panic", *message)
    } else {
        ErrorDetail::new("UnknownError", "Handler panicked with a non-string payload")
    };

    failure_response(Failure::Unclassified(detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{
        interceptor::{current_request_id, INTERNAL_ERROR_MESSAGE},
        logger::{LogContext, LogLevel, LoggerOptions, MemorySink, StructuredLogger},
        metrics::{Metrics, MetricsOptions},
        reporter::ErrorReporter,
        tags::ServiceIdentity,
    };
    use axum::{body::Body, http::Method, middleware, routing::get, Router};
    use std::sync::Arc;
    use tower::ServiceExt;
    use tower_http::catch_panic::CatchPanicLayer;

    fn app() -> (Router, Arc<Metrics>, MemorySink) {
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
                identity: ServiceIdentity::resolve_with(|_| None),
                collect_process_metrics: false,
                ..Default::default()
            })
            .unwrap(),
        );
        let interceptor =
            RequestInterceptor::new(logger, metrics.clone(), Arc::new(ErrorReporter::disabled()));

        let router = Router::new()
            .route("/echo-id", get(|| async { current_request_id().unwrap_or_default() }))
            .route(
                "/missing/:id",
                get(|| async {
                    failure_response(Failure::Classified {
                        status: 404,
                        message: "Client not found".into(),
                        name: "NotFoundException".to_string(),
                    })
                }),
            )
            .route(
                "/panic",
                get(|| async {
                    if true {
                        panic!("handler exploded");
                    }
                    "unreachable"
                }),
            )
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(middleware::from_fn_with_state(interceptor, observability_middleware));

        (router, metrics, logs)
    }

    fn get_request(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_request_id_visible_to_handler_and_echoed() {
        let (app, _, _) = app();

        let response = app.oneshot(get_request("/echo-id")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let header = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(body.to_vec()).unwrap(), header);
    }

    #[tokio::test]
    async fn test_failure_extension_becomes_envelope() {
        let (app, metrics, _) = app();

        let response = app.oneshot(get_request("/missing/7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let header = response.headers().get(REQUEST_ID_HEADER).cloned().unwrap();

        let body = body_json(response).await;
        assert_eq!(body["statusCode"], 404);
        assert_eq!(body["error"], "NotFoundException");
        assert_eq!(body["path"], "/missing/7");
        assert_eq!(body["requestId"], header.to_str().unwrap());

        assert_eq!(
            metrics
                .http_requests_total
                .with_label_values(&["GET", "/missing/:id", "404", "4xx"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_panic_is_an_unclassified_failure() {
        let (app, metrics, logs) = app();

        let response = app.oneshot(get_request("/panic")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["message"], INTERNAL_ERROR_MESSAGE);
        assert_eq!(body["error"], "Panic");

        let records = logs.records();
        assert!(records.iter().any(|r| r.message == "handler exploded"));
        assert_eq!(
            metrics.http_requests_in_flight.with_label_values(&["GET"]).get(),
            0.0
        );
    }

    #[tokio::test]
    async fn test_unmatched_path_uses_literal_route() {
        let (app, metrics, _) = app();

        let response = app.oneshot(get_request("/nowhere")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        assert_eq!(
            metrics
                .http_requests_total
                .with_label_values(&["GET", "/nowhere", "404", "4xx"])
                .get(),
            1.0
        );
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.9"));

        headers.insert("x-forwarded-for", HeaderValue::from_static(" 203.0.113.7, 10.0.0.1"));
        assert_eq!(client_ip(&headers).as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn test_non_string_panic_payload() {
        let response = panic_response(Box::new(42_u32));
        let failure = response.extensions().get::<Failure>().unwrap();

        assert_eq!(failure.name(), "UnknownError");
        assert_eq!(failure.status(), 500);
    }
}
