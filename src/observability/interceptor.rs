//! Per-request correlation: request id, server span, timing and the single
//! exit point that fans out to logs, metrics, traces and crash reports.

use chrono::{DateTime, Utc};
use opentelemetry::{
    trace::{FutureExt, Status, TraceContextExt},
    Context, KeyValue,
};
use sentry::protocol::Request as ReportRequest;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::{Arc, OnceLock},
    time::Instant,
};
use tracing::debug;

use super::logger::{ErrorDetail, LogContext, StructuredLogger};
use super::metrics::{InFlightGuard, Metrics};
use super::redact::{parse_query, redact_map, redact_query};
use super::reporter::{ErrorReporter, ReportContext};
use super::tags::{generate_request_id, is_valid_request_id};
use super::telemetry::{
    active_context, record_exception_on, record_server_duration, start_server_span,
};

/// Message exposed for every unclassified failure.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

tokio::task_local! {
    static REQUEST_SCOPE: Arc<RequestContext>;
}

/// Correlation state of one inbound request.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub method: String,
    /// Parameterized route pattern, e.g. `/clients/:id`.
    pub route: String,
    pub path: String,
    pub query: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub started_at: DateTime<Utc>,
    started: Instant,
    status: OnceLock<u16>,
    user_id: OnceLock<String>,
}

impl RequestContext {
    /// Set once the response status is known.
    pub fn status_code(&self) -> Option<u16> {
        self.status.get().copied()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.get().map(String::as_str)
    }

    /// Record the authenticated user. Only the first call has an effect.
    pub fn set_user_id(&self, user_id: impl Into<String>) -> bool {
        self.user_id.set(user_id.into()).is_ok()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn log_context(&self) -> LogContext {
        let mut context = LogContext::new()
            .with("request_id", &self.request_id)
            .with("route", &self.route)
            .with("duration_ms", self.elapsed_ms());

        if let Some(query) = &self.query {
            context.insert("query", Value::Object(parse_query(query)));
        }
        if let Some(user_agent) = &self.user_agent {
            context.insert("user_agent", user_agent);
        }
        if let Some(client_ip) = &self.client_ip {
            context.insert("client_ip", client_ip);
        }
        if let Some(user_id) = self.user_id() {
            context.insert("user_id", user_id);
        }
        context
    }
}

/// The request being served by the current task, if any.
pub fn current_request() -> Option<Arc<RequestContext>> {
    REQUEST_SCOPE.try_with(Arc::clone).ok()
}

pub fn current_request_id() -> Option<String> {
    REQUEST_SCOPE
        .try_with(|context| context.request_id.clone())
        .ok()
}

/// Attach the authenticated user to the current request and its span.
pub fn set_current_user(user_id: &str) -> bool {
    let Some(context) = current_request() else {
        return false;
    };

    let cx = Context::current();
    if cx.has_active_span() {
        cx.span()
            .set_attribute(KeyValue::new("enduser.id", user_id.to_string()));
    }
    context.set_user_id(user_id)
}

/// What the routing layer knows about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Pattern matched by the router.
    pub route: Option<String>,
    /// Pattern supplied explicitly when the router could not match one.
    pub route_hint: Option<String>,
    /// Inbound `x-request-id`, if any.
    pub request_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    /// Remote parent extracted from trace-context headers.
    pub parent: Option<Context>,
}

impl RequestMeta {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Route label for metrics and span names: matched pattern, then hint, then literal path.
pub fn resolve_route(meta: &RequestMeta) -> String {
    if let Some(route) = meta.route.as_ref().or(meta.route_hint.as_ref()) {
        return route.clone();
    }

    debug!(
        path = %meta.path,
        "No route pattern for request, labelling metrics with the literal path"
    );
    meta.path.clone()
}

fn resolve_request_id(inbound: Option<&str>) -> String {
    match inbound {
        Some(id) if is_valid_request_id(id) => id.to_string(),
        _ => generate_request_id(),
    }
}

/// Message of a classified error; lists are exposed joined with `", "`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorMessage {
    Single(String),
    List(Vec<String>),
}

impl ErrorMessage {
    pub fn joined(&self) -> String {
        match self {
            ErrorMessage::Single(message) => message.clone(),
            ErrorMessage::List(messages) => messages.join(", "),
        }
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

impl From<&str> for ErrorMessage {
    fn from(message: &str) -> Self {
        ErrorMessage::Single(message.to_string())
    }
}

impl From<String> for ErrorMessage {
    fn from(message: String) -> Self {
        ErrorMessage::Single(message)
    }
}

impl From<Vec<String>> for ErrorMessage {
    fn from(messages: Vec<String>) -> Self {
        ErrorMessage::List(messages)
    }
}

/// How a request failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// An error that carries its own status and public message.
    Classified {
        status: u16,
        message: ErrorMessage,
        name: String,
    },
    /// Anything else. Exposed as a generic 500; the detail only reaches logs and reports.
    Unclassified(ErrorDetail),
}

impl Failure {
    pub fn status(&self) -> u16 {
        match self {
            Failure::Classified { status, .. } => *status,
            Failure::Unclassified(_) => 500,
        }
    }

    pub fn exposed_message(&self) -> String {
        match self {
            Failure::Classified { message, .. } => message.joined(),
            Failure::Unclassified(_) => INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Failure::Classified { name, .. } => name,
            Failure::Unclassified(detail) => &detail.name,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        match self {
            Failure::Classified { message, name, .. } => ErrorDetail::new(name.clone(), message.joined()),
            Failure::Unclassified(detail) => detail.clone(),
        }
    }
}

/// Normalized error body returned for every failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub status_code: u16,
    pub message: String,
    pub error: String,
    pub timestamp: String,
    pub path: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Opens request scopes. Cheap to clone.
#[derive(Clone)]
pub struct RequestInterceptor {
    logger: StructuredLogger,
    metrics: Arc<Metrics>,
    reporter: Arc<ErrorReporter>,
}

impl fmt::Debug for RequestInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestInterceptor")
            .field("logger", &self.logger)
            .field("reporter", &self.reporter)
            .finish_non_exhaustive()
    }
}

impl RequestInterceptor {
    pub fn new(logger: StructuredLogger, metrics: Arc<Metrics>, reporter: Arc<ErrorReporter>) -> Self {
        Self {
            logger,
            metrics,
            reporter,
        }
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Start tracking a request: resolve its id and route, open the server
    /// span and count it as in flight.
    pub fn enter(&self, meta: RequestMeta) -> ActiveRequest {
        let request_id = resolve_request_id(meta.request_id.as_deref());
        let route = resolve_route(&meta);

        let mut attributes = vec![
            KeyValue::new("http.request.method", meta.method.clone()),
            KeyValue::new("http.route", route.clone()),
            KeyValue::new("url.path", meta.path.clone()),
            KeyValue::new("request.id", request_id.clone()),
        ];
        if let Some(query) = &meta.query {
            attributes.push(KeyValue::new("url.query", redact_query(query)));
        }
        if let Some(user_agent) = &meta.user_agent {
            attributes.push(KeyValue::new("user_agent.original", user_agent.clone()));
        }
        if let Some(client_ip) = &meta.client_ip {
            attributes.push(KeyValue::new("client.address", client_ip.clone()));
        }

        let parent = meta.parent.clone().unwrap_or_else(active_context);
        let otel_context = start_server_span(format!("{} {}", meta.method, route), &parent, attributes);

        let (trace_id, span_id) = {
            let span = otel_context.span();
            let span_context = span.span_context();
            if span_context.is_valid() {
                (
                    Some(span_context.trace_id().to_string()),
                    Some(span_context.span_id().to_string()),
                )
            } else {
                (None, None)
            }
        };

        let in_flight = self.metrics.track_active_request(&meta.method);

        let context = Arc::new(RequestContext {
            request_id,
            trace_id,
            span_id,
            method: meta.method,
            route,
            path: meta.path,
            query: meta.query,
            client_ip: meta.client_ip,
            user_agent: meta.user_agent,
            started_at: Utc::now(),
            started: Instant::now(),
            status: OnceLock::new(),
            user_id: OnceLock::new(),
        });

        ActiveRequest {
            interceptor: self.clone(),
            context,
            otel_context,
            in_flight: Some(in_flight),
            finished: false,
        }
    }
}

/// A request between [`RequestInterceptor::enter`] and its exit.
///
/// Exit happens exactly once: through [`succeed`](Self::succeed), through
/// [`fail`](Self::fail), or on drop when the request is abandoned.
pub struct ActiveRequest {
    interceptor: RequestInterceptor,
    context: Arc<RequestContext>,
    otel_context: Context,
    in_flight: Option<InFlightGuard>,
    finished: bool,
}

impl fmt::Debug for ActiveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveRequest")
            .field("context", &self.context)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ActiveRequest {
    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    pub fn request_id(&self) -> &str {
        &self.context.request_id
    }

    pub fn otel_context(&self) -> &Context {
        &self.otel_context
    }

    /// Run `future` with this request as the ambient request scope and its
    /// server span as the active span.
    pub fn scope<F>(&self, future: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        REQUEST_SCOPE.scope(
            self.context.clone(),
            future.with_context(self.otel_context.clone()),
        )
    }

    fn complete(&mut self, status: u16) -> f64 {
        self.finished = true;
        let _ = self.context.status.set(status);
        if let Some(guard) = self.in_flight.take() {
            guard.finish();
        }

        let duration_ms = self.context.elapsed_ms();
        let context = &self.context;
        self.interceptor
            .metrics
            .record_http_request(&context.method, &context.route, status, duration_ms);
        record_server_duration(&context.method, &context.route, status, duration_ms / 1000.0);

        self.otel_context
            .span()
            .set_attribute(KeyValue::new("http.response.status_code", i64::from(status)));

        duration_ms
    }

    /// Finish a request whose handler produced a response.
    pub fn succeed(mut self, status: u16) {
        let _attached = self.otel_context.clone().attach();
        self.complete(status);

        let context = &self.context;
        self.interceptor.logger.log_request(
            &context.method,
            &context.path,
            status,
            context.log_context(),
        );

        let span = self.otel_context.span();
        if status >= 400 {
            span.set_status(Status::error(format!("HTTP {}", status)));
        } else {
            span.set_status(Status::Ok);
        }
        span.end();
    }

    /// Finish a failed request and build the error body to send back.
    pub fn fail(mut self, failure: &Failure) -> ErrorEnvelope {
        let _attached = self.otel_context.clone().attach();
        let status = failure.status();
        self.complete(status);

        let context = &self.context;
        let interceptor = &self.interceptor;
        let detail = failure.detail();

        interceptor
            .metrics
            .record_error(failure.name(), Some(&context.route));

        let log_context = context
            .log_context()
            .with("method", &context.method)
            .with("path", &context.path)
            .with("status_code", status);
        interceptor.logger.log_exception(&detail, Some(log_context));

        if status >= 500 {
            interceptor
                .reporter
                .capture_exception(&detail, &report_context(context, status));
        }

        record_exception_on(&self.otel_context, &detail);
        self.otel_context.span().end();

        ErrorEnvelope {
            status_code: status,
            message: failure.exposed_message(),
            error: failure.name().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            path: context.path.clone(),
            request_id: context.request_id.clone(),
            trace_id: context.trace_id.clone(),
        }
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let span = self.otel_context.span();
        span.set_status(Status::error("request cancelled"));
        span.end();

        debug!(
            request_id = %self.context.request_id,
            route = %self.context.route,
            "Request dropped before completion"
        );
    }
}

fn report_context(context: &RequestContext, status: u16) -> ReportContext {
    let mut extra = Map::new();
    extra.insert("method".to_string(), Value::String(context.method.clone()));
    extra.insert("path".to_string(), Value::String(context.path.clone()));
    if let Some(query) = &context.query {
        let mut parsed = parse_query(query);
        redact_map(&mut parsed);
        extra.insert("query".to_string(), Value::Object(parsed));
    }

    let mut headers = BTreeMap::new();
    if let Some(user_agent) = &context.user_agent {
        headers.insert("user-agent".to_string(), user_agent.clone());
    }

    ReportContext {
        user_id: context.user_id().map(str::to_string),
        request_id: Some(context.request_id.clone()),
        trace_id: context.trace_id.clone(),
        tags: BTreeMap::from([
            ("status_code".to_string(), status.to_string()),
            ("route".to_string(), context.route.clone()),
        ]),
        extra,
        request: Some(ReportRequest {
            method: Some(context.method.clone()),
            query_string: context.query.as_deref().map(redact_query),
            headers,
            ..Default::default()
        }),
    }
}
