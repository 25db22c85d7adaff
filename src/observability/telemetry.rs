use axum::http::{HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::OnceCell;
use opentelemetry::{
    global,
    metrics::{Histogram, Unit},
    propagation::{Extractor, Injector},
    trace::{
        FutureExt, Span as _, SpanKind, Status, TraceContextExt, TraceId, Tracer as _,
        TracerProvider as _,
    },
    Context, KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::MeterProvider as SdkMeterProvider,
    propagation::TraceContextPropagator,
    runtime,
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{info, warn};
use tracing_opentelemetry::{OpenTelemetryLayer, OpenTelemetrySpanExt};
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use super::interceptor::current_request_id;
use super::logger::ErrorDetail;
use super::tags::{service_identity, ServiceIdentity, REQUEST_ID_HEADER};

/// Instrumentation scope name for every span and instrument this crate creates.
pub const TRACER_NAME: &str = "practice-observability";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Failed to initialize OpenTelemetry: {0}")]
    OpenTelemetryInit(#[from] opentelemetry::trace::TraceError),
    #[error("Failed to initialize metrics pipeline: {0}")]
    MetricsPipeline(#[from] opentelemetry::metrics::MetricsError),
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Groups of `tracing` targets whose spans are bridged into OpenTelemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instrumentation {
    HttpServer,
    HttpClient,
    Framework,
    Dns,
    Fs,
}

impl Instrumentation {
    pub fn targets(&self) -> &'static [&'static str] {
        match self {
            Instrumentation::HttpServer => &["hyper::server", "hyper::proto"],
            Instrumentation::HttpClient => &["reqwest", "hyper::client", "hyper_util::client"],
            Instrumentation::Framework => &["axum", "tower_http", "tower"],
            Instrumentation::Dns => &[
                "hyper::client::connect::dns",
                "hyper_util::client::legacy::connect::dns",
                "trust_dns_resolver",
                "hickory_resolver",
            ],
            Instrumentation::Fs => &["tokio::fs", "std::fs"],
        }
    }

    /// DNS and filesystem spans are noise for request tracing.
    pub fn disabled_by_default() -> Vec<Instrumentation> {
        vec![Instrumentation::Dns, Instrumentation::Fs]
    }
}

/// Options for [`init_telemetry`].
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Overrides the resolved service name.
    pub service_name: Option<String>,
    /// OTLP gRPC endpoint for spans. `None` keeps spans in-process.
    pub traces_endpoint: Option<String>,
    /// OTLP gRPC endpoint for metrics. `None` disables the periodic reader.
    pub metrics_endpoint: Option<String>,
    pub metrics_interval: Duration,
    pub traces_sample_rate: f64,
    /// Extra resource attributes, merged over the identity attributes.
    pub attributes: BTreeMap<String, String>,
    pub disabled_instrumentations: Vec<Instrumentation>,
    pub log_level: String,
    pub pretty_logs: bool,
    /// Turns on OpenTelemetry SDK diagnostics in the log output.
    pub debug: bool,
    /// Record log events as crash-report breadcrumbs.
    pub breadcrumbs: bool,
    pub install_subscriber: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            traces_endpoint: None,
            metrics_endpoint: None,
            metrics_interval: Duration::from_millis(60_000),
            traces_sample_rate: 1.0,
            attributes: BTreeMap::new(),
            disabled_instrumentations: Instrumentation::disabled_by_default(),
            log_level: "info".to_string(),
            pretty_logs: false,
            debug: false,
            breadcrumbs: true,
            install_subscriber: true,
        }
    }
}

/// Handle to the installed pipeline, returned by every [`init_telemetry`] call.
pub struct TelemetryHandle {
    service_name: String,
    resource: Resource,
    traces_exported: bool,
    meter_provider: Option<SdkMeterProvider>,
    shut_down: AtomicBool,
}

impl fmt::Debug for TelemetryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryHandle")
            .field("service_name", &self.service_name)
            .field("traces_exported", &self.traces_exported)
            .field("metrics_exported", &self.meter_provider.is_some())
            .finish()
    }
}

impl TelemetryHandle {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn exports_traces(&self) -> bool {
        self.traces_exported
    }

    pub fn exports_metrics(&self) -> bool {
        self.meter_provider.is_some()
    }

    /// Drain and stop the exporters. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down telemetry");

        let meter_provider = self.meter_provider.clone();

        // Provider shutdown blocks until pending batches are exported
        let shutdown_task = tokio::task::spawn_blocking(move || {
            if let Some(provider) = meter_provider {
                if let Err(e) = provider.shutdown() {
                    warn!(error = %e, "Error shutting down meter provider");
                }
            }
            global::shutdown_tracer_provider();
        });

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown_task).await {
            Ok(Ok(())) => {
                info!("Telemetry shutdown completed successfully");
            }
            Ok(Err(e)) => {
                warn!("Error during telemetry shutdown: {}", e);
            }
            Err(_) => {
                warn!(
                    "Telemetry shutdown timed out after {} seconds - forcing exit",
                    SHUTDOWN_TIMEOUT.as_secs()
                );
            }
        }
    }
}

static TELEMETRY: OnceCell<Arc<TelemetryHandle>> = OnceCell::new();

/// Install tracing, metrics export and the log subscriber for this process.
///
/// Must run before any instrumented code. A second call logs a warning and
/// returns the handle from the first call unchanged. Exporter failures degrade
/// to a warning; they never fail startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Arc<TelemetryHandle> {
    if let Some(existing) = TELEMETRY.get() {
        warn!("Telemetry already initialized, returning existing instance");
        return existing.clone();
    }

    TELEMETRY
        .get_or_init(|| Arc::new(install(config, service_identity())))
        .clone()
}

/// The handle installed by [`init_telemetry`], if any.
pub fn telemetry_handle() -> Option<Arc<TelemetryHandle>> {
    TELEMETRY.get().cloned()
}

/// Shut down the process-wide pipeline, if one was installed.
pub async fn shutdown_telemetry() {
    if let Some(handle) = telemetry_handle() {
        handle.shutdown().await;
    }
}

fn install(config: &TelemetryConfig, identity: &ServiceIdentity) -> TelemetryHandle {
    let service_name = config
        .service_name
        .clone()
        .unwrap_or_else(|| identity.service_name.clone());

    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = build_resource(&service_name, identity, &config.attributes);

    let (tracer, traces_exported) = match config.traces_endpoint.as_deref() {
        Some(endpoint) => match init_exporting_tracer(endpoint, config, resource.clone()) {
            Ok(tracer) => (tracer, true),
            Err(e) => {
                warn!(error = %e, "Trace exporter unavailable, spans will not be exported");
                (init_local_tracer(config, resource.clone()), false)
            }
        },
        None => (init_local_tracer(config, resource.clone()), false),
    };

    let meter_provider = config.metrics_endpoint.as_deref().and_then(|endpoint| {
        match init_meter_provider(endpoint, config.metrics_interval, resource.clone()) {
            Ok(provider) => Some(provider),
            Err(e) => {
                warn!(error = %e, "Metrics exporter unavailable, OTLP metrics disabled");
                None
            }
        }
    });

    if config.install_subscriber {
        if let Err(e) = install_subscriber(config, tracer) {
            warn!(error = %e, "Tracing subscriber not installed");
        }
    }

    info!(
        service = %service_name,
        environment = %identity.environment,
        traces_exported,
        metrics_exported = meter_provider.is_some(),
        "Telemetry initialized"
    );

    TelemetryHandle {
        service_name,
        resource,
        traces_exported,
        meter_provider,
        shut_down: AtomicBool::new(false),
    }
}

fn build_resource(
    service_name: &str,
    identity: &ServiceIdentity,
    extra: &BTreeMap<String, String>,
) -> Resource {
    let mut attributes = vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", identity.version.clone()),
        KeyValue::new("deployment.environment", identity.environment.clone()),
        KeyValue::new("telemetry.sdk.name", "opentelemetry"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ];

    if let Some(release) = &identity.release {
        attributes.push(KeyValue::new("service.release", release.clone()));
    }
    if let Some(region) = &identity.region {
        attributes.push(KeyValue::new("cloud.region", region.clone()));
    }

    let base = Resource::new(attributes);
    let extra = Resource::new(
        extra
            .iter()
            .map(|(key, value)| KeyValue::new(key.clone(), value.clone())),
    );

    // Attributes from `extra` win on key conflicts
    base.merge(&extra)
}

fn trace_config(config: &TelemetryConfig, resource: Resource) -> trace::Config {
    let ratio = config.traces_sample_rate.clamp(0.0, 1.0);

    trace::config()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            ratio,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_max_events_per_span(64)
        .with_max_attributes_per_span(32)
        .with_resource(resource)
}

fn init_exporting_tracer(
    endpoint: &str,
    config: &TelemetryConfig,
    resource: Resource,
) -> Result<opentelemetry_sdk::trace::Tracer, ObservabilityError> {
    info!("Using OTLP trace endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(trace_config(config, resource))
        .with_batch_config(
            trace::BatchConfig::default()
                .with_max_queue_size(2048)
                .with_max_export_batch_size(512)
                .with_max_export_timeout(Duration::from_secs(30))
                .with_scheduled_delay(Duration::from_millis(500)),
        )
        .install_batch(runtime::Tokio)?;

    Ok(tracer)
}

/// Spans are created and sampled but never leave the process.
fn init_local_tracer(
    config: &TelemetryConfig,
    resource: Resource,
) -> opentelemetry_sdk::trace::Tracer {
    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_config(trace_config(config, resource))
        .build();
    let tracer = provider.tracer(TRACER_NAME);
    let _ = global::set_tracer_provider(provider);
    tracer
}

fn init_meter_provider(
    endpoint: &str,
    interval: Duration,
    resource: Resource,
) -> Result<SdkMeterProvider, ObservabilityError> {
    info!("Using OTLP metrics endpoint: {}", endpoint);

    let provider = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_period(interval)
        .with_resource(resource)
        .build()?;

    global::set_meter_provider(provider.clone());
    Ok(provider)
}

fn default_directives(config: &TelemetryConfig) -> String {
    let mut directives = format!("{},h2=off,tonic=off", config.log_level);
    if config.debug {
        directives.push_str(",opentelemetry=debug,opentelemetry_sdk=debug");
    }
    directives
}

fn instrumentation_filter(disabled: &[Instrumentation]) -> Targets {
    disabled
        .iter()
        .flat_map(|instrumentation| instrumentation.targets().iter())
        .fold(
            Targets::new().with_default(LevelFilter::TRACE),
            |targets, target| targets.with_target(*target, LevelFilter::OFF),
        )
}

fn breadcrumb_filter(metadata: &tracing::Metadata<'_>) -> sentry::integrations::tracing::EventFilter {
    use sentry::integrations::tracing::EventFilter;

    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN | tracing::Level::INFO => {
            EventFilter::Breadcrumb
        }
        _ => EventFilter::Ignore,
    }
}

fn install_subscriber(
    config: &TelemetryConfig,
    tracer: opentelemetry_sdk::trace::Tracer,
) -> Result<(), ObservabilityError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));

    let opentelemetry_layer = OpenTelemetryLayer::new(tracer)
        .with_filter(instrumentation_filter(&config.disabled_instrumentations));

    let breadcrumb_layer = config.breadcrumbs.then(|| {
        sentry::integrations::tracing::layer()
            .event_filter(breadcrumb_filter)
            .span_filter(|_| false)
    });

    let json_layer = (!config.pretty_logs).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
    });

    let pretty_layer = config.pretty_logs.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(false)
            .with_line_number(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(opentelemetry_layer)
        .with(breadcrumb_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| ObservabilityError::TracingInit(e.to_string()))
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

// =============================================================================
// SPAN HELPERS
// =============================================================================

/// Trace and span id of the active span, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

pub fn tracer() -> global::BoxedTracer {
    global::tracer(TRACER_NAME)
}

/// The context holding the active span.
///
/// The OpenTelemetry context attached to the running future (request server
/// spans, [`create_span`]) takes precedence. A `tracing` span bridged into
/// OpenTelemetry is only used when no such context is attached; its span is
/// read-only here, so the span helpers below leave it untouched.
pub fn active_context() -> Context {
    let current = Context::current();
    if current.has_active_span() {
        return current;
    }

    let bridged = tracing::Span::current().context();
    if bridged.span().span_context().is_valid() {
        bridged
    } else {
        current
    }
}

/// Trace context of the active span, `None` when there is no real trace.
pub fn get_trace_context() -> Option<TraceContext> {
    let cx = active_context();
    let span = cx.span();
    let span_context = span.span_context();

    if !span_context.is_valid() || span_context.trace_id() == TraceId::INVALID {
        return None;
    }

    Some(TraceContext {
        trace_id: span_context.trace_id().to_string(),
        span_id: span_context.span_id().to_string(),
    })
}

/// Run `future` inside a new child span of the active context.
///
/// The span is marked OK on `Ok`, marked ERROR with an exception event on
/// `Err`, and ended exactly once either way. The result is returned untouched.
pub async fn create_span<F, T, E>(name: &str, attributes: Vec<KeyValue>, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let tracer = tracer();
    let parent = active_context();

    let mut span = tracer.start_with_context(name.to_string(), &parent);
    for attribute in attributes {
        span.set_attribute(attribute);
    }

    let cx = parent.with_span(span);
    let result = future.with_context(cx.clone()).await;

    let span = cx.span();
    match &result {
        Ok(_) => span.set_status(Status::Ok),
        Err(error) => {
            let message = error.to_string();
            span.add_event(
                "exception",
                vec![
                    KeyValue::new("exception.type", std::any::type_name::<E>()),
                    KeyValue::new("exception.message", message.clone()),
                ],
            );
            span.set_status(Status::error(message));
        }
    }
    span.end();

    result
}

/// Start a server-kind span for an inbound request.
pub fn start_server_span(name: String, parent: &Context, attributes: Vec<KeyValue>) -> Context {
    let tracer = tracer();
    let span = tracer
        .span_builder(name)
        .with_kind(SpanKind::Server)
        .with_attributes(attributes)
        .start_with_context(&tracer, parent);

    parent.with_span(span)
}

/// Set attributes on the span [`get_trace_context`] reports; no-op when none is active.
pub fn add_span_attributes(attributes: impl IntoIterator<Item = KeyValue>) {
    let cx = active_context();
    if !cx.has_active_span() {
        return;
    }

    let span = cx.span();
    for attribute in attributes {
        span.set_attribute(attribute);
    }
}

/// Record an exception on the span [`get_trace_context`] reports and mark it
/// ERROR; no-op when none is active.
pub fn record_span_exception(error: &ErrorDetail) {
    let cx = active_context();
    if !cx.has_active_span() {
        return;
    }
    record_exception_on(&cx, error);
}

pub(crate) fn record_exception_on(cx: &Context, error: &ErrorDetail) {
    let span = cx.span();

    let mut attributes = vec![
        KeyValue::new("exception.type", error.name.clone()),
        KeyValue::new("exception.message", error.message.clone()),
    ];
    if let Some(stack) = &error.stack {
        attributes.push(KeyValue::new("exception.stacktrace", stack.clone()));
    }

    span.add_event("exception", attributes);
    span.set_status(Status::error(error.message.clone()));
}

/// Copy an inbound request id onto the span before the handler runs.
pub fn request_hook(cx: &Context, headers: &HeaderMap) {
    if let Some(request_id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        cx.span()
            .set_attribute(KeyValue::new("http.request_id", request_id.to_string()));
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|key| key.as_str()).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            self.0.insert(name, value);
        }
    }
}

/// Parent context carried by inbound W3C trace-context headers.
pub fn extract_remote_context(headers: &HeaderMap) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Add trace-context and request-id headers to an outbound request.
pub fn inject_trace_headers(headers: &mut HeaderMap) {
    let cx = active_context();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut HeaderInjector(headers))
    });

    if let Some(request_id) = current_request_id() {
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
    }
}

static SERVER_DURATION: OnceCell<Histogram<f64>> = OnceCell::new();

/// Record request latency on the OTLP meter (no-op without a meter provider).
pub fn record_server_duration(method: &str, route: &str, status_code: u16, seconds: f64) {
    let histogram = SERVER_DURATION.get_or_init(|| {
        global::meter(TRACER_NAME)
            .f64_histogram("http.server.request.duration")
            .with_description("Duration of inbound HTTP requests")
            .with_unit(Unit::new("s"))
            .init()
    });

    histogram.record(
        seconds,
        &[
            KeyValue::new("http.request.method", method.to_string()),
            KeyValue::new("http.route", route.to_string()),
            KeyValue::new("http.response.status_code", i64::from(status_code)),
        ],
    );
}

#[cfg(test)]
pub(crate) mod test_support {
    use once_cell::sync::OnceCell;
    use opentelemetry::{
        global,
        trace::{TraceResult, TracerProvider as _},
        Context,
    };
    use opentelemetry_sdk::{
        export::trace::SpanData,
        trace::{Span, SpanProcessor, Tracer, TracerProvider},
    };
    use std::sync::{Arc, Mutex};

    /// Keeps every finished span in memory.
    #[derive(Debug, Default, Clone)]
    pub(crate) struct RecordingProcessor {
        spans: Arc<Mutex<Vec<SpanData>>>,
    }

    impl RecordingProcessor {
        pub(crate) fn finished(&self, name: &str) -> Vec<SpanData> {
            self.spans
                .lock()
                .unwrap()
                .iter()
                .filter(|span| span.name == name)
                .cloned()
                .collect()
        }
    }

    impl SpanProcessor for RecordingProcessor {
        fn on_start(&self, _span: &mut Span, _cx: &Context) {}

        fn on_end(&self, span: SpanData) {
            self.spans.lock().unwrap().push(span);
        }

        fn force_flush(&self) -> TraceResult<()> {
            Ok(())
        }

        fn shutdown(&mut self) -> TraceResult<()> {
            Ok(())
        }
    }

    static RECORDER: OnceCell<(RecordingProcessor, TracerProvider)> = OnceCell::new();

    fn install() -> &'static (RecordingProcessor, TracerProvider) {
        RECORDER.get_or_init(|| {
            let processor = RecordingProcessor::default();
            let provider = TracerProvider::builder()
                .with_span_processor(processor.clone())
                .build();
            let _ = global::set_tracer_provider(provider.clone());
            (processor, provider)
        })
    }

    /// Install a recording tracer provider as the global one, once per test binary.
    pub(crate) fn recorder() -> &'static RecordingProcessor {
        &install().0
    }

    /// SDK tracer on the recording provider, for bridging `tracing` spans.
    pub(crate) fn recording_tracer() -> Tracer {
        install().1.tracer("practice-observability-test")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{recorder, recording_tracer};
    use super::*;
    use tracing_subscriber::layer::SubscriberExt as _;

    #[test]
    fn test_no_trace_context_outside_spans() {
        assert!(get_trace_context().is_none());
    }

    #[test]
    fn test_span_helpers_are_noops_without_active_span() {
        add_span_attributes([KeyValue::new("ignored", true)]);
        record_span_exception(&ErrorDetail::new("Error", "ignored"));
        assert!(get_trace_context().is_none());
    }

    #[tokio::test]
    async fn test_create_span_exposes_trace_context() {
        let recorder = recorder();

        let inner = create_span("span-exposes-context", vec![], async {
            Ok::<_, String>(get_trace_context())
        })
        .await
        .unwrap();

        let inner = inner.expect("trace context inside span");
        assert_eq!(inner.trace_id.len(), 32);
        assert_eq!(inner.span_id.len(), 16);

        let finished = recorder.finished("span-exposes-context");
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, Status::Ok);
        assert_eq!(finished[0].span_context.span_id().to_string(), inner.span_id);
    }

    #[tokio::test]
    async fn test_nested_spans_share_trace() {
        let recorder = recorder();

        let (outer, inner) = create_span("span-outer", vec![], async {
            let outer = get_trace_context();
            let inner = create_span("span-inner", vec![], async {
                Ok::<_, String>(get_trace_context())
            })
            .await?;
            Ok::<_, String>((outer, inner))
        })
        .await
        .unwrap();

        let outer = outer.unwrap();
        let inner = inner.unwrap();
        assert_eq!(outer.trace_id, inner.trace_id);
        assert_ne!(outer.span_id, inner.span_id);

        let child = &recorder.finished("span-inner")[0];
        assert_eq!(child.parent_span_id.to_string(), outer.span_id);
    }

    #[tokio::test]
    async fn test_create_span_records_error_and_returns_it() {
        let recorder = recorder();

        let result = create_span(
            "span-failing",
            vec![KeyValue::new("job", "import")],
            async { Err::<(), _>("boom".to_string()) },
        )
        .await;

        assert_eq!(result.unwrap_err(), "boom");

        let finished = recorder.finished("span-failing");
        assert_eq!(finished.len(), 1, "span must end exactly once");
        assert!(matches!(finished[0].status, Status::Error { .. }));
        assert!(finished[0]
            .events
            .iter()
            .any(|event| event.name == "exception"));
    }

    #[tokio::test]
    async fn test_record_span_exception_marks_active_span() {
        let recorder = recorder();

        let _ = create_span("span-manual-exception", vec![], async {
            record_span_exception(&ErrorDetail::new("TypeError", "bad input"));
            add_span_attributes([KeyValue::new("user.id", "u-1")]);
            Ok::<_, String>(())
        })
        .await;

        let finished = recorder.finished("span-manual-exception");
        assert_eq!(finished.len(), 1);
        assert!(finished[0]
            .events
            .iter()
            .any(|event| event.name == "exception"));
    }

    #[test]
    fn test_span_helpers_target_the_reported_span() {
        let recorder = recorder();
        let subscriber =
            tracing_subscriber::registry().with(OpenTelemetryLayer::new(recording_tracer()));

        tracing::subscriber::with_default(subscriber, || {
            let cx = start_server_span("GET /helpers-agree".to_string(), &Context::new(), vec![]);
            let attached = cx.clone().attach();

            let handler = tracing::info_span!("helpers_agree_handler");
            let entered = handler.enter();

            let reported = get_trace_context().expect("trace context inside request");
            add_span_attributes([KeyValue::new("helper.marker", "set")]);
            record_span_exception(&ErrorDetail::new("TypeError", "bad input"));

            drop(entered);
            drop(attached);
            cx.span().end();

            let finished = recorder.finished("GET /helpers-agree");
            assert_eq!(finished.len(), 1);
            assert_eq!(finished[0].span_context.span_id().to_string(), reported.span_id);
            assert!(format!("{:?}", finished[0].attributes).contains("helper.marker"));
            assert!(finished[0]
                .events
                .iter()
                .any(|event| event.name == "exception"));
        });
    }

    #[tokio::test]
    async fn test_inject_and_extract_round_trip() {
        recorder();
        global::set_text_map_propagator(TraceContextPropagator::new());

        let injected = create_span("span-propagation", vec![], async {
            let mut headers = HeaderMap::new();
            inject_trace_headers(&mut headers);
            Ok::<_, String>((headers, get_trace_context()))
        })
        .await
        .unwrap();

        let (headers, trace_context) = injected;
        let trace_context = trace_context.unwrap();
        assert!(headers.contains_key("traceparent"));

        let remote = extract_remote_context(&headers);
        assert_eq!(
            remote.span().span_context().trace_id().to_string(),
            trace_context.trace_id
        );
    }

    #[test]
    fn test_instrumentation_filter_disables_noisy_targets() {
        let filter = instrumentation_filter(&Instrumentation::disabled_by_default());

        assert!(!filter.would_enable("tokio::fs", &tracing::Level::ERROR));
        assert!(!filter.would_enable("hickory_resolver", &tracing::Level::INFO));
        assert!(filter.would_enable("axum::routing", &tracing::Level::INFO));
    }

    #[test]
    fn test_resource_merges_extra_attributes() {
        let identity = ServiceIdentity::resolve_with(|key| match key {
            "GIT_COMMIT_SHA" => Some("abc123".to_string()),
            _ => None,
        });
        let extra = BTreeMap::from([("service.namespace".to_string(), "psy".to_string())]);

        let resource = build_resource("api", &identity, &extra);

        assert_eq!(
            resource.get("service.name".into()).map(|v| v.to_string()),
            Some("api".to_string())
        );
        assert_eq!(
            resource.get("service.release".into()).map(|v| v.to_string()),
            Some("abc123".to_string())
        );
        assert_eq!(
            resource.get("service.namespace".into()).map(|v| v.to_string()),
            Some("psy".to_string())
        );
        assert!(resource.get("cloud.region".into()).is_none());
    }

    #[test]
    fn test_default_directives_silence_exporter_noise() {
        let config = TelemetryConfig {
            log_level: "debug".to_string(),
            debug: true,
            ..Default::default()
        };

        let directives = default_directives(&config);
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("tonic=off"));
        assert!(directives.contains("opentelemetry=debug"));
    }
}
