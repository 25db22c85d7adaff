pub mod interceptor;
pub mod logger;
pub mod metrics;
pub mod middleware;
pub mod redact;
pub mod reporter;
pub mod tags;
pub mod telemetry;

pub use interceptor::{
    current_request, current_request_id, set_current_user, ActiveRequest, ErrorEnvelope,
    ErrorMessage, Failure, RequestContext, RequestInterceptor, RequestMeta,
};
pub use logger::{
    init_logger, logger, ErrorDetail, LogContext, LogLevel, LogRecord, LogSink, LoggerOptions,
    MemorySink, StructuredLogger, TracingSink,
};
pub use metrics::{init_metrics, metrics, InFlightGuard, Metrics, MetricsError, MetricsOptions};
pub use middleware::{failure_response, observability_middleware, panic_response, RouteHint};
pub use reporter::{
    error_reporter, init_error_reporter, ErrorReporter, ReportContext, ReporterConfig,
};
pub use tags::{classify_status, generate_request_id, service_identity, ServiceIdentity, StatusClass};
pub use telemetry::{
    add_span_attributes, create_span, get_trace_context, init_telemetry, inject_trace_headers,
    record_span_exception, shutdown_signal, shutdown_telemetry, telemetry_handle,
    ObservabilityError, TelemetryConfig, TelemetryHandle, TraceContext,
};
