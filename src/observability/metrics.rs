use once_cell::sync::OnceCell;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use thiserror::Error;
use tracing::{info, warn};

use super::tags::{
    classify_status, labels, metric_names, service_identity, ServiceIdentity,
    HTTP_DURATION_BUCKETS,
};

/// Content type of the text exposition served on `/metrics`.
pub const METRICS_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("Failed to encode metrics: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone)]
pub struct MetricsOptions {
    pub identity: ServiceIdentity,
    /// Register the process collector (CPU, memory, fds). Linux only.
    pub collect_process_metrics: bool,
    /// Extra constant labels on every series; they win over `service` and `env`.
    pub default_labels: BTreeMap<String, String>,
    /// Namespace prepended to every metric name as `{prefix}_`.
    pub prefix: Option<String>,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            identity: service_identity().clone(),
            collect_process_metrics: true,
            default_labels: BTreeMap::new(),
            prefix: None,
        }
    }
}

/// HTTP traffic and error metrics on a registry carrying `service` and `env`
/// on every series.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub http_requests_total: CounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_requests_in_flight: GaugeVec,
    pub app_errors_total: CounterVec,
    pub app_info: GaugeVec,
}

impl Metrics {
    /// Build a fresh, independent registry. Most callers want [`init_metrics`].
    pub fn new(options: MetricsOptions) -> Result<Self, MetricsError> {
        let identity = &options.identity;

        let mut default_labels = HashMap::from([
            (labels::SERVICE.to_string(), identity.service_name.clone()),
            (labels::ENVIRONMENT.to_string(), identity.environment.clone()),
        ]);
        default_labels.extend(options.default_labels.clone());

        let prefix = options
            .prefix
            .clone()
            .filter(|prefix| !prefix.is_empty());
        let registry = Registry::new_custom(prefix, Some(default_labels))?;

        let http_requests_total = CounterVec::new(
            Opts::new(
                metric_names::HTTP_REQUESTS_TOTAL,
                "Total number of HTTP requests",
            ),
            &[labels::METHOD, labels::ROUTE, labels::STATUS_CODE, labels::STATUS],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                metric_names::HTTP_REQUEST_DURATION_SECONDS,
                "HTTP request duration in seconds",
            )
            .buckets(HTTP_DURATION_BUCKETS.to_vec()),
            &[labels::METHOD, labels::ROUTE, labels::STATUS_CODE],
        )?;

        let http_requests_in_flight = GaugeVec::new(
            Opts::new(
                metric_names::HTTP_REQUESTS_IN_FLIGHT,
                "Number of HTTP requests currently being processed",
            ),
            &[labels::METHOD],
        )?;

        let app_errors_total = CounterVec::new(
            Opts::new(metric_names::APP_ERRORS_TOTAL, "Total number of application errors"),
            &[labels::ERROR_TYPE, labels::ROUTE],
        )?;

        let app_info = GaugeVec::new(
            Opts::new(metric_names::APP_INFO, "Application build information"),
            &[labels::VERSION, labels::RELEASE],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(http_requests_in_flight.clone()))?;
        registry.register(Box::new(app_errors_total.clone()))?;
        registry.register(Box::new(app_info.clone()))?;

        app_info
            .with_label_values(&[identity.version.as_str(), identity.release_or_unknown()])
            .set(1.0);

        if options.collect_process_metrics {
            register_process_collector(&registry);
        }

        info!(
            service = %identity.service_name,
            environment = %identity.environment,
            "Prometheus metrics initialized"
        );

        Ok(Metrics {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            http_requests_in_flight,
            app_errors_total,
            app_info,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;

        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    /// Count a finished request and observe its latency.
    pub fn record_http_request(&self, method: &str, route: &str, status_code: u16, duration_ms: f64) {
        let status_code_str = status_code.to_string();
        let status = classify_status(i64::from(status_code));

        self.http_requests_total
            .with_label_values(&[method, route, &status_code_str, status.as_str()])
            .inc();

        self.http_request_duration_seconds
            .with_label_values(&[method, route, &status_code_str])
            .observe(duration_ms / 1000.0);
    }

    /// Increment the in-flight gauge; the returned guard decrements it exactly once.
    pub fn track_active_request(&self, method: &str) -> InFlightGuard {
        let gauge = self.http_requests_in_flight.with_label_values(&[method]);
        gauge.inc();
        InFlightGuard {
            gauge,
            completed: false,
        }
    }

    pub fn record_error(&self, error_type: &str, route: Option<&str>) {
        self.app_errors_total
            .with_label_values(&[error_type, route.unwrap_or("unknown")])
            .inc();
    }

    /// Register a custom counter on the shared registry.
    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<CounterVec, MetricsError> {
        let counter = CounterVec::new(Opts::new(name, help), label_names)?;
        self.registry.register(Box::new(counter.clone()))?;
        Ok(counter)
    }

    /// Register a custom histogram; `buckets` defaults to the HTTP latency buckets.
    pub fn register_histogram(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: Option<Vec<f64>>,
    ) -> Result<HistogramVec, MetricsError> {
        let buckets = buckets.unwrap_or_else(|| HTTP_DURATION_BUCKETS.to_vec());
        let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), label_names)?;
        self.registry.register(Box::new(histogram.clone()))?;
        Ok(histogram)
    }

    pub fn register_gauge(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<GaugeVec, MetricsError> {
        let gauge = GaugeVec::new(Opts::new(name, help), label_names)?;
        self.registry.register(Box::new(gauge.clone()))?;
        Ok(gauge)
    }
}

#[cfg(target_os = "linux")]
fn register_process_collector(registry: &Registry) {
    let collector = prometheus::process_collector::ProcessCollector::for_self();
    if let Err(e) = registry.register(Box::new(collector)) {
        warn!(error = %e, "Process metrics unavailable");
    }
}

#[cfg(not(target_os = "linux"))]
fn register_process_collector(_registry: &Registry) {}

/// Keeps one request counted in `http_requests_in_flight` until finished or dropped.
#[must_use = "dropping the guard immediately ends the in-flight request"]
pub struct InFlightGuard {
    gauge: Gauge,
    completed: bool,
}

impl InFlightGuard {
    pub fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if !self.completed {
            self.completed = true;
            self.gauge.dec();
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.complete();
    }
}

static METRICS: OnceCell<Arc<Metrics>> = OnceCell::new();

/// Create the process-wide metrics. A second call warns and returns the first instance.
pub fn init_metrics(options: MetricsOptions) -> Result<Arc<Metrics>, MetricsError> {
    if let Some(existing) = METRICS.get() {
        warn!("Metrics already initialized, returning existing instance");
        return Ok(existing.clone());
    }

    METRICS
        .get_or_try_init(|| Metrics::new(options).map(Arc::new))
        .cloned()
}

/// The process-wide metrics, created with defaults on first use.
pub fn metrics() -> Result<Arc<Metrics>, MetricsError> {
    METRICS
        .get_or_try_init(|| Metrics::new(MetricsOptions::default()).map(Arc::new))
        .cloned()
}
