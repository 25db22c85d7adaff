//! Naming and identity conventions shared by logs, metrics and traces.
//!
//! Everything in here is either a constant or a pure function, apart from the
//! [`service_identity`] snapshot which is read from the environment once.

use once_cell::sync::OnceCell;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Header used to propagate and echo the request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest inbound request id that is accepted as-is.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Metric names, following Prometheus naming conventions.
pub mod metric_names {
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "http_requests_in_flight";
    pub const APP_ERRORS_TOTAL: &str = "app_errors_total";
    pub const APP_INFO: &str = "app_info";
}

/// Label keys used across all metrics.
pub mod labels {
    pub const SERVICE: &str = "service";
    pub const ENVIRONMENT: &str = "env";
    pub const VERSION: &str = "version";
    pub const RELEASE: &str = "release";
    pub const METHOD: &str = "method";
    pub const ROUTE: &str = "route";
    pub const STATUS: &str = "status";
    pub const STATUS_CODE: &str = "status_code";
    pub const ERROR_TYPE: &str = "error_type";
}

/// Histogram buckets (seconds) for request latency: 5ms up to 10s.
pub const HTTP_DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Coarse HTTP status bucket used as the `status` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Success,
    Redirection,
    ClientError,
    ServerError,
    Unknown,
}

impl StatusClass {
    pub fn from_code(code: i64) -> Self {
        match code {
            200..=299 => StatusClass::Success,
            300..=399 => StatusClass::Redirection,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusClass::Success => "2xx",
            StatusClass::Redirection => "3xx",
            StatusClass::ClientError => "4xx",
            StatusClass::ServerError => "5xx",
            StatusClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an HTTP status code onto its metric bucket.
pub fn classify_status(code: i64) -> StatusClass {
    StatusClass::from_code(code)
}

/// Generate a request id of the form `req_<millis base36>_<random base36>`.
///
/// The random part carries 62 bits of entropy, so ids minted within the same
/// millisecond do not collide in practice. Output is plain ASCII and safe to
/// place in a header.
pub fn generate_request_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let random = Uuid::new_v4().as_u128() as u64;
    format!("req_{}_{}", to_base36(millis), to_base36(random))
}

/// Whether an inbound request id can be propagated unchanged.
pub fn is_valid_request_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic())
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut buf = Vec::with_capacity(13);
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

const SERVICE_NAME_KEYS: [&str; 3] = ["SERVICE_NAME", "OTEL_SERVICE_NAME", "CARGO_PKG_NAME"];
const ENVIRONMENT_KEYS: [&str; 2] = ["APP_ENV", "ENVIRONMENT"];
const VERSION_KEYS: [&str; 2] = ["APP_VERSION", "CARGO_PKG_VERSION"];
const RELEASE_KEYS: [&str; 2] = ["GIT_COMMIT_SHA", "SOURCE_VERSION"];
const REGION_KEYS: [&str; 2] = ["REGION", "AWS_REGION"];

/// Process-wide identity attached to every metric, log record and span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceIdentity {
    pub service_name: String,
    pub environment: String,
    pub version: String,
    pub release: Option<String>,
    pub region: Option<String>,
}

impl ServiceIdentity {
    /// Resolve the identity through an arbitrary key lookup.
    pub fn resolve_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(key))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };

        Self {
            service_name: first(&SERVICE_NAME_KEYS).unwrap_or_else(|| "unknown".to_string()),
            environment: first(&ENVIRONMENT_KEYS).unwrap_or_else(|| "development".to_string()),
            version: first(&VERSION_KEYS).unwrap_or_else(|| "0.0.0".to_string()),
            release: first(&RELEASE_KEYS),
            region: first(&REGION_KEYS),
        }
    }

    pub fn from_env() -> Self {
        Self::resolve_with(|key| std::env::var(key).ok())
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Release label value, `"unknown"` when no commit id is available.
    pub fn release_or_unknown(&self) -> &str {
        self.release.as_deref().unwrap_or("unknown")
    }
}

static SERVICE_IDENTITY: OnceCell<ServiceIdentity> = OnceCell::new();

/// The identity snapshot taken from the environment on first access.
pub fn service_identity() -> &'static ServiceIdentity {
    SERVICE_IDENTITY.get_or_init(ServiceIdentity::from_env)
}
