//! Crash reporting through Sentry.
//!
//! The reporter never blocks the request path: events are queued on the
//! client's transport and only [`ErrorReporter::flush`] and
//! [`ErrorReporter::close`] wait, bounded by a timeout.

use once_cell::sync::OnceCell;
use sentry::{
    protocol::{Breadcrumb, Event, Exception, Request, User},
    ClientInitGuard, ClientOptions, Hub, Level,
};
use serde_json::{Map, Value};
use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::logger::{ErrorDetail, LogLevel};
use super::redact::{is_sensitive_header, redact_map, redact_query, redact_value};
use super::tags::ServiceIdentity;

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// `None` disables reporting entirely.
    pub dsn: Option<String>,
    pub environment: String,
    pub release: Option<String>,
    pub sample_rate: f32,
    pub traces_sample_rate: f32,
    pub debug: bool,
}

impl ReporterConfig {
    pub fn from_identity(identity: &ServiceIdentity, dsn: Option<String>) -> Self {
        Self {
            dsn,
            environment: identity.environment.clone(),
            release: identity.release.clone(),
            sample_rate: 1.0,
            traces_sample_rate: if identity.is_production() { 0.1 } else { 1.0 },
            debug: false,
        }
    }
}

/// Correlation data attached to a captured exception.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub extra: Map<String, Value>,
    pub request: Option<Request>,
}

/// Client options with request scrubbing installed as `before_send`.
pub fn client_options(config: &ReporterConfig) -> ClientOptions {
    ClientOptions {
        dsn: config.dsn.as_deref().and_then(|dsn| dsn.parse().ok()),
        environment: Some(Cow::Owned(config.environment.clone())),
        release: config.release.clone().map(Cow::Owned),
        sample_rate: config.sample_rate.clamp(0.0, 1.0),
        traces_sample_rate: config.traces_sample_rate.clamp(0.0, 1.0),
        debug: config.debug,
        before_send: Some(Arc::new(scrub_event)),
        ..Default::default()
    }
}

/// Drop sensitive headers and cookies, redact request bodies and extra data.
fn scrub_event(mut event: Event<'static>) -> Option<Event<'static>> {
    if let Some(request) = event.request.as_mut() {
        request.headers.retain(|name, _| !is_sensitive_header(name));
        request.cookies = None;
        request.query_string = request.query_string.as_deref().map(redact_query);

        if let Some(data) = request.data.as_mut() {
            if let Ok(mut body) = serde_json::from_str::<Value>(data) {
                redact_value(&mut body);
                *data = body.to_string();
            }
        }
    }

    let mut extra: Map<String, Value> = std::mem::take(&mut event.extra).into_iter().collect();
    redact_map(&mut extra);
    event.extra = extra.into_iter().collect();

    Some(event)
}

fn sentry_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Trace | LogLevel::Debug => Level::Debug,
        LogLevel::Info => Level::Info,
        LogLevel::Warn => Level::Warning,
        LogLevel::Error => Level::Error,
        LogLevel::Fatal => Level::Fatal,
    }
}

/// Handle to the crash pipeline. Capture calls go to the current Sentry hub,
/// so a disabled reporter is a cheap no-op.
pub struct ErrorReporter {
    guard: Mutex<Option<ClientInitGuard>>,
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl ErrorReporter {
    /// A reporter that installs no client.
    pub fn disabled() -> Self {
        Self {
            guard: Mutex::new(None),
        }
    }

    fn install(config: &ReporterConfig) -> Self {
        let Some(dsn) = config.dsn.as_deref() else {
            info!("No crash reporting DSN configured, error reporting disabled");
            return Self::disabled();
        };

        if let Err(e) = dsn.parse::<sentry::types::Dsn>() {
            warn!(error = %e, "Invalid crash reporting DSN, error reporting disabled");
            return Self::disabled();
        }

        let guard = sentry::init(client_options(config));
        info!(
            environment = %config.environment,
            sample_rate = config.sample_rate,
            "Error reporter initialized"
        );

        Self {
            guard: Mutex::new(Some(guard)),
        }
    }

    pub fn is_initialized(&self) -> bool {
        Hub::current()
            .client()
            .map_or(false, |client| client.is_enabled())
    }

    /// Forward an error with its correlation tags. Returns the event id, nil
    /// when no client is bound or the event was sampled out.
    pub fn capture_exception(&self, error: &ErrorDetail, context: &ReportContext) -> Uuid {
        let mut event = Event {
            level: Level::Error,
            exception: vec![Exception {
                ty: error.name.clone(),
                value: Some(error.message.clone()),
                ..Default::default()
            }]
            .into(),
            request: context.request.clone(),
            ..Default::default()
        };

        event.tags.extend(context.tags.clone());
        if let Some(request_id) = &context.request_id {
            event.tags.insert("request_id".to_string(), request_id.clone());
        }
        if let Some(trace_id) = &context.trace_id {
            event.tags.insert("trace_id".to_string(), trace_id.clone());
        }

        if let Some(user_id) = &context.user_id {
            event.user = Some(User {
                id: Some(user_id.clone()),
                ..Default::default()
            });
        }

        event.extra.extend(context.extra.clone());
        if let Some(stack) = &error.stack {
            event
                .extra
                .insert("stack".to_string(), Value::String(stack.clone()));
        }

        sentry::capture_event(event)
    }

    pub fn capture_message(&self, message: &str, level: LogLevel) -> Uuid {
        sentry::capture_message(message, sentry_level(level))
    }

    /// Attach (or clear) the user on the current scope.
    pub fn set_user(&self, user_id: Option<&str>, email: Option<&str>) {
        let user = user_id.map(|id| User {
            id: Some(id.to_string()),
            email: email.map(str::to_string),
            ..Default::default()
        });
        sentry::configure_scope(|scope| scope.set_user(user));
    }

    pub fn add_breadcrumb(&self, message: &str, category: &str, level: LogLevel) {
        sentry::add_breadcrumb(Breadcrumb {
            message: Some(message.to_string()),
            category: Some(category.to_string()),
            level: sentry_level(level),
            ..Default::default()
        });
    }

    /// Wait up to `timeout` for queued events. `true` if everything was sent.
    pub fn flush(&self, timeout: Duration) -> bool {
        Hub::current()
            .client()
            .map_or(true, |client| client.flush(Some(timeout)))
    }

    /// Flush and disable the client. Later captures are dropped.
    pub fn close(&self, timeout: Duration) -> bool {
        let drained = Hub::current()
            .client()
            .map_or(true, |client| client.close(Some(timeout)));

        drop(
            self.guard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        drained
    }
}

static REPORTER: OnceCell<Arc<ErrorReporter>> = OnceCell::new();

/// Install the process-wide reporter. A second call warns and returns the first one.
pub fn init_error_reporter(config: &ReporterConfig) -> Arc<ErrorReporter> {
    if let Some(existing) = REPORTER.get() {
        warn!("Error reporter already initialized, returning existing instance");
        return existing.clone();
    }

    REPORTER
        .get_or_init(|| Arc::new(ErrorReporter::install(config)))
        .clone()
}

/// The process-wide reporter; disabled until [`init_error_reporter`] runs.
pub fn error_reporter() -> Arc<ErrorReporter> {
    REPORTER
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(ErrorReporter::disabled()))
}
