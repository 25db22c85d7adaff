//! Structured logger with trace correlation and field redaction.
//!
//! Records are assembled here and handed to a [`LogSink`]; the default sink
//! forwards them to the `tracing` subscriber installed by the telemetry module.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fmt,
    io::Write,
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tracing::warn;

use super::interceptor::current_request_id;
use super::redact::redact_map;
use super::tags::{service_identity, ServiceIdentity};
use super::telemetry::get_trace_context;

/// `tracing` target for records forwarded by [`TracingSink`].
pub const LOG_TARGET: &str = "practice_observability::log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }

    /// `debug` in development, `info` everywhere else.
    pub fn default_for(identity: &ServiceIdentity) -> Self {
        if identity.is_development() {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown log level: {0}")]
pub struct ParseLevelError(String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" | "verbose" => Ok(LogLevel::Debug),
            "info" | "log" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// Serializable description of an error attached to a record under `err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorDetail {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Describe a std error; the source chain becomes the stack.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(format!("Caused by: {}", cause));
            source = cause.source();
        }

        let detail = Self::new("Error", error.to_string());
        if chain.is_empty() {
            detail
        } else {
            detail.with_stack(chain.join("\n"))
        }
    }

    /// Describe an `anyhow` error, keeping its cause chain and backtrace.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        Self::new("Error", error.to_string()).with_stack(format!("{:?}", error))
    }
}

/// Structured key/value context attached to a single record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogContext(Map<String, Value>);

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field; values that fail to serialize are stored as `null`.
    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for LogContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Value> for LogContext {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::Null => Self::default(),
            other => Self::default().with("value", other),
        }
    }
}

/// A fully assembled, redacted log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
    #[serde(rename = "err", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl LogRecord {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Destination for finished records.
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &LogRecord);

    /// Drain anything buffered before returning.
    fn flush(&self);
}

/// Forwards records to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

/// Keys forwarded as individual `tracing` fields; the rest travel in `fields`.
const CORRELATION_FIELDS: &[&str] = &[
    "trace_id",
    "span_id",
    "request_id",
    "user_id",
    "method",
    "path",
    "route",
    "status_code",
    "duration_ms",
];

fn field_str<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

fn remaining_fields(fields: &Map<String, Value>) -> Option<String> {
    let rest: Map<String, Value> = fields
        .iter()
        .filter(|(key, _)| !CORRELATION_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    (!rest.is_empty()).then(|| Value::Object(rest).to_string())
}

macro_rules! forward_event {
    ($level:expr, $record:expr, $fatal:expr) => {{
        let record = $record;
        let fields = &record.fields;
        let err = record
            .error
            .as_ref()
            .and_then(|error| serde_json::to_string(error).ok());
        let rest = remaining_fields(fields);
        tracing::event!(
            target: LOG_TARGET,
            $level,
            trace_id = field_str(fields, "trace_id"),
            span_id = field_str(fields, "span_id"),
            request_id = field_str(fields, "request_id"),
            user_id = field_str(fields, "user_id"),
            method = field_str(fields, "method"),
            path = field_str(fields, "path"),
            route = field_str(fields, "route"),
            status_code = fields.get("status_code").and_then(serde_json::Value::as_u64),
            duration_ms = fields.get("duration_ms").and_then(serde_json::Value::as_f64),
            fields = rest.as_deref(),
            err = err.as_deref(),
            fatal = $fatal,
            "{}",
            record.message
        )
    }};
}

fn flush_stream(name: &str, stream: &mut dyn Write) {
    if let Err(e) = stream.flush() {
        warn!(error = %e, stream = name, "Failed to flush log output");
    }
}

impl LogSink for TracingSink {
    fn emit(&self, record: &LogRecord) {
        match record.level {
            LogLevel::Trace => forward_event!(tracing::Level::TRACE, record, false),
            LogLevel::Debug => forward_event!(tracing::Level::DEBUG, record, false),
            LogLevel::Info => forward_event!(tracing::Level::INFO, record, false),
            LogLevel::Warn => forward_event!(tracing::Level::WARN, record, false),
            LogLevel::Error => forward_event!(tracing::Level::ERROR, record, false),
            LogLevel::Fatal => forward_event!(tracing::Level::ERROR, record, true),
        }
    }

    fn flush(&self) {
        flush_stream("stdout", &mut std::io::stdout());
        flush_stream("stderr", &mut std::io::stderr());
    }
}

/// Keeps records in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
    flushes: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn flush_count(&self) -> usize {
        *self.flushes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &LogRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }

    fn flush(&self) {
        *self.flushes.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}

#[derive(Debug, Clone)]
pub struct LoggerOptions {
    pub level: LogLevel,
    pub bindings: LogContext,
}

impl LoggerOptions {
    /// Identity bindings (`service`, `env`, `version`, `release`) at the given level.
    pub fn from_identity(identity: &ServiceIdentity, level: Option<LogLevel>) -> Self {
        let mut bindings = LogContext::new()
            .with("service", &identity.service_name)
            .with("env", &identity.environment)
            .with("version", &identity.version);
        if let Some(release) = &identity.release {
            bindings.insert("release", release);
        }

        Self {
            level: level.unwrap_or_else(|| LogLevel::default_for(identity)),
            bindings,
        }
    }
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self::from_identity(service_identity(), None)
    }
}

/// Cheap to clone; children share the sink with their parent.
#[derive(Clone)]
pub struct StructuredLogger {
    sink: Arc<dyn LogSink>,
    min_level: LogLevel,
    bindings: Arc<Map<String, Value>>,
}

impl fmt::Debug for StructuredLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredLogger")
            .field("min_level", &self.min_level)
            .field("bindings", &self.bindings)
            .finish()
    }
}

impl StructuredLogger {
    pub fn new(options: LoggerOptions, sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            min_level: options.level,
            bindings: Arc::new(options.bindings.into_inner()),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.min_level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    pub fn bindings(&self) -> &Map<String, Value> {
        &self.bindings
    }

    /// A logger that adds `bindings` to every record. The parent is unchanged.
    pub fn child(&self, bindings: impl Into<LogContext>) -> Self {
        let mut merged = (*self.bindings).clone();
        merged.extend(bindings.into().into_inner());

        Self {
            sink: self.sink.clone(),
            min_level: self.min_level,
            bindings: Arc::new(merged),
        }
    }

    pub fn trace(&self, message: &str, context: Option<LogContext>) {
        self.log_at(LogLevel::Trace, message, context, None);
    }

    pub fn debug(&self, message: &str, context: Option<LogContext>) {
        self.log_at(LogLevel::Debug, message, context, None);
    }

    pub fn info(&self, message: &str, context: Option<LogContext>) {
        self.log_at(LogLevel::Info, message, context, None);
    }

    pub fn warn(&self, message: &str, context: Option<LogContext>) {
        self.log_at(LogLevel::Warn, message, context, None);
    }

    pub fn error(&self, message: &str, error: Option<&ErrorDetail>, context: Option<LogContext>) {
        self.log_at(LogLevel::Error, message, context, error);
    }

    pub fn fatal(&self, message: &str, error: Option<&ErrorDetail>, context: Option<LogContext>) {
        self.log_at(LogLevel::Fatal, message, context, error);
    }

    /// Alias for [`info`](Self::info).
    pub fn log(&self, message: &str, context: Option<LogContext>) {
        self.info(message, context);
    }

    /// Alias for [`debug`](Self::debug).
    pub fn verbose(&self, message: &str, context: Option<LogContext>) {
        self.debug(message, context);
    }

    pub fn log_at(
        &self,
        level: LogLevel,
        message: &str,
        context: Option<LogContext>,
        error: Option<&ErrorDetail>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let mut fields = (*self.bindings).clone();
        if let Some(context) = context {
            fields.extend(context.into_inner());
        }

        if let Some(trace) = get_trace_context() {
            fields.insert("trace_id".to_string(), Value::String(trace.trace_id));
            fields.insert("span_id".to_string(), Value::String(trace.span_id));
        }

        if let Some(request_id) = current_request_id() {
            fields
                .entry("request_id")
                .or_insert(Value::String(request_id));
        }

        redact_map(&mut fields);

        let record = LogRecord {
            level,
            message: message.to_string(),
            timestamp: Utc::now(),
            fields,
            error: error.cloned(),
        };

        self.sink.emit(&record);
    }

    /// Completed request at a severity derived from the status code.
    pub fn log_request(&self, method: &str, path: &str, status_code: u16, context: LogContext) {
        let level = match status_code {
            500..=u16::MAX => LogLevel::Error,
            400..=499 => LogLevel::Warn,
            _ => LogLevel::Info,
        };

        let context = context
            .with("method", method)
            .with("path", path)
            .with("status_code", status_code);

        self.log_at(level, &format!("{} {}", method, path), Some(context), None);
    }

    /// Always logged at error level, with the error's message as the record message.
    pub fn log_exception(&self, error: &ErrorDetail, context: Option<LogContext>) {
        self.log_at(LogLevel::Error, &error.message, context, Some(error));
    }

    pub fn flush(&self) {
        self.sink.flush();
    }
}

static LOGGER: OnceCell<StructuredLogger> = OnceCell::new();

/// Install the process-wide logger. A second call warns and returns the first one.
pub fn init_logger(options: LoggerOptions) -> StructuredLogger {
    if let Some(existing) = LOGGER.get() {
        warn!("Logger already initialized, returning existing instance");
        return existing.clone();
    }

    LOGGER
        .get_or_init(|| StructuredLogger::new(options, Arc::new(TracingSink)))
        .clone()
}

/// The process-wide logger, initialized with defaults on first use.
pub fn logger() -> StructuredLogger {
    LOGGER
        .get_or_init(|| StructuredLogger::new(LoggerOptions::default(), Arc::new(TracingSink)))
        .clone()
}
