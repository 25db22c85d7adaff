use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

use crate::observability::{
    telemetry::Instrumentation, LogLevel, LoggerOptions, MetricsOptions, ReporterConfig,
    ServiceIdentity, TelemetryConfig,
};

/// Prefix of every environment variable read by [`Config::from_environment`].
pub const ENV_PREFIX: &str = "PRACTICE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading error: {message}")]
    LoadError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub pretty_logs: Option<bool>,
    #[serde(default)]
    pub otlp_traces_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_metrics_endpoint: Option<String>,
    #[serde(default = "default_metrics_export_interval_ms")]
    pub metrics_export_interval_ms: u64,
    #[serde(default = "default_collect_process_metrics")]
    pub collect_process_metrics: bool,
    #[serde(default)]
    pub metrics_prefix: Option<String>,
    /// Constant labels for every series, as `key=value` pairs separated by commas.
    #[serde(default)]
    pub metrics_default_labels: Option<String>,
    #[serde(default)]
    pub sentry_dsn: Option<String>,
    #[serde(default = "default_sentry_sample_rate")]
    pub sentry_sample_rate: f32,
    #[serde(default)]
    pub traces_sample_rate: Option<f64>,
    #[serde(default)]
    pub telemetry_debug: bool,
}

impl Config {
    /// Load `PRACTICE_*` variables, apply the standard OTLP and Sentry fallbacks, validate.
    pub fn from_environment() -> Result<Self, ConfigError> {
        info!("Loading configuration from environment");

        let mut config = Self::from_source(config::Environment::with_prefix(ENV_PREFIX))?;
        config
            .observability
            .apply_fallbacks(|key| std::env::var(key).ok());
        config.validate()?;

        info!("Configuration loaded successfully");
        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Deserialize from an arbitrary environment source, without fallbacks or validation.
    pub fn from_source(source: config::Environment) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(source)
            .build()
            .map_err(|e| ConfigError::LoadError {
                message: format!("Failed to load configuration: {}", e),
            })?;

        let server = settings
            .clone()
            .try_deserialize::<ServerConfig>()
            .map_err(|e| ConfigError::LoadError {
                message: format!("Failed to deserialize server config: {}", e),
            })?;

        let observability = settings
            .try_deserialize::<ObservabilityConfig>()
            .map_err(|e| ConfigError::LoadError {
                message: format!("Failed to deserialize observability config: {}", e),
            })?;

        Ok(Config {
            server,
            observability,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError {
                message: "Server port cannot be 0".to_string(),
            });
        }

        if self.server.request_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError {
                message: "Request timeout cannot be 0".to_string(),
            });
        }

        self.observability.validate()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl ObservabilityConfig {
    /// Fill unset endpoints and DSN from the conventional OpenTelemetry and Sentry variables.
    pub fn apply_fallbacks<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        self.otlp_traces_endpoint = non_empty(self.otlp_traces_endpoint.take())
            .or_else(|| lookup("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT"));
        self.otlp_metrics_endpoint = non_empty(self.otlp_metrics_endpoint.take())
            .or_else(|| lookup("OTEL_EXPORTER_OTLP_METRICS_ENDPOINT"));
        self.sentry_dsn = non_empty(self.sentry_dsn.take()).or_else(|| lookup("SENTRY_DSN"));
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(level) = &self.log_level {
            level
                .parse::<LogLevel>()
                .map_err(|e| ConfigError::ValidationError {
                    message: e.to_string(),
                })?;
        }

        if !(0.0..=1.0).contains(&self.sentry_sample_rate) {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "Sentry sample rate must be within [0, 1], got {}",
                    self.sentry_sample_rate
                ),
            });
        }

        if let Some(rate) = self.traces_sample_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::ValidationError {
                    message: format!("Traces sample rate must be within [0, 1], got {}", rate),
                });
            }
        }

        self.metrics_default_labels()?;

        if self.metrics_export_interval_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "Metrics export interval cannot be 0".to_string(),
            });
        }

        Ok(())
    }

    pub fn log_level(&self, identity: &ServiceIdentity) -> LogLevel {
        self.log_level
            .as_deref()
            .and_then(|level| level.parse().ok())
            .unwrap_or_else(|| LogLevel::default_for(identity))
    }

    pub fn pretty_logs(&self, identity: &ServiceIdentity) -> bool {
        self.pretty_logs.unwrap_or_else(|| identity.is_development())
    }

    pub fn traces_sample_rate(&self, identity: &ServiceIdentity) -> f64 {
        self.traces_sample_rate
            .unwrap_or(if identity.is_production() { 0.1 } else { 1.0 })
    }

    /// Identity with the configured service name applied.
    pub fn identity(&self, resolved: &ServiceIdentity) -> ServiceIdentity {
        let mut identity = resolved.clone();
        if let Some(name) = non_empty(self.service_name.clone()) {
            identity.service_name = name;
        }
        identity
    }

    pub fn telemetry_config(&self, identity: &ServiceIdentity) -> TelemetryConfig {
        let level = self.log_level(identity);

        TelemetryConfig {
            service_name: Some(identity.service_name.clone()),
            traces_endpoint: self.otlp_traces_endpoint.clone(),
            metrics_endpoint: self.otlp_metrics_endpoint.clone(),
            metrics_interval: Duration::from_millis(self.metrics_export_interval_ms),
            traces_sample_rate: self.traces_sample_rate(identity),
            disabled_instrumentations: Instrumentation::disabled_by_default(),
            // `tracing` has no fatal level
            log_level: match level {
                LogLevel::Fatal => LogLevel::Error.to_string(),
                other => other.to_string(),
            },
            pretty_logs: self.pretty_logs(identity),
            debug: self.telemetry_debug,
            breadcrumbs: self.sentry_dsn.is_some(),
            ..Default::default()
        }
    }

    pub fn logger_options(&self, identity: &ServiceIdentity) -> LoggerOptions {
        LoggerOptions::from_identity(identity, Some(self.log_level(identity)))
    }

    pub fn metrics_options(&self, identity: &ServiceIdentity) -> MetricsOptions {
        MetricsOptions {
            identity: identity.clone(),
            collect_process_metrics: self.collect_process_metrics,
            // Malformed pairs are rejected by `validate`
            default_labels: self.metrics_default_labels().unwrap_or_default(),
            prefix: non_empty(self.metrics_prefix.clone()),
        }
    }

    pub fn metrics_default_labels(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let Some(raw) = non_empty(self.metrics_default_labels.clone()) else {
            return Ok(BTreeMap::new());
        };

        raw.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    Ok((key.trim().to_string(), value.trim().to_string()))
                }
                _ => Err(ConfigError::ValidationError {
                    message: format!("Invalid metrics default label '{}', expected key=value", pair),
                }),
            })
            .collect()
    }

    pub fn reporter_config(&self, identity: &ServiceIdentity) -> ReporterConfig {
        ReporterConfig {
            sample_rate: self.sentry_sample_rate,
            traces_sample_rate: self.traces_sample_rate(identity) as f32,
            debug: self.telemetry_debug,
            ..ReporterConfig::from_identity(identity, self.sentry_dsn.clone())
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// Default value functions
pub(crate) fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub(crate) fn default_port() -> u16 {
    4000
}

pub(crate) fn default_timeout() -> u64 {
    30
}

pub(crate) fn default_metrics_export_interval_ms() -> u64 {
    60_000
}

pub(crate) fn default_collect_process_metrics() -> bool {
    true
}

pub(crate) fn default_sentry_sample_rate() -> f32 {
    1.0
}
