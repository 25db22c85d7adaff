pub mod config;
pub mod handlers;
pub mod models;
pub mod observability;

pub use config::{Config, ConfigError};
pub use handlers::{create_app, instrument, observability_routes};
pub use models::{ApiError, ApiResult};
pub use observability::{
    init_error_reporter, init_logger, init_metrics, init_telemetry, shutdown_telemetry,
    RequestInterceptor,
};
