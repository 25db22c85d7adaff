use anyhow::Context as _;
use axum::Router;
use std::{net::SocketAddr, time::Duration};
use tokio::net::TcpListener;
use tracing::info;

use practice_observability::{
    create_app, init_error_reporter, init_logger, init_metrics, init_telemetry,
    observability::{service_identity, shutdown_signal, LogContext},
    Config, RequestInterceptor,
};

const REPORTER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (no subscriber yet)
    let config = Config::from_environment()?;
    println!("Configuration loaded successfully");

    let identity = config.observability.identity(service_identity());

    let telemetry = init_telemetry(&config.observability.telemetry_config(&identity));
    let logger = init_logger(config.observability.logger_options(&identity));
    let metrics = init_metrics(config.observability.metrics_options(&identity))
        .context("Failed to initialize metrics")?;
    let reporter = init_error_reporter(&config.observability.reporter_config(&identity));

    info!(
        service = %identity.service_name,
        environment = %identity.environment,
        version = %identity.version,
        exports_traces = telemetry.exports_traces(),
        exports_metrics = telemetry.exports_metrics(),
        error_reporting = reporter.is_initialized(),
        "Observability initialized"
    );

    let interceptor = RequestInterceptor::new(logger.clone(), metrics, reporter.clone());
    let app = create_app(
        Router::new(),
        interceptor,
        Some(config.server.request_timeout()),
    );

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_address()))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    logger.info(
        "Server listening",
        Some(LogContext::new().with("address", addr.to_string())),
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("Shutdown signal received, draining observability");

    logger.flush();
    reporter.close(REPORTER_CLOSE_TIMEOUT);
    telemetry.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
