use std::sync::Arc;

use practice_observability::observability::{error_reporter, init_error_reporter, ReporterConfig};

fn config(dsn: Option<&str>) -> ReporterConfig {
    ReporterConfig {
        dsn: dsn.map(str::to_string),
        environment: "test".to_string(),
        release: None,
        sample_rate: 1.0,
        traces_sample_rate: 0.0,
        debug: false,
    }
}

// The reporter binds the process-wide Sentry client, so this binary holds a single test.
#[test]
fn test_init_error_reporter_keeps_first_instance() {
    assert!(!error_reporter().is_initialized());

    let first = init_error_reporter(&config(None));
    let second = init_error_reporter(&config(Some("https://public@sentry.example.com/1")));

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &error_reporter()));

    // The DSN passed second was never installed
    assert!(!second.is_initialized());
}
