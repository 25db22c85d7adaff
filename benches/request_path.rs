use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use practice_observability::observability::{
    generate_request_id, redact::redact_map, ErrorReporter, LogContext, LogLevel, LogRecord,
    LogSink, LoggerOptions, Metrics, MetricsOptions, RequestInterceptor, RequestMeta,
    ServiceIdentity, StructuredLogger,
};

/// Sink that drops everything, so benches measure record building only.
struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, record: &LogRecord) {
        black_box(record);
    }

    fn flush(&self) {}
}

fn bench_metrics() -> Arc<Metrics> {
    Arc::new(
        Metrics::new(MetricsOptions {
            identity: ServiceIdentity::resolve_with(|_| None),
            collect_process_metrics: false,
            ..Default::default()
        })
        .unwrap(),
    )
}

fn context_with_fields(size: usize) -> Map<String, Value> {
    let mut map = Map::new();
    for i in 0..size {
        map.insert(format!("field_{}", i), json!(i));
    }
    map.insert("password".to_string(), json!("hunter2"));
    map.insert("user".to_string(), json!({ "token": "abc", "name": "ada" }));
    map
}

fn bench_request_id(c: &mut Criterion) {
    c.bench_function("generate_request_id", |b| {
        b.iter(|| black_box(generate_request_id()))
    });
}

fn bench_redaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("redact_map");

    for size in [4, 16, 64] {
        let fields = context_with_fields(size);
        group.bench_with_input(BenchmarkId::new("fields", size), &fields, |b, fields| {
            b.iter_batched(
                || fields.clone(),
                |mut map| {
                    redact_map(&mut map);
                    black_box(map)
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_record_http_request(c: &mut Criterion) {
    let metrics = bench_metrics();

    c.bench_function("record_http_request", |b| {
        b.iter(|| {
            metrics.record_http_request(
                black_box("GET"),
                black_box("/clients/:id"),
                black_box(200),
                black_box(12.5),
            )
        })
    });
}

fn bench_request_lifecycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let logger = StructuredLogger::new(
        LoggerOptions {
            level: LogLevel::Info,
            bindings: LogContext::new().with("service", "bench"),
        },
        Arc::new(NullSink),
    );
    let interceptor =
        RequestInterceptor::new(logger, bench_metrics(), Arc::new(ErrorReporter::disabled()));

    let mut group = c.benchmark_group("request_lifecycle");
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("enter_scope_succeed", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut meta = RequestMeta::new("GET", "/clients/42");
                meta.route = Some("/clients/:id".to_string());
                let active = interceptor.enter(meta);
                active.scope(async { black_box(()) }).await;
                active.succeed(200);
            })
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_request_id,
    bench_redaction,
    bench_record_http_request,
    bench_request_lifecycle
);
criterion_main!(benches);
