//! Metrics sink port and the processor's Prometheus series
//!
//! The worker reports pipeline metrics (`ImagesProcessed`, `ProcessingCost`,
//! ...) through `MetricsSink` under a namespace. The Prometheus adapter maps
//! them onto labelled series; the in-memory adapter records every emission.

use actix_web::HttpResponse;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, TextEncoder};

pub mod memory;
pub mod prometheus_sink;

pub use memory::{InMemoryMetricsSink, MetricKind, MetricRecord};
pub use prometheus_sink::PrometheusMetricsSink;

pub const IMAGES_PROCESSED: &str = "ImagesProcessed";
pub const PROCESSING_COST: &str = "ProcessingCost";
pub const PROCESSING_DURATION_MS: &str = "ProcessingDurationMs";
pub const PROCESSING_FAILED: &str = "ProcessingFailed";
pub const DUPLICATE_DELIVERIES: &str = "DuplicateDeliveries";

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn emit_counter(&self, namespace: &str, name: &str, value: f64);

    async fn emit_gauge(&self, namespace: &str, name: &str, value: f64);
}

static COMPLETION_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "processor_completion_events_total",
            "Completion events handed to the notification topic, by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create processor_completion_events_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register processor_completion_events_total");
    counter
});

static QUEUE_OPERATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "processor_queue_operations_total",
            "Queue acknowledgements and releases issued by workers",
        ),
        &["operation", "status"],
    )
    .expect("failed to create processor_queue_operations_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register processor_queue_operations_total");
    counter
});

/// Record a publish outcome (`published` or `dropped`)
pub fn record_completion_event(outcome: &str) {
    COMPLETION_EVENTS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record an ack/nack call and whether it succeeded
pub fn record_queue_operation(operation: &str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    QUEUE_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
