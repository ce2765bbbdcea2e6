use super::MetricsSink;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use prometheus::{CounterVec, GaugeVec, Opts};

static PIPELINE_COUNTERS: Lazy<CounterVec> = Lazy::new(|| {
    let counter = CounterVec::new(
        Opts::new(
            "pipeline_metric_total",
            "Pipeline counters emitted by workers (ImagesProcessed, ProcessingFailed, ...)",
        ),
        &["namespace", "metric"],
    )
    .expect("failed to create pipeline_metric_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register pipeline_metric_total");
    counter
});

static PIPELINE_GAUGES: Lazy<GaugeVec> = Lazy::new(|| {
    let gauge = GaugeVec::new(
        Opts::new(
            "pipeline_metric_value",
            "Latest value of pipeline gauges (ProcessingCost, ProcessingDurationMs, ...)",
        ),
        &["namespace", "metric"],
    )
    .expect("failed to create pipeline_metric_value");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register pipeline_metric_value");
    gauge
});

/// Metrics sink backed by the process-wide Prometheus registry
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusMetricsSink;

impl PrometheusMetricsSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsSink for PrometheusMetricsSink {
    async fn emit_counter(&self, namespace: &str, name: &str, value: f64) {
        // Counters only go up
        if value > 0.0 {
            PIPELINE_COUNTERS
                .with_label_values(&[namespace, name])
                .inc_by(value);
        }
    }

    async fn emit_gauge(&self, namespace: &str, name: &str, value: f64) {
        PIPELINE_GAUGES
            .with_label_values(&[namespace, name])
            .set(value);
    }
}
