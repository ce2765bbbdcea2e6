use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "live_update_http_requests_total",
            "Total HTTP requests handled by live-update-service",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create live_update_http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register live_update_http_requests_total");
    counter
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "live_update_http_request_duration_seconds",
            "HTTP request latency for live-update-service",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "path", "status"],
    )
    .expect("failed to create live_update_http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register live_update_http_request_duration_seconds");
    histogram
});

static HUB_OPEN_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "live_update_hub_open_connections",
        "Live-update connections currently registered in the hub",
    )
    .expect("failed to create live_update_hub_open_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register live_update_hub_open_connections");
    gauge
});

static HUB_EVENTS_DELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "live_update_hub_events_delivered_total",
        "Completion events buffered for a live connection",
    )
    .expect("failed to create live_update_hub_events_delivered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register live_update_hub_events_delivered_total");
    counter
});

static HUB_EVENTS_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "live_update_hub_events_dropped_total",
            "Completion events the hub discarded, by reason",
        ),
        &["reason"],
    )
    .expect("failed to create live_update_hub_events_dropped_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register live_update_hub_events_dropped_total");
    counter
});

static HUB_DISCONNECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "live_update_hub_disconnects_total",
            "Connections removed from the hub, by cause",
        ),
        &["cause"],
    )
    .expect("failed to create live_update_hub_disconnects_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register live_update_hub_disconnects_total");
    counter
});

pub fn observe_http_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path, &status_label])
        .observe(elapsed.as_secs_f64());
}

pub fn connection_opened() {
    HUB_OPEN_CONNECTIONS.inc();
}

/// `cause` is one of `client`, `slow_consumer`, `idle`, `shutdown`
pub fn connection_closed(cause: &str) {
    HUB_OPEN_CONNECTIONS.dec();
    HUB_DISCONNECTS_TOTAL.with_label_values(&[cause]).inc();
}

pub fn event_delivered() {
    HUB_EVENTS_DELIVERED_TOTAL.inc();
}

/// `reason` is one of `overflow`, `no_subscriber`, `no_session`, `backlog`
pub fn event_dropped(reason: &str) {
    HUB_EVENTS_DROPPED_TOTAL.with_label_values(&[reason]).inc();
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

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::time::Instant;

/// Records count and latency for every request, labelled by matched route
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        // Route pattern keeps label cardinality bounded
        let path = req
            .match_pattern()
            .unwrap_or_else(|| "unmatched".to_string());
        let method = req.method().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let result = service.call(req).await;
            let elapsed = start.elapsed();
            match &result {
                Ok(response) => {
                    observe_http_request(&method, &path, response.status().as_u16(), elapsed);
                }
                Err(_) => {
                    observe_http_request(&method, &path, 500, elapsed);
                }
            }
            result
        })
    }
}
