/// Processor Worker
///
/// Provisions the pipeline infrastructure, then runs the worker pool until
/// Ctrl-C. A small HTTP server exposes Prometheus metrics and health checks.
use actix_web::{web, App, HttpResponse, HttpServer};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use idempotent_consumer::ProcessingLedger;
use object_store::{S3ObjectStore, StoreConfig};
use processor_service::bootstrap::InfrastructureBootstrap;
use processor_service::metrics::{self, PrometheusMetricsSink};
use processor_service::queue::SqsQueue;
use processor_service::services::{PipelinePorts, PublishBridge, WorkerPool, WorkerSettings};
use processor_service::topic::SnsTopic;
use processor_service::transform::InvertTransform;
use processor_service::{logging, Config};
use std::sync::Arc;
use tokio::sync::watch;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    let config = Config::from_env()?;
    tracing::info!(
        upload_bucket = %config.pipeline.upload_bucket,
        output_bucket = %config.pipeline.output_bucket,
        concurrency = config.worker.concurrency,
        "Processor worker starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.aws.region.clone()));
    if let Some(endpoint) = &config.aws.endpoint_url {
        tracing::info!(endpoint = %endpoint, "Using custom AWS endpoint");
        loader = loader.endpoint_url(endpoint);
    }
    let shared = loader.load().await;

    let store = S3ObjectStore::from_sdk_config(&shared, &StoreConfig::from_env());
    let sqs = aws_sdk_sqs::Client::new(&shared);
    let topic = SnsTopic::new(aws_sdk_sns::Client::new(&shared));

    let bootstrap = InfrastructureBootstrap::new(
        store.clone(),
        sqs.clone(),
        topic.clone(),
        config.pipeline.clone(),
        &config.worker,
    );
    let Some(provisioned) = bootstrap.run_until_ready(shutdown_rx.clone()).await else {
        tracing::info!("Shutdown before infrastructure was ready");
        return Ok(());
    };

    let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
    let server = HttpServer::new(|| {
        App::new()
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .route(
                "/health",
                web::get()
                    .to(|| async { HttpResponse::Ok().json(serde_json::json!({"status": "ok"})) }),
            )
    })
    .workers(1)
    .disable_signals()
    .bind(&metrics_addr)?
    .run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);
    tracing::info!(addr = %metrics_addr, "Metrics server listening");

    let ports = PipelinePorts {
        queue: Arc::new(SqsQueue::new(
            sqs,
            provisioned.queue_url,
            config.pipeline.upload_bucket.clone(),
        )),
        store: Arc::new(store),
        transform: Arc::new(InvertTransform::new(config.pipeline.output_quality)),
        metrics: Arc::new(PrometheusMetricsSink::new()),
    };
    let ledger = Arc::new(ProcessingLedger::new(config.worker.ledger_config()));
    let bridge = PublishBridge::new(
        Arc::new(topic),
        config.pipeline.processed_topic_name.clone(),
        &config.publish,
    );

    let pool = WorkerPool::spawn(
        config.worker.concurrency,
        ports,
        ledger,
        WorkerSettings::new(&config.pipeline, &config.worker),
        bridge,
        shutdown_rx,
    );
    pool.join().await;

    server_handle.stop(true).await;
    if let Err(e) = server_task.await {
        tracing::error!(error = %e, "Metrics server task failed");
    }

    tracing::info!("Processor worker shut down");
    Ok(())
}
