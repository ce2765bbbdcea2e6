/// Live-update Service - HTTP Server
///
/// Serves uploads, the SSE live channel, the SNS receiver and the processed
/// listing. The fan-out hub's shard dispatchers and sweeper run alongside.
use actix_web::{middleware as actix_middleware, web, App, HttpServer};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use live_update_service::bootstrap::Bootstrap;
use live_update_service::hub::{event_channel, run_sweeper, spawn_dispatchers, FanoutHub};
use live_update_service::metrics::MetricsMiddleware;
use live_update_service::sns::SnsGateway;
use live_update_service::{handlers, logging, AppState, Config};
use object_store::{ObjectStore, S3ObjectStore, StoreConfig};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    let config = Config::from_env()?;
    let bind_address = format!("{}:{}", config.http.host, config.http.port);

    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.aws.region.clone()));
    if let Some(endpoint) = &config.aws.endpoint_url {
        tracing::info!(endpoint = %endpoint, "Using custom AWS endpoint");
        loader = loader.endpoint_url(endpoint);
    }
    let shared = loader.load().await;

    let store: Arc<dyn ObjectStore> =
        Arc::new(S3ObjectStore::from_sdk_config(&shared, &StoreConfig::from_env()));
    let sns = SnsGateway::new(aws_sdk_sns::Client::new(&shared));

    let hub = FanoutHub::new(config.hub.clone());
    let (events, shard_receivers) = event_channel(&hub, config.hub.dispatch_buffer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ready = Arc::new(AtomicBool::new(false));

    let dispatchers = spawn_dispatchers(&hub, shard_receivers);
    let sweeper = tokio::spawn(run_sweeper(hub.clone(), shutdown_rx.clone()));

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        hub: hub.clone(),
        events,
        confirmer: Arc::new(sns.clone()),
        ready: ready.clone(),
    };

    let max_upload_bytes = config.http.max_upload_bytes;
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .app_data(web::PayloadConfig::new(max_upload_bytes))
            .wrap(MetricsMiddleware)
            .wrap(actix_middleware::Logger::default())
            .configure(handlers::configure)
    })
    .disable_signals()
    .bind(&bind_address)?
    .run();
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);
    tracing::info!(addr = %bind_address, "Live-update service listening");

    tokio::spawn(Bootstrap::new(store, sns, config.clone()).run(ready, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Let open streams see their draining state before the server stops
    hub.shutdown(config.hub.grace_period).await;
    server_handle.stop(true).await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server error"),
        Err(e) => tracing::error!(error = %e, "HTTP server task failed"),
    }

    // Every connection is closed, nothing left to route
    for dispatcher in &dispatchers {
        dispatcher.abort();
    }
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "Hub sweeper task failed");
    }

    tracing::info!("Live-update service shut down");
    Ok(())
}
