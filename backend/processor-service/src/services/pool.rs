//! Worker pool - N independent workers sharing one processing ledger

use super::bridge::{handoff_channel, PublishBridge};
use super::worker::{PipelinePorts, Worker, WorkerSettings};
use idempotent_consumer::ProcessingLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// How often expired ledger entries are purged
const LEDGER_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub struct WorkerPool {
    workers: JoinSet<()>,
    bridge: tokio::task::JoinHandle<()>,
    purge: tokio::task::JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers, the publish bridge and the ledger purger
    pub fn spawn(
        concurrency: usize,
        ports: PipelinePorts,
        ledger: Arc<ProcessingLedger>,
        settings: WorkerSettings,
        bridge: PublishBridge,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (completions_tx, completions_rx) = handoff_channel();
        let bridge = tokio::spawn(bridge.run(completions_rx));

        let mut workers = JoinSet::new();
        for id in 0..concurrency.max(1) {
            let worker = Worker::new(
                id,
                ports.clone(),
                ledger.clone(),
                settings.clone(),
                completions_tx.clone(),
                shutdown_rx.clone(),
            );
            workers.spawn(worker.run());
        }
        // Bridge exits once the last worker drops its sender
        drop(completions_tx);

        let purge = tokio::spawn(purge_ledger(ledger, shutdown_rx));

        info!(workers = concurrency.max(1), "Worker pool started");
        Self {
            workers,
            bridge,
            purge,
        }
    }

    /// Wait for every worker to finish, then for pending notifications to drain
    pub async fn join(mut self) {
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }

        if let Err(e) = self.bridge.await {
            error!(error = %e, "Publish bridge task failed");
        }
        if let Err(e) = self.purge.await {
            error!(error = %e, "Ledger purge task failed");
        }

        info!("Worker pool stopped");
    }
}

async fn purge_ledger(ledger: Arc<ProcessingLedger>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(LEDGER_PURGE_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let purged = ledger.purge_expired();
                debug!(purged, remaining = ledger.len(), "Ledger purge");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublishConfig;
    use crate::metrics::{InMemoryMetricsSink, IMAGES_PROCESSED};
    use crate::queue::InMemoryQueue;
    use crate::topic::InMemoryTopic;
    use crate::transform::InvertTransform;
    use object_store::{InMemoryObjectStore, ObjectStore, StoredObject};

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([9, 9, 9]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_processes_each_key_once_and_drains_on_shutdown() {
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(30), "uploads"));
        let store = Arc::new(InMemoryObjectStore::new());
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let topic = Arc::new(InMemoryTopic::new());

        for i in 0..6 {
            let key = format!("{}.png", i);
            store
                .put("uploads", &key, StoredObject::new(png_bytes()))
                .await
                .unwrap();
            // Two notifications per object
            queue.send_object_created("uploads", &key);
            queue.send_object_created("uploads", &key);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ports = PipelinePorts {
            queue: queue.clone(),
            store: store.clone(),
            transform: Arc::new(InvertTransform::default()),
            metrics: metrics.clone(),
        };
        let settings = WorkerSettings {
            output_bucket: "processed".to_string(),
            metrics_namespace: "PhotoPipeline".to_string(),
            cost_per_image_usd: 0.0005,
            poll_max_messages: 2,
            poll_wait: Duration::from_millis(20),
        };
        let bridge = PublishBridge::new(topic.clone(), "processed-updates", &PublishConfig::default());

        let pool = WorkerPool::spawn(
            3,
            ports,
            Arc::new(ProcessingLedger::default()),
            settings,
            bridge,
            shutdown_rx,
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !queue.is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        pool.join().await;

        assert!(queue.is_empty());
        assert_eq!(store.object_count("processed"), 6);
        assert_eq!(metrics.counter_total(IMAGES_PROCESSED), 6.0);
        assert_eq!(topic.published("processed-updates").len(), 6);
    }
}
