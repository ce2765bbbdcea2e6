//! Worker loop
//!
//! Pulls upload notifications, guards against duplicate delivery through the
//! shared ledger, transforms the object, writes the result, acknowledges the
//! message and hands a completion event to the publish bridge.
//!
//! Retries are left to the queue: a failed attempt leaves the message
//! unacknowledged so it comes back after its visibility timeout. Once the
//! attempt budget is spent the message is acknowledged and dropped.

use crate::config::{PipelineConfig, WorkerConfig};
use crate::error::{PipelineError, Result};
use crate::metrics::{
    self, MetricsSink, DUPLICATE_DELIVERIES, IMAGES_PROCESSED, PROCESSING_COST,
    PROCESSING_DURATION_MS, PROCESSING_FAILED,
};
use crate::queue::NotificationQueue;
use crate::transform::{self, TransformEngine};
use event_schema::{
    CompletionEvent, MetricsSnapshot, ReceiptHandle, UploadEvent, SESSION_TOKEN_METADATA_KEY,
};
use idempotent_consumer::{Admission, FailureOutcome, ProcessingLedger};
use object_store::{ObjectStore, StoredObject};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Delay before polling again after the queue itself failed
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Metadata key recording which upload a processed object came from
pub const SOURCE_KEY_METADATA_KEY: &str = "source-key";

/// External collaborators a worker talks to
#[derive(Clone)]
pub struct PipelinePorts {
    pub queue: Arc<dyn NotificationQueue>,
    pub store: Arc<dyn ObjectStore>,
    pub transform: Arc<dyn TransformEngine>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Per-worker settings derived from the service configuration
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub output_bucket: String,
    pub metrics_namespace: String,
    pub cost_per_image_usd: f64,
    pub poll_max_messages: u32,
    pub poll_wait: Duration,
}

impl WorkerSettings {
    pub fn new(pipeline: &PipelineConfig, worker: &WorkerConfig) -> Self {
        Self {
            output_bucket: pipeline.output_bucket.clone(),
            metrics_namespace: pipeline.metrics_namespace.clone(),
            cost_per_image_usd: pipeline.cost_per_image_usd,
            poll_max_messages: worker.poll_max_messages,
            poll_wait: worker.poll_wait,
        }
    }
}

/// What happened to one event of a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Processed object written
    Completed,
    /// Already done, in flight or dropped; skipped
    Duplicate,
    /// Failed; leave the message for redelivery
    RetryLater,
    /// Failed for the last time; acknowledged and dropped
    Dropped,
}

impl EventOutcome {
    /// Whether this outcome allows the message to be acknowledged
    pub fn settles_message(&self) -> bool {
        !matches!(self, EventOutcome::RetryLater)
    }
}

struct ProcessedObject {
    processed_key: String,
    session_token: Option<String>,
}

pub struct Worker {
    id: usize,
    ports: PipelinePorts,
    ledger: Arc<ProcessingLedger>,
    settings: WorkerSettings,
    completions: mpsc::Sender<CompletionEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        id: usize,
        ports: PipelinePorts,
        ledger: Arc<ProcessingLedger>,
        settings: WorkerSettings,
        completions: mpsc::Sender<CompletionEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            ports,
            ledger,
            settings,
            completions,
            shutdown_rx,
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run until the shutdown signal flips
    pub async fn run(mut self) {
        info!(worker = self.id, "Worker started");

        loop {
            if self.shutdown_requested() {
                break;
            }

            // A receive that already started may hold messages; on shutdown it
            // is allowed to finish so process_batch can release them
            let poll = self
                .ports
                .queue
                .poll(self.settings.poll_max_messages, self.settings.poll_wait);
            tokio::pin!(poll);
            let mut stopping = false;
            let polled = loop {
                tokio::select! {
                    biased;
                    changed = self.shutdown_rx.changed(), if !stopping => {
                        if changed.is_err() || *self.shutdown_rx.borrow() {
                            debug!(worker = self.id, "Shutdown requested, finishing in-flight poll");
                            stopping = true;
                        }
                    }
                    polled = &mut poll => break polled,
                }
            };

            match polled {
                Ok(events) if events.is_empty() => {
                    debug!(worker = self.id, "No messages");
                }
                Ok(events) => self.process_batch(events).await,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "Queue poll failed, backing off");
                    tokio::select! {
                        _ = self.shutdown_rx.changed() => {}
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }

            if stopping {
                break;
            }
        }

        info!(worker = self.id, "Worker stopped");
    }

    /// Process one polled batch, message by message
    ///
    /// Once shutdown is requested the current event is finished and every
    /// message not yet started is released back to the queue.
    pub async fn process_batch(&self, events: Vec<UploadEvent>) {
        for (receipt, events) in group_by_receipt(events) {
            if self.shutdown_requested() {
                self.release(&receipt).await;
                continue;
            }

            let mut settled = true;
            let mut completions = Vec::new();

            for (index, event) in events.iter().enumerate() {
                if index > 0 && self.shutdown_requested() {
                    settled = false;
                    break;
                }
                let (outcome, completion) = self.handle_event(event).await;
                settled &= outcome.settles_message();
                completions.extend(completion);
            }

            if settled {
                self.acknowledge(&receipt).await;
            } else if self.shutdown_requested() {
                self.release(&receipt).await;
            }

            for completion in completions {
                self.hand_off(completion);
            }
        }
    }

    /// Run one event through the ledger state machine
    pub async fn handle_event(&self, event: &UploadEvent) -> (EventOutcome, Option<CompletionEvent>) {
        let key = event.object_key.as_str();
        let namespace = self.settings.metrics_namespace.as_str();

        let attempt = match self.ledger.begin(key) {
            Ok(Admission::Start { attempt }) => attempt,
            Ok(admission) => {
                debug!(worker = self.id, object_key = %key, ?admission, "Skipping duplicate delivery");
                self.ports
                    .metrics
                    .emit_counter(namespace, DUPLICATE_DELIVERIES, 1.0)
                    .await;
                return (EventOutcome::Duplicate, None);
            }
            Err(e) if e.is_transient() => {
                warn!(worker = self.id, object_key = %key, error = %e, "Ledger full, leaving message for redelivery");
                return (EventOutcome::RetryLater, None);
            }
            Err(e) => {
                error!(worker = self.id, object_key = %key, error = %e, "Rejecting event");
                self.ports
                    .metrics
                    .emit_counter(namespace, PROCESSING_FAILED, 1.0)
                    .await;
                return (EventOutcome::Dropped, None);
            }
        };

        debug!(worker = self.id, object_key = %key, attempt, "Processing upload");
        let started = Instant::now();

        match self.process(event).await {
            Ok(processed) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let metrics = &self.ports.metrics;
                metrics.emit_counter(namespace, IMAGES_PROCESSED, 1.0).await;
                metrics
                    .emit_gauge(namespace, PROCESSING_COST, self.settings.cost_per_image_usd)
                    .await;
                metrics
                    .emit_gauge(namespace, PROCESSING_DURATION_MS, duration_ms as f64)
                    .await;

                if let Err(e) = self.ledger.complete(key) {
                    warn!(worker = self.id, object_key = %key, error = %e, "Ledger lost track of completed key");
                }

                info!(
                    worker = self.id,
                    object_key = %key,
                    processed_key = %processed.processed_key,
                    duration_ms,
                    "Processed upload"
                );

                let completion = CompletionEvent::new(
                    key,
                    processed.processed_key,
                    processed.session_token,
                    MetricsSnapshot {
                        duration_ms,
                        cost_estimate: self.settings.cost_per_image_usd,
                    },
                );
                (EventOutcome::Completed, Some(completion))
            }
            Err(e) => self.record_failure(key, e).await,
        }
    }

    async fn record_failure(&self, key: &str, e: PipelineError) -> (EventOutcome, Option<CompletionEvent>) {
        match self.ledger.fail(key, e.to_string()) {
            Ok(FailureOutcome::Retry { attempts }) => {
                warn!(
                    worker = self.id,
                    object_key = %key,
                    attempts,
                    kind = e.kind(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "Processing failed, leaving message for redelivery"
                );
                (EventOutcome::RetryLater, None)
            }
            Ok(FailureOutcome::Dropped { attempts, last_error }) => {
                error!(
                    worker = self.id,
                    object_key = %key,
                    attempts,
                    kind = e.kind(),
                    last_error = %last_error,
                    "Dropping poison message after exhausting attempts"
                );
                self.ports
                    .metrics
                    .emit_counter(&self.settings.metrics_namespace, PROCESSING_FAILED, 1.0)
                    .await;
                (EventOutcome::Dropped, None)
            }
            Err(ledger_err) => {
                warn!(
                    worker = self.id,
                    object_key = %key,
                    error = %e,
                    ledger_error = %ledger_err,
                    "Processing failed and ledger entry is gone"
                );
                (EventOutcome::RetryLater, None)
            }
        }
    }

    /// Fetch, transform and store one object
    async fn process(&self, event: &UploadEvent) -> Result<ProcessedObject> {
        let source_key = event.storage_key();
        let source = self.ports.store.get(&event.bucket, source_key).await?;
        let session_token = source
            .metadata_value(SESSION_TOKEN_METADATA_KEY)
            .map(str::to_string);

        let engine = self.ports.transform.clone();
        let content_type = engine.content_type();
        let output = transform::apply_blocking(engine, source.data).await?;

        let mut object = StoredObject::new(output)
            .with_content_type(content_type)
            .with_metadata(SOURCE_KEY_METADATA_KEY, event.object_key.clone());
        if let Some(token) = &session_token {
            object = object.with_metadata(SESSION_TOKEN_METADATA_KEY, token.clone());
        }

        // Deterministic key: a redelivery overwrites rather than duplicates
        self.ports
            .store
            .put(&self.settings.output_bucket, source_key, object)
            .await?;

        Ok(ProcessedObject {
            processed_key: event.processed_key(&self.settings.output_bucket),
            session_token,
        })
    }

    /// Pass a completion to the bridge without waiting on it; the processed
    /// object is already stored, so a full or closed bridge only loses the
    /// notification
    fn hand_off(&self, completion: CompletionEvent) {
        match self.completions.try_send(completion) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(completion)) => {
                metrics::record_completion_event("dropped");
                warn!(
                    worker = self.id,
                    object_key = %completion.object_key,
                    "Publish bridge backlog full, completion event dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(completion)) => {
                metrics::record_completion_event("dropped");
                warn!(
                    worker = self.id,
                    object_key = %completion.object_key,
                    "Publish bridge is gone, completion event dropped"
                );
            }
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) {
        let result = self.ports.queue.ack(receipt).await;
        metrics::record_queue_operation("ack", result.is_ok());
        if let Err(e) = result {
            // The message will come back and be recognised as a duplicate
            warn!(worker = self.id, receipt = %receipt, error = %e, "Failed to acknowledge message");
        }
    }

    async fn release(&self, receipt: &ReceiptHandle) {
        let result = self.ports.queue.nack(receipt).await;
        metrics::record_queue_operation("nack", result.is_ok());
        match result {
            Ok(()) => debug!(worker = self.id, receipt = %receipt, "Released message on shutdown"),
            Err(e) => warn!(worker = self.id, receipt = %receipt, error = %e, "Failed to release message"),
        }
    }
}

/// Group events by receipt handle, keeping first-seen order
fn group_by_receipt(events: Vec<UploadEvent>) -> Vec<(ReceiptHandle, Vec<UploadEvent>)> {
    let mut groups: Vec<(ReceiptHandle, Vec<UploadEvent>)> = Vec::new();
    for event in events {
        match groups
            .iter_mut()
            .find(|(receipt, _)| *receipt == event.receipt_handle)
        {
            Some((_, group)) => group.push(event),
            None => groups.push((event.receipt_handle.clone(), vec![event])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetricsSink;
    use crate::queue::InMemoryQueue;
    use crate::transform::InvertTransform;
    use crate::error::TransformError;
    use bytes::Bytes;
    use idempotent_consumer::{LedgerConfig, ProcessingStatus};
    use object_store::InMemoryObjectStore;

    struct FailingTransform;

    impl TransformEngine for FailingTransform {
        fn apply(&self, _input: &[u8]) -> std::result::Result<Bytes, TransformError> {
            Err(TransformError::Decode("corrupt".to_string()))
        }
    }

    struct Harness {
        queue: Arc<InMemoryQueue>,
        store: Arc<InMemoryObjectStore>,
        metrics: Arc<InMemoryMetricsSink>,
        ledger: Arc<ProcessingLedger>,
        worker: Worker,
        completions: mpsc::Receiver<CompletionEvent>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    fn harness(transform: Arc<dyn TransformEngine>, max_attempts: u32) -> Harness {
        harness_with_handoff(transform, max_attempts, 16)
    }

    fn harness_with_handoff(
        transform: Arc<dyn TransformEngine>,
        max_attempts: u32,
        handoff_capacity: usize,
    ) -> Harness {
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(60), "uploads"));
        let store = Arc::new(InMemoryObjectStore::new());
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let ledger = Arc::new(ProcessingLedger::new(LedgerConfig {
            max_attempts,
            ..LedgerConfig::default()
        }));
        let (tx, completions) = mpsc::channel(handoff_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ports = PipelinePorts {
            queue: queue.clone(),
            store: store.clone(),
            transform,
            metrics: metrics.clone(),
        };
        let settings = WorkerSettings {
            output_bucket: "processed".to_string(),
            metrics_namespace: "PhotoPipeline".to_string(),
            cost_per_image_usd: 0.0005,
            poll_max_messages: 5,
            poll_wait: Duration::from_millis(10),
        };

        Harness {
            queue,
            store,
            metrics,
            ledger: ledger.clone(),
            worker: Worker::new(0, ports, ledger, settings, tx, shutdown_rx),
            completions,
            shutdown_tx,
        }
    }

    async fn upload(store: &InMemoryObjectStore, key: &str, session: Option<&str>) {
        let mut object = StoredObject::new(png_bytes()).with_content_type("image/png");
        if let Some(token) = session {
            object = object.with_metadata(SESSION_TOKEN_METADATA_KEY, token);
        }
        store.put("uploads", key, object).await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_event_writes_acks_and_hands_off() {
        let mut h = harness(Arc::new(InvertTransform::default()), 3);
        upload(&h.store, "photo1.png", Some("session-a")).await;
        h.queue.send_object_created("uploads", "photo1.png");

        let events = h.queue.poll(5, Duration::ZERO).await.unwrap();
        h.worker.process_batch(events).await;

        let processed = h.store.get("processed", "photo1.png").await.unwrap();
        assert_eq!(processed.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(processed.metadata_value(SOURCE_KEY_METADATA_KEY), Some("uploads/photo1.png"));
        assert!(h.queue.is_empty());
        assert_eq!(h.metrics.counter_total(IMAGES_PROCESSED), 1.0);
        assert_eq!(h.metrics.last_gauge(PROCESSING_COST), Some(0.0005));

        let completion = h.completions.try_recv().unwrap();
        assert_eq!(completion.object_key, "uploads/photo1.png");
        assert_eq!(completion.processed_key, "processed/photo1.png");
        assert_eq!(completion.session_token.as_deref(), Some("session-a"));
        assert_eq!(
            h.ledger.get("uploads/photo1.png").unwrap().status,
            ProcessingStatus::Done
        );
    }

    #[tokio::test]
    async fn test_stalled_bridge_does_not_block_processing() {
        // Nobody drains the hand-off channel, as during a topic outage
        let mut h = harness_with_handoff(Arc::new(InvertTransform::default()), 3, 1);
        upload(&h.store, "a.png", Some("session-a")).await;
        upload(&h.store, "b.png", Some("session-a")).await;
        h.queue.send_object_created("uploads", "a.png");
        h.queue.send_object_created("uploads", "b.png");

        let events = h.queue.poll(5, Duration::ZERO).await.unwrap();
        assert_eq!(events.len(), 2);
        tokio::time::timeout(Duration::from_secs(2), h.worker.process_batch(events))
            .await
            .expect("worker blocked on the publish hand-off");

        assert!(h.queue.is_empty());
        assert_eq!(h.metrics.counter_total(IMAGES_PROCESSED), 2.0);
        assert_eq!(h.store.object_count("processed"), 2);
        // One completion fit in the buffer, the other was dropped
        assert!(h.completions.try_recv().is_ok());
        assert!(h.completions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_is_acked_and_skipped() {
        let mut h = harness(Arc::new(InvertTransform::default()), 3);
        upload(&h.store, "a.png", None).await;

        h.queue.send_object_created("uploads", "a.png");
        h.queue.send_object_created("uploads", "a.png");
        let events = h.queue.poll(5, Duration::ZERO).await.unwrap();
        assert_eq!(events.len(), 2);

        h.worker.process_batch(events).await;

        assert!(h.queue.is_empty());
        assert_eq!(h.metrics.counter_total(IMAGES_PROCESSED), 1.0);
        assert_eq!(h.metrics.counter_total(DUPLICATE_DELIVERIES), 1.0);
        assert_eq!(h.store.object_count("processed"), 1);
        assert!(h.completions.try_recv().is_ok());
        assert!(h.completions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failure_leaves_message_until_budget_spent() {
        let h = harness(Arc::new(FailingTransform), 2);
        upload(&h.store, "bad.png", None).await;
        h.queue.send_object_created("uploads", "bad.png");

        let first = h.queue.poll(5, Duration::ZERO).await.unwrap();
        h.worker.process_batch(first.clone()).await;
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.metrics.emissions(PROCESSING_FAILED), 0);

        // Simulate redelivery by releasing the message
        h.queue.nack(&first[0].receipt_handle).await.unwrap();
        let second = h.queue.poll(5, Duration::ZERO).await.unwrap();
        h.worker.process_batch(second).await;

        assert!(h.queue.is_empty());
        assert_eq!(h.metrics.counter_total(PROCESSING_FAILED), 1.0);
        assert_eq!(h.store.object_count("processed"), 0);
        assert_eq!(
            h.ledger.get("uploads/bad.png").unwrap().status,
            ProcessingStatus::FailedDropped
        );
    }

    #[tokio::test]
    async fn test_missing_source_counts_as_failure() {
        let h = harness(Arc::new(InvertTransform::default()), 1);
        h.queue.send_object_created("uploads", "ghost.png");

        let events = h.queue.poll(5, Duration::ZERO).await.unwrap();
        h.worker.process_batch(events).await;

        assert!(h.queue.is_empty());
        assert_eq!(h.metrics.counter_total(PROCESSING_FAILED), 1.0);
        let record = h.ledger.get("uploads/ghost.png").unwrap();
        assert!(record.last_error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_unstarted_messages() {
        let h = harness(Arc::new(InvertTransform::default()), 3);
        upload(&h.store, "a.png", None).await;
        h.queue.send_object_created("uploads", "a.png");

        let events = h.queue.poll(5, Duration::ZERO).await.unwrap();
        h.shutdown_tx.send(true).unwrap();
        h.worker.process_batch(events).await;

        assert_eq!(h.queue.visible_len(), 1);
        assert!(h.ledger.get("uploads/a.png").is_none());
        assert_eq!(h.store.object_count("processed"), 0);
    }

    /// Receives at once, then holds the batch like a slow network round trip
    struct SlowReceiveQueue {
        inner: Arc<InMemoryQueue>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl NotificationQueue for SlowReceiveQueue {
        async fn poll(
            &self,
            max_messages: u32,
            _wait: Duration,
        ) -> std::result::Result<Vec<UploadEvent>, crate::error::QueueError> {
            let events = self.inner.poll(max_messages, Duration::ZERO).await?;
            tokio::time::sleep(self.delay).await;
            Ok(events)
        }

        async fn ack(&self, receipt: &ReceiptHandle) -> std::result::Result<(), crate::error::QueueError> {
            self.inner.ack(receipt).await
        }

        async fn nack(&self, receipt: &ReceiptHandle) -> std::result::Result<(), crate::error::QueueError> {
            self.inner.nack(receipt).await
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_poll_releases_received_messages() {
        let h = harness(Arc::new(InvertTransform::default()), 3);
        upload(&h.store, "a.png", None).await;
        h.queue.send_object_created("uploads", "a.png");

        let (tx, _completions) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ports = PipelinePorts {
            queue: Arc::new(SlowReceiveQueue {
                inner: h.queue.clone(),
                delay: Duration::from_millis(200),
            }),
            store: h.store.clone(),
            transform: Arc::new(InvertTransform::default()),
            metrics: h.metrics.clone(),
        };
        let settings = WorkerSettings {
            output_bucket: "processed".to_string(),
            metrics_namespace: "PhotoPipeline".to_string(),
            cost_per_image_usd: 0.0005,
            poll_max_messages: 5,
            poll_wait: Duration::from_secs(1),
        };
        let worker = Worker::new(1, ports, h.ledger.clone(), settings, tx, shutdown_rx);
        let handle = tokio::spawn(worker.run());

        // The message is already received and hidden when shutdown arrives
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.queue.visible_len(), 0);
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();

        assert_eq!(h.queue.visible_len(), 1);
        assert!(h.ledger.get("uploads/a.png").is_none());
        assert_eq!(h.store.object_count("processed"), 0);
    }

    #[test]
    fn test_group_by_receipt_keeps_order() {
        let a = ReceiptHandle::new("a");
        let b = ReceiptHandle::new("b");
        let events = vec![
            UploadEvent::new("uploads/1", "uploads", a.clone()),
            UploadEvent::new("uploads/2", "uploads", b.clone()),
            UploadEvent::new("uploads/3", "uploads", a.clone()),
        ];
        let groups = group_by_receipt(events);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, a);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, b);
    }
}
