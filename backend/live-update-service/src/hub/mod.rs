//! Subscriber fan-out hub
//!
//! Routes completion events to the live connections registered under the
//! event's session token. The connection index is split into shards keyed
//! by token, so connect/disconnect/dispatch only ever lock one shard. Each
//! shard has its own dispatch loop fed by its own channel, and each
//! connection buffers into its own bounded outbox. Dispatch never
//! waits on a client: a full outbox drops its oldest event and a
//! connection that stays overflowed past the drain timeout is cut off.
//!
//! There is no replay. An event whose token has no live connection is
//! discarded; clients that missed an update poll `GET /processed`.

mod connection;

pub use connection::{Connection, ConnectionId, ConnectionState, PushOutcome};

use crate::config::HubConfig;
use crate::error::ConnectionError;
use crate::metrics;
use event_schema::{CompletionEvent, LiveUpdatePayload};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest session token accepted from a client
pub const MAX_SESSION_TOKEN_LEN: usize = 256;

#[derive(Default)]
struct Shard {
    index: RwLock<HashMap<String, Vec<Arc<Connection>>>>,
}

/// What one dispatch did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dropped_oldest: usize,
    pub disconnected: usize,
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub draining: usize,
    pub closed: usize,
    pub slow_consumers: usize,
}

pub struct FanoutHub {
    shards: Vec<Shard>,
    config: HubConfig,
    accepting: AtomicBool,
}

impl FanoutHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        let shards = (0..config.shards.max(1)).map(|_| Shard::default()).collect();
        info!(
            shards = config.shards.max(1),
            high_water_mark = config.high_water_mark,
            "Fan-out hub initialised"
        );

        Arc::new(Self {
            shards,
            config,
            accepting: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, session_token: &str) -> &Shard {
        &self.shards[shard_slot(session_token, self.shards.len())]
    }

    /// Register a live connection for `session_token`
    pub fn subscribe(self: &Arc<Self>, session_token: &str) -> Result<Subscription, ConnectionError> {
        let token = session_token.trim();
        if token.is_empty() || token.len() > MAX_SESSION_TOKEN_LEN {
            return Err(ConnectionError::InvalidSession);
        }
        if !self.accepting.load(Ordering::Acquire) {
            return Err(ConnectionError::ShuttingDown);
        }

        let connection = Arc::new(Connection::new(
            token,
            self.config.high_water_mark,
            self.config.drain_timeout,
        ));

        {
            let mut index = self.shard(token).index.write();
            connection.open();
            index
                .entry(token.to_string())
                .or_default()
                .push(connection.clone());
        }

        metrics::connection_opened();
        debug!(
            connection_id = %connection.id(),
            session = %token,
            "Live connection opened"
        );

        Ok(Subscription {
            connection,
            hub: self.clone(),
        })
    }

    /// Buffer `event` for every open connection under its session token
    pub fn dispatch(&self, event: &CompletionEvent) -> DispatchReport {
        let mut report = DispatchReport::default();

        let Some(token) = event.session_token.as_deref().filter(|t| !t.is_empty()) else {
            metrics::event_dropped("no_session");
            debug!(object_key = %event.object_key, "Completion event has no session token");
            return report;
        };

        let payload: Arc<LiveUpdatePayload> = Arc::new(event.live_payload());
        let now = Instant::now();
        let mut stalled = Vec::new();

        {
            let index = self.shard(token).index.read();
            let Some(connections) = index.get(token) else {
                metrics::event_dropped("no_subscriber");
                debug!(
                    object_key = %event.object_key,
                    session = %token,
                    "No live subscriber for completion event"
                );
                return report;
            };

            for connection in connections {
                match connection.push(payload.clone(), now) {
                    PushOutcome::Buffered => {
                        report.delivered += 1;
                        metrics::event_delivered();
                    }
                    PushOutcome::DroppedOldest => {
                        report.delivered += 1;
                        report.dropped_oldest += 1;
                        metrics::event_delivered();
                        metrics::event_dropped("overflow");
                    }
                    PushOutcome::Stalled => stalled.push(connection.clone()),
                    PushOutcome::Rejected => {}
                }
            }
        }

        for connection in stalled {
            let reason = ConnectionError::SlowConsumer(connection.id().to_string());
            if self.disconnect(&connection, reason, "slow_consumer") {
                report.disconnected += 1;
            }
        }

        report
    }

    /// Advance idle, draining and overflowing connections
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for connection in self.connections() {
            if connection.overflow_expired(now) {
                let reason = ConnectionError::SlowConsumer(connection.id().to_string());
                if self.disconnect(&connection, reason, "slow_consumer") {
                    report.slow_consumers += 1;
                }
                continue;
            }

            match connection.state() {
                ConnectionState::Open => {
                    if connection.idle_for(now) >= self.config.idle_timeout
                        && connection.begin_draining(now, "idle")
                    {
                        report.draining += 1;
                    }
                }
                ConnectionState::Draining => {
                    let expired = connection
                        .draining_for(now)
                        .map(|elapsed| elapsed >= self.config.grace_period)
                        .unwrap_or(true);
                    if expired {
                        let cause = connection.drain_cause().unwrap_or("idle");
                        let reason = if cause == "shutdown" {
                            ConnectionError::ShuttingDown
                        } else {
                            ConnectionError::IdleTimeout(connection.id().to_string())
                        };
                        if self.disconnect(&connection, reason, cause) {
                            report.closed += 1;
                        }
                    }
                }
                ConnectionState::Closed => {
                    self.detach(&connection);
                }
                ConnectionState::Connecting => {}
            }
        }

        if report != SweepReport::default() {
            debug!(?report, remaining = self.connection_count(), "Hub sweep");
        }
        report
    }

    /// Drain every connection, wait `grace`, then close whatever is left
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);

        let now = Instant::now();
        let connections = self.connections();
        for connection in &connections {
            connection.begin_draining(now, "shutdown");
        }
        info!(
            connections = connections.len(),
            grace_ms = grace.as_millis() as u64,
            "Hub draining for shutdown"
        );

        if !connections.is_empty() {
            tokio::time::sleep(grace).await;
        }

        for connection in self.connections() {
            self.disconnect(&connection, ConnectionError::ShuttingDown, "shutdown");
        }
        info!("Hub closed");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.index.read().values().map(Vec::len).sum::<usize>())
            .sum()
    }

    pub fn session_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.index.read().len()).sum()
    }

    pub fn subscriber_count(&self, session_token: &str) -> usize {
        self.shard(session_token)
            .index
            .read()
            .get(session_token)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .index
                    .read()
                    .values()
                    .flatten()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn disconnect(&self, connection: &Arc<Connection>, reason: ConnectionError, cause: &str) -> bool {
        connection.close(Some(reason.clone()));
        if !self.detach(connection) {
            return false;
        }

        metrics::connection_closed(cause);
        if cause == "slow_consumer" {
            warn!(
                connection_id = %connection.id(),
                session = %connection.session_token(),
                error = %reason,
                "Disconnected slow live-update consumer"
            );
        } else {
            debug!(
                connection_id = %connection.id(),
                cause,
                "Live connection closed"
            );
        }
        true
    }

    /// Remove from the index; false if it was already gone
    fn detach(&self, connection: &Connection) -> bool {
        let token = connection.session_token();
        let mut index = self.shard(token).index.write();
        let Some(connections) = index.get_mut(token) else {
            return false;
        };

        let before = connections.len();
        connections.retain(|c| c.id() != connection.id());
        let removed = connections.len() < before;
        if connections.is_empty() {
            index.remove(token);
        }
        removed
    }
}

fn shard_slot(session_token: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    session_token.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Receiving end of one live connection
///
/// Dropping it is the client disconnect: the connection is closed and
/// leaves the index immediately.
pub struct Subscription {
    connection: Arc<Connection>,
    hub: Arc<FanoutHub>,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn session_token(&self) -> &str {
        self.connection.session_token()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Why the hub closed this connection, if it did
    pub fn close_reason(&self) -> Option<ConnectionError> {
        self.connection.close_reason()
    }

    /// Record client activity
    pub fn touch(&self) {
        self.connection.touch(Instant::now());
    }

    /// Next buffered event; `None` once the connection is draining and
    /// empty, or closed
    pub async fn next(&self) -> Option<Arc<LiveUpdatePayload>> {
        loop {
            if let Some(payload) = self.connection.pop() {
                return Some(payload);
            }
            match self.connection.state() {
                ConnectionState::Draining | ConnectionState::Closed => return None,
                _ => {}
            }
            self.connection.notified().await;
        }
    }

    pub fn try_next(&self) -> Option<Arc<LiveUpdatePayload>> {
        self.connection.pop()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let cause = self.connection.drain_cause().unwrap_or("client");
        self.connection.close(None);
        if self.hub.detach(&self.connection) {
            metrics::connection_closed(cause);
            debug!(
                connection_id = %self.connection.id(),
                cause,
                "Live connection released"
            );
        }
    }
}

/// Handle used to hand completion events to the shard dispatchers without waiting
#[derive(Clone)]
pub struct EventSender {
    shards: Vec<mpsc::Sender<CompletionEvent>>,
}

impl EventSender {
    /// Queue an event on its shard's dispatcher; false if it had to be discarded
    pub fn submit(&self, event: CompletionEvent) -> bool {
        let slot = shard_slot(event.session_token.as_deref().unwrap_or(""), self.shards.len());
        match self.shards[slot].try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::event_dropped("backlog");
                warn!(
                    object_key = %event.object_key,
                    shard = slot,
                    "Dispatcher backlog full, event discarded"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(object_key = %event.object_key, shard = slot, "Dispatcher stopped, event discarded");
                false
            }
        }
    }
}

/// One bounded channel per hub shard, `buffer` events deep each
pub fn event_channel(
    hub: &FanoutHub,
    buffer: usize,
) -> (EventSender, Vec<mpsc::Receiver<CompletionEvent>>) {
    let (senders, receivers) = (0..hub.shard_count())
        .map(|_| mpsc::channel(buffer.max(1)))
        .unzip();
    (EventSender { shards: senders }, receivers)
}

/// Spawn one dispatch loop per shard receiver
pub fn spawn_dispatchers(
    hub: &Arc<FanoutHub>,
    receivers: Vec<mpsc::Receiver<CompletionEvent>>,
) -> Vec<JoinHandle<()>> {
    receivers
        .into_iter()
        .enumerate()
        .map(|(shard, rx)| tokio::spawn(run_dispatcher(hub.clone(), shard, rx)))
        .collect()
}

/// Dispatch loop for one shard: one `dispatch` per inbound event until
/// every sender is gone
pub async fn run_dispatcher(
    hub: Arc<FanoutHub>,
    shard: usize,
    mut rx: mpsc::Receiver<CompletionEvent>,
) {
    debug!(shard, "Hub dispatcher started");
    while let Some(event) = rx.recv().await {
        let report = hub.dispatch(&event);
        debug!(
            shard,
            object_key = %event.object_key,
            delivered = report.delivered,
            dropped_oldest = report.dropped_oldest,
            disconnected = report.disconnected,
            "Completion event dispatched"
        );
    }
    debug!(shard, "Hub dispatcher stopped");
}

/// Periodic sweep until shutdown is signalled
pub async fn run_sweeper(hub: Arc<FanoutHub>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(hub.config().sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                hub.sweep(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_schema::MetricsSnapshot;

    fn hub_with(high_water_mark: usize) -> Arc<FanoutHub> {
        FanoutHub::new(HubConfig {
            high_water_mark,
            drain_timeout: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(60),
            grace_period: Duration::from_millis(20),
            ..HubConfig::default()
        })
    }

    fn completion(key: &str, session: Option<&str>) -> CompletionEvent {
        CompletionEvent::new(
            format!("uploads/{key}"),
            format!("processed/{key}"),
            session.map(str::to_string),
            MetricsSnapshot {
                duration_ms: 5,
                cost_estimate: 0.0005,
            },
        )
    }

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let hub = hub_with(8);
        let subscription = hub.subscribe("session-a").unwrap();
        assert_eq!(subscription.state(), ConnectionState::Open);
        assert_eq!(hub.subscriber_count("session-a"), 1);

        let report = hub.dispatch(&completion("photo1.png", Some("session-a")));
        assert_eq!(report.delivered, 1);

        let payload = subscription.next().await.unwrap();
        assert_eq!(payload.object_key, "uploads/photo1.png");
        assert_eq!(payload.processed_key, "processed/photo1.png");
    }

    #[tokio::test]
    async fn test_rejects_blank_session() {
        let hub = hub_with(8);
        assert_eq!(hub.subscribe("   ").err(), Some(ConnectionError::InvalidSession));
        let long = "x".repeat(MAX_SESSION_TOKEN_LEN + 1);
        assert_eq!(hub.subscribe(&long).err(), Some(ConnectionError::InvalidSession));
    }

    #[tokio::test]
    async fn test_event_without_subscriber_is_discarded() {
        let hub = hub_with(8);
        assert_eq!(
            hub.dispatch(&completion("a.png", Some("nobody"))),
            DispatchReport::default()
        );
        assert_eq!(hub.dispatch(&completion("a.png", None)), DispatchReport::default());
    }

    #[tokio::test]
    async fn test_no_backfill_for_late_subscriber() {
        let hub = hub_with(8);
        hub.dispatch(&completion("early.png", Some("session-a")));

        let subscription = hub.subscribe("session-a").unwrap();
        assert!(subscription.try_next().is_none());
    }

    #[tokio::test]
    async fn test_multiple_connections_same_session() {
        let hub = hub_with(8);
        let first = hub.subscribe("session-a").unwrap();
        let second = hub.subscribe("session-a").unwrap();
        assert_eq!(hub.connection_count(), 2);
        assert_eq!(hub.session_count(), 1);

        let report = hub.dispatch(&completion("a.png", Some("session-a")));
        assert_eq!(report.delivered, 2);
        assert!(first.try_next().is_some());
        assert!(second.try_next().is_some());
    }

    #[tokio::test]
    async fn test_drop_removes_subscription() {
        let hub = hub_with(8);
        let subscription = hub.subscribe("session-a").unwrap();
        let connection = subscription.connection().clone();

        drop(subscription);

        assert_eq!(hub.connection_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_stalled_consumer_disconnected_on_dispatch() {
        let hub = hub_with(1);
        let slow = hub.subscribe("session-a").unwrap();

        hub.dispatch(&completion("1.png", Some("session-a")));
        let report = hub.dispatch(&completion("2.png", Some("session-a")));
        assert_eq!(report.dropped_oldest, 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let report = hub.dispatch(&completion("3.png", Some("session-a")));

        assert_eq!(report.disconnected, 1);
        assert_eq!(slow.state(), ConnectionState::Closed);
        assert!(matches!(slow.close_reason(), Some(ConnectionError::SlowConsumer(_))));
        assert!(slow.next().await.is_none());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_idle_then_close_after_grace() {
        let hub = FanoutHub::new(HubConfig {
            idle_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(2),
            ..HubConfig::default()
        });
        let subscription = hub.subscribe("session-a").unwrap();
        let start = Instant::now();

        assert_eq!(hub.sweep(start + Duration::from_secs(1)), SweepReport::default());

        let idle = start + Duration::from_secs(11);
        assert_eq!(hub.sweep(idle).draining, 1);
        assert_eq!(subscription.state(), ConnectionState::Draining);
        // Draining connections accept no new events
        assert_eq!(hub.dispatch(&completion("a.png", Some("session-a"))).delivered, 0);

        assert_eq!(hub.sweep(idle + Duration::from_secs(3)).closed, 1);
        assert_eq!(subscription.state(), ConnectionState::Closed);
        assert!(matches!(
            subscription.close_reason(),
            Some(ConnectionError::IdleTimeout(_))
        ));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_closes() {
        let hub = hub_with(8);
        let subscription = hub.subscribe("session-a").unwrap();
        hub.dispatch(&completion("a.png", Some("session-a")));

        let hub_clone = hub.clone();
        let shutdown = tokio::spawn(async move {
            hub_clone.shutdown(Duration::from_millis(50)).await;
        });

        // Buffered event is still readable while draining
        let payload = subscription.next().await.unwrap();
        assert_eq!(payload.object_key, "uploads/a.png");
        assert!(subscription.next().await.is_none());

        shutdown.await.unwrap();
        assert!(!hub.is_accepting());
        assert_eq!(hub.subscribe("session-b").err(), Some(ConnectionError::ShuttingDown));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shard_dispatchers_route_submitted_events() {
        let hub = hub_with(8);
        let a = hub.subscribe("session-a").unwrap();
        let b = hub.subscribe("session-b").unwrap();
        let (sender, receivers) = event_channel(&hub, 4);
        assert_eq!(receivers.len(), hub.shard_count());
        let dispatchers = spawn_dispatchers(&hub, receivers);

        assert!(sender.submit(completion("a.png", Some("session-a"))));
        assert!(sender.submit(completion("b.png", Some("session-b"))));
        for (subscription, expected) in [(&a, "uploads/a.png"), (&b, "uploads/b.png")] {
            let payload = tokio::time::timeout(Duration::from_secs(1), subscription.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(payload.object_key, expected);
        }

        drop(sender);
        for dispatcher in dispatchers {
            dispatcher.await.unwrap();
        }
    }
}
