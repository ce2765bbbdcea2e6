//! One live connection: its lifecycle state and bounded outbox

use crate::error::ConnectionError;
use chrono::{DateTime, Utc};
use event_schema::LiveUpdatePayload;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `Connecting -> Open -> (Draining | Closed)`, `Draining -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Draining = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }

    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closed)
                | (Open, Draining)
                | (Open, Closed)
                | (Draining, Closed)
        )
    }
}

/// Result of offering an event to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    /// Buffer was at the high-water mark; the oldest event was discarded
    DroppedOldest,
    /// Buffer has been overflowing longer than the drain timeout
    Stalled,
    /// Connection is not open
    Rejected,
}

#[derive(Debug)]
struct Outbox {
    events: VecDeque<Arc<LiveUpdatePayload>>,
    last_seen: Instant,
    overflow_since: Option<Instant>,
    draining_since: Option<Instant>,
    drain_cause: Option<&'static str>,
    close_reason: Option<ConnectionError>,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    session_token: String,
    created_at: DateTime<Utc>,
    high_water_mark: usize,
    drain_timeout: Duration,
    state: AtomicU8,
    outbox: Mutex<Outbox>,
    notify: Notify,
}

impl Connection {
    pub(crate) fn new(
        session_token: impl Into<String>,
        high_water_mark: usize,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            session_token: session_token.into(),
            created_at: Utc::now(),
            high_water_mark: high_water_mark.max(1),
            drain_timeout,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            outbox: Mutex::new(Outbox {
                events: VecDeque::with_capacity(high_water_mark.clamp(1, 64)),
                last_seen: Instant::now(),
                overflow_since: None,
                draining_since: None,
                drain_cause: None,
                close_reason: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn buffered(&self) -> usize {
        self.outbox.lock().events.len()
    }

    pub fn last_seen(&self) -> Instant {
        self.outbox.lock().last_seen
    }

    pub fn close_reason(&self) -> Option<ConnectionError> {
        self.outbox.lock().close_reason.clone()
    }

    pub(crate) fn drain_cause(&self) -> Option<&'static str> {
        self.outbox.lock().drain_cause
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ConnectionState::from_u8(current);
            if !from.can_become(next) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(
                        connection_id = %self.id,
                        from = ?from,
                        to = ?next,
                        "Connection state changed"
                    );
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn open(&self) -> bool {
        self.transition(ConnectionState::Open)
    }

    /// Buffer an event for delivery. Never waits on the consumer.
    pub(crate) fn push(&self, payload: Arc<LiveUpdatePayload>, now: Instant) -> PushOutcome {
        let mut outbox = self.outbox.lock();
        if self.state() != ConnectionState::Open {
            return PushOutcome::Rejected;
        }

        if let Some(since) = outbox.overflow_since {
            if now.saturating_duration_since(since) > self.drain_timeout {
                return PushOutcome::Stalled;
            }
        }

        let mut outcome = PushOutcome::Buffered;
        if outbox.events.len() >= self.high_water_mark {
            outbox.events.pop_front();
            outbox.overflow_since.get_or_insert(now);
            outcome = PushOutcome::DroppedOldest;
        }

        outbox.events.push_back(payload);
        outbox.last_seen = now;
        drop(outbox);

        self.notify.notify_one();
        outcome
    }

    /// Take the next buffered event; an emptied buffer clears any overflow
    pub(crate) fn pop(&self) -> Option<Arc<LiveUpdatePayload>> {
        let mut outbox = self.outbox.lock();
        let event = outbox.events.pop_front();
        if event.is_some() {
            outbox.last_seen = Instant::now();
        }
        if outbox.events.is_empty() {
            outbox.overflow_since = None;
        }
        event
    }

    pub(crate) fn touch(&self, now: Instant) {
        self.outbox.lock().last_seen = now;
    }

    pub(crate) fn overflow_expired(&self, now: Instant) -> bool {
        self.outbox
            .lock()
            .overflow_since
            .map(|since| now.saturating_duration_since(since) > self.drain_timeout)
            .unwrap_or(false)
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.outbox.lock().last_seen)
    }

    pub(crate) fn draining_for(&self, now: Instant) -> Option<Duration> {
        self.outbox
            .lock()
            .draining_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// Stop accepting events; buffered events may still be read
    pub(crate) fn begin_draining(&self, now: Instant, cause: &'static str) -> bool {
        let mut outbox = self.outbox.lock();
        if !self.transition(ConnectionState::Draining) {
            return false;
        }
        outbox.draining_since = Some(now);
        outbox.drain_cause = Some(cause);
        drop(outbox);

        self.notify.notify_one();
        true
    }

    /// Close and release the buffer
    pub(crate) fn close(&self, reason: Option<ConnectionError>) -> bool {
        let mut outbox = self.outbox.lock();
        if !self.transition(ConnectionState::Closed) {
            return false;
        }
        outbox.events.clear();
        outbox.overflow_since = None;
        outbox.close_reason = reason;
        drop(outbox);

        self.notify.notify_one();
        true
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }
}
