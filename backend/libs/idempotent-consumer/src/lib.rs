//! # Idempotent Consumer Ledger
//!
//! Tracks the processing state of every object key seen by a worker group so
//! that at-least-once queue delivery never turns into duplicate side effects.
//!
//! ## Problem
//!
//! The upload queue redelivers a message whenever its visibility timeout
//! expires before it is acknowledged. Without a guard:
//! - **Duplicates**: the same upload is transformed and written twice
//! - **Double counting**: `ImagesProcessed` is emitted once per delivery
//! - **Poison messages**: an object that always fails is retried forever
//!
//! ## Solution
//!
//! A concurrent, bounded ledger keyed by object key:
//! - **Explicit state machine**: `Pending -> InProgress -> {Done, FailedRetry, FailedDropped}`
//! - **Visible attempt counter**: failures increment `attempts`; the caller
//!   learns whether to leave the message for redelivery or drop it
//! - **TTL window**: entries untouched for `ttl` are forgotten
//! - **Size bound**: expired entries are purged first, then the oldest
//!   settled entry is evicted; entries still in progress or awaiting
//!   redelivery are never evicted, so a retry budget cannot be reset
//!
//! ## Usage Example
//!
//! ```
//! use idempotent_consumer::{Admission, FailureOutcome, LedgerConfig, ProcessingLedger};
//!
//! let ledger = ProcessingLedger::new(LedgerConfig {
//!     max_attempts: 2,
//!     ..LedgerConfig::default()
//! });
//!
//! assert_eq!(ledger.begin("uploads/a.png").unwrap(), Admission::Start { attempt: 1 });
//! assert_eq!(ledger.begin("uploads/a.png").unwrap(), Admission::InFlight);
//!
//! let outcome = ledger.fail("uploads/a.png", "decode error").unwrap();
//! assert_eq!(outcome, FailureOutcome::Retry { attempts: 1 });
//!
//! assert_eq!(ledger.begin("uploads/a.png").unwrap(), Admission::Start { attempt: 2 });
//! ledger.complete("uploads/a.png").unwrap();
//! assert_eq!(ledger.begin("uploads/a.png").unwrap(), Admission::AlreadyDone);
//! ```
//!
//! ## Concurrency Safety
//!
//! Admission uses the map's entry API, so when several workers receive the
//! same key at once exactly one gets `Admission::Start`; the others see
//! `InFlight`. Share one ledger across a worker group with `Arc<ProcessingLedger>`.
//!
//! The size bound is enforced before admission, so concurrent admissions of
//! new keys may overshoot `max_entries` by at most the number of workers.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

mod error;

pub use error::{IdempotencyError, IdempotencyResult};

/// Maximum object key length accepted by the ledger (S3 limit)
pub const MAX_KEY_LEN: usize = 1024;

/// Processing status of one object key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Created, not yet admitted
    Pending,
    /// A worker holds the key
    InProgress,
    /// Processed object written; later deliveries are duplicates
    Done,
    /// Last attempt failed; the queue will redeliver
    FailedRetry,
    /// Attempt budget spent; the message was dropped
    FailedDropped,
}

impl ProcessingStatus {
    /// Done and dropped records are settled: no further work will happen
    pub fn is_settled(&self) -> bool {
        matches!(self, ProcessingStatus::Done | ProcessingStatus::FailedDropped)
    }
}

/// Ledger entry for one object key
#[derive(Debug, Clone)]
pub struct ProcessingRecord {
    pub object_key: String,
    pub status: ProcessingStatus,
    /// Number of failed attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: Instant,
    pub updated_at: Instant,
}

impl ProcessingRecord {
    fn new(object_key: &str, now: Instant) -> Self {
        Self {
            object_key: object_key.to_string(),
            status: ProcessingStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.updated_at) > ttl
    }

    fn transition(&mut self, status: ProcessingStatus, now: Instant) {
        debug!(
            object_key = %self.object_key,
            from = ?self.status,
            to = ?status,
            attempts = self.attempts,
            "Processing record transition"
        );
        self.status = status;
        self.updated_at = now;
    }
}

/// Outcome of trying to admit a delivery for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Caller now owns the key; `attempt` is 1-based
    Start { attempt: u32 },
    /// Already processed within the TTL window
    AlreadyDone,
    /// Another worker is processing the key
    InFlight,
    /// Previously dropped as a poison message within the TTL window
    AlreadyDropped,
}

impl Admission {
    /// Whether the delivery is a duplicate the caller should acknowledge and skip
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, Admission::Start { .. })
    }
}

/// What the caller must do with the message after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Leave the message unacknowledged so the queue redelivers it
    Retry { attempts: u32 },
    /// Acknowledge and drop; the attempt budget is spent
    Dropped { attempts: u32, last_error: String },
}

/// Ledger configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long a record is remembered after its last update
    pub ttl: Duration,
    /// Soft upper bound on the number of records
    pub max_entries: usize,
    /// In-progress records older than this are treated as abandoned
    /// (should match the queue's visibility timeout)
    pub in_progress_timeout: Duration,
    /// Failed attempts allowed before the message is dropped
    pub max_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_entries: 10_000,
            in_progress_timeout: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

/// Concurrent processing ledger shared by a worker group
pub struct ProcessingLedger {
    entries: DashMap<String, ProcessingRecord>,
    config: LedgerConfig,
}

impl ProcessingLedger {
    pub fn new(config: LedgerConfig) -> Self {
        info!(
            ttl = ?config.ttl,
            max_entries = config.max_entries,
            max_attempts = config.max_attempts,
            "Initializing processing ledger"
        );
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Try to take ownership of `object_key` for one processing attempt
    pub fn begin(&self, object_key: &str) -> IdempotencyResult<Admission> {
        Self::validate_key(object_key)?;
        let now = Instant::now();

        if !self.entries.contains_key(object_key) {
            self.make_room(now)?;
        }

        let admission = match self.entries.entry(object_key.to_string()) {
            Entry::Vacant(vacant) => {
                let mut record = ProcessingRecord::new(object_key, now);
                record.transition(ProcessingStatus::InProgress, now);
                vacant.insert(record);
                Admission::Start { attempt: 1 }
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_expired(self.config.ttl, now) {
                    *record = ProcessingRecord::new(object_key, now);
                }

                match record.status {
                    ProcessingStatus::Done => Admission::AlreadyDone,
                    ProcessingStatus::FailedDropped => Admission::AlreadyDropped,
                    ProcessingStatus::InProgress
                        if now.saturating_duration_since(record.updated_at)
                            < self.config.in_progress_timeout =>
                    {
                        Admission::InFlight
                    }
                    _ => {
                        if record.status == ProcessingStatus::InProgress {
                            warn!(
                                object_key = %object_key,
                                "Reclaiming abandoned in-progress record"
                            );
                        }
                        record.transition(ProcessingStatus::InProgress, now);
                        Admission::Start {
                            attempt: record.attempts + 1,
                        }
                    }
                }
            }
        };

        Ok(admission)
    }

    /// Mark the in-progress attempt as successful
    pub fn complete(&self, object_key: &str) -> IdempotencyResult<ProcessingRecord> {
        let mut record = self.in_progress_record(object_key, ProcessingStatus::Done)?;
        record.transition(ProcessingStatus::Done, Instant::now());
        Ok(record.clone())
    }

    /// Record a failed attempt and decide between redelivery and drop
    pub fn fail(
        &self,
        object_key: &str,
        error: impl Into<String>,
    ) -> IdempotencyResult<FailureOutcome> {
        let mut record = self.in_progress_record(object_key, ProcessingStatus::FailedRetry)?;
        let now = Instant::now();
        let error = error.into();

        record.attempts += 1;
        record.last_error = Some(error.clone());

        if record.attempts >= self.config.max_attempts {
            record.transition(ProcessingStatus::FailedDropped, now);
            Ok(FailureOutcome::Dropped {
                attempts: record.attempts,
                last_error: error,
            })
        } else {
            record.transition(ProcessingStatus::FailedRetry, now);
            Ok(FailureOutcome::Retry {
                attempts: record.attempts,
            })
        }
    }

    /// Snapshot of the record for `object_key`
    pub fn get(&self, object_key: &str) -> Option<ProcessingRecord> {
        self.entries.get(object_key).map(|r| r.value().clone())
    }

    /// Remove expired records that are not in progress
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        let ttl = self.config.ttl;
        self.entries.retain(|_, record| {
            record.status == ProcessingStatus::InProgress || !record.is_expired(ttl, now)
        });
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged, "Purged expired processing records");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn in_progress_record(
        &self,
        object_key: &str,
        to: ProcessingStatus,
    ) -> IdempotencyResult<dashmap::mapref::one::RefMut<'_, String, ProcessingRecord>> {
        let record = self
            .entries
            .get_mut(object_key)
            .ok_or_else(|| IdempotencyError::UnknownKey(object_key.to_string()))?;

        if record.status != ProcessingStatus::InProgress {
            return Err(IdempotencyError::InvalidTransition {
                key: object_key.to_string(),
                from: record.status,
                to,
            });
        }

        Ok(record)
    }

    fn make_room(&self, now: Instant) -> IdempotencyResult<()> {
        if self.entries.len() < self.config.max_entries {
            return Ok(());
        }

        self.purge_expired();
        if self.entries.len() < self.config.max_entries {
            return Ok(());
        }

        let oldest = self
            .entries
            .iter()
            .filter(|r| r.status.is_settled())
            .min_by_key(|r| r.updated_at)
            .map(|r| (r.key().clone(), r.updated_at));

        match oldest {
            Some((key, updated_at)) => {
                self.entries.remove(&key);
                debug!(
                    evicted = %key,
                    age = ?now.saturating_duration_since(updated_at),
                    "Evicted oldest settled record"
                );
                Ok(())
            }
            None => Err(IdempotencyError::CapacityExhausted(self.config.max_entries)),
        }
    }

    fn validate_key(object_key: &str) -> IdempotencyResult<()> {
        if object_key.is_empty() {
            return Err(IdempotencyError::InvalidKey(
                "Object key cannot be empty".to_string(),
            ));
        }

        if object_key.len() > MAX_KEY_LEN {
            return Err(IdempotencyError::InvalidKey(format!(
                "Object key too long: {} bytes (max {})",
                object_key.len(),
                MAX_KEY_LEN
            )));
        }

        Ok(())
    }
}

impl Default for ProcessingLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}
