//! Flushing manager
//!
//! Drains the pending record store into the tracking API. At most one flush
//! runs at a time; a second caller gets [`FlushResult::AlreadyInProgress`]
//! instead of waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::runtime::Handle;

use crate::db::Database;
use crate::error::{DeliveryError, Error, Result, StorageError};
use crate::reachability::Reachability;
use crate::tracking::TrackingRepository;
use crate::types::{FlushResult, FlushingMode, PendingRecord, RecordId, RecordProxy};

use super::schedule::ScheduleState;

/// Callback invoked after a customer update is delivered
pub type CustomerIdentifiedHandler = Arc<dyn Fn() + Send + Sync>;

/// What happened to a single record during a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    /// Transient failure, record untouched
    Kept,
    Retried,
    Discarded,
}

/// Statistics from one flush cycle
#[derive(Debug, Default)]
struct FlushStats {
    delivered: usize,
    kept: usize,
    retried: usize,
    discarded: usize,
}

impl FlushStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered => self.delivered += 1,
            Outcome::Kept => self.kept += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Discarded => self.discarded += 1,
        }
    }
}

/// Holds the flush lock; releases it on drop.
struct FlushGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlushGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard { flag })
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Delivers pending records and applies the retry policy to failures.
pub struct FlushingManager {
    store: Arc<Database>,
    repository: Arc<dyn TrackingRepository>,
    reachability: Arc<dyn Reachability>,
    max_retries: u32,
    is_flushing: AtomicBool,
    customer_identified: RwLock<Option<CustomerIdentifiedHandler>>,
    pub(super) schedule: Mutex<ScheduleState>,
    pub(super) delayed_flush_pending: AtomicBool,
    pub(super) immediate_delay: Duration,
    pub(super) runtime: Handle,
    pub(super) this: Weak<FlushingManager>,
}

impl FlushingManager {
    /// Create a manager in manual mode.
    ///
    /// Must be called from within a tokio runtime; timers and delayed
    /// flushes are spawned on it.
    pub fn new(
        store: Arc<Database>,
        repository: Arc<dyn TrackingRepository>,
        reachability: Arc<dyn Reachability>,
        max_retries: u32,
        immediate_delay: Duration,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::Runtime(format!("flushing requires a tokio runtime: {}", e))
        })?;

        Ok(Arc::new_cyclic(|this| Self {
            store,
            repository,
            reachability,
            max_retries: max_retries.max(1),
            is_flushing: AtomicBool::new(false),
            customer_identified: RwLock::new(None),
            schedule: Mutex::new(ScheduleState::new(FlushingMode::Manual)),
            delayed_flush_pending: AtomicBool::new(false),
            immediate_delay,
            runtime,
            this: this.clone(),
        }))
    }

    /// Register the callback run after each delivered customer update.
    pub fn on_customer_identified(&self, handler: impl Fn() + Send + Sync + 'static) {
        let mut slot = self
            .customer_identified
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(Arc::new(handler));
    }

    /// True while a flush runs or the store holds any record.
    pub fn has_pending_data(&self) -> bool {
        if self.is_flushing.load(Ordering::Acquire) {
            return true;
        }
        self.store.has_any_pending().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to check for pending records");
            false
        })
    }

    /// Deliver every record currently in the store.
    ///
    /// Customer updates go first, then events, each in insertion order.
    /// Records appended while the flush runs wait for the next one.
    pub async fn flush(&self) -> FlushResult {
        let Some(_guard) = FlushGuard::try_acquire(&self.is_flushing) else {
            tracing::debug!("Flush already in progress");
            return FlushResult::AlreadyInProgress;
        };

        if !self.reachability.is_connected().await {
            tracing::warn!("Skipping flush, no connection");
            return FlushResult::NoConnection;
        }

        let (updates, events) = match self.snapshot() {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read pending records");
                return FlushResult::Error(e);
            }
        };

        let total = updates.len() + events.len();
        if total == 0 {
            tracing::debug!("Nothing to flush");
            return FlushResult::Success(0);
        }

        tracing::info!(
            customer_updates = updates.len(),
            events = events.len(),
            "Flushing pending records"
        );

        let records: Vec<PendingRecord> = updates.into_iter().chain(events).collect();
        let outcomes = join_all(records.iter().map(|record| self.deliver(record))).await;

        let mut stats = FlushStats::default();
        for outcome in outcomes {
            stats.record(outcome);
        }
        tracing::info!(
            count = total,
            delivered = stats.delivered,
            kept = stats.kept,
            retried = stats.retried,
            discarded = stats.discarded,
            "Flush complete"
        );

        FlushResult::Success(total)
    }

    fn snapshot(&self) -> std::result::Result<(Vec<PendingRecord>, Vec<PendingRecord>), StorageError> {
        let updates = self.store.fetch_all_customer_updates()?;
        let events = self.store.fetch_all_events()?;
        Ok((updates, events))
    }

    async fn deliver(&self, record: &PendingRecord) -> Outcome {
        if !record.has_customer() {
            tracing::debug!(record_id = %record.id, "Record has no customer ids, discarding");
            self.delete(record.id);
            return Outcome::Discarded;
        }

        let proxy = record.proxy();
        let result = self.repository.send(record).await;
        if result.is_ok() && record.is_customer_update() {
            self.notify_customer_identified();
        }
        self.resolve(proxy, result)
    }

    /// Apply the retry policy to one send result.
    ///
    /// Works from the id and retry count seen at fetch time only.
    fn resolve(&self, record: RecordProxy, result: std::result::Result<(), DeliveryError>) -> Outcome {
        match result {
            Ok(()) => {
                tracing::debug!(record_id = %record.id, "Record delivered");
                self.delete(record.id);
                Outcome::Delivered
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    record_id = %record.id,
                    retries = record.retries,
                    error = %e,
                    "Delivery failed, will retry on next flush"
                );
                Outcome::Kept
            }
            Err(e) => {
                if record.retries + 1 >= self.max_retries {
                    tracing::warn!(
                        record_id = %record.id,
                        retries = record.retries,
                        error = %e,
                        "Delivery failed too many times, discarding record"
                    );
                    self.delete(record.id);
                    return Outcome::Discarded;
                }

                tracing::warn!(
                    record_id = %record.id,
                    retries = record.retries,
                    error = %e,
                    "Delivery rejected, increasing retry count"
                );
                match self.store.increment_retry(record.id) {
                    Ok(()) => {}
                    Err(StorageError::NotFound(id)) => {
                        tracing::debug!(record_id = %id, "Record vanished before retry update");
                    }
                    Err(e) => {
                        tracing::error!(record_id = %record.id, error = %e, "Failed to update retry count");
                    }
                }
                Outcome::Retried
            }
        }
    }

    /// Delete failures leave the record to be sent again next time.
    fn delete(&self, id: RecordId) {
        if let Err(e) = self.store.delete(id) {
            tracing::error!(
                record_id = %id,
                error = %e,
                "Failed to delete record, it may be delivered twice"
            );
        }
    }

    fn notify_customer_identified(&self) {
        let handler = self
            .customer_identified
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}
