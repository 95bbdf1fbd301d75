//! Automatic flush triggers
//!
//! Immediate mode debounces tracking calls into one delayed flush. Periodic
//! mode runs a timer task, but only while the application is in the
//! foreground. Switching modes aborts whatever the previous mode started.

use std::sync::atomic::Ordering;
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::types::{FlushResult, FlushingMode};

use super::FlushingManager;

/// Shortest period a periodic timer runs with
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Mutable scheduling state of a [`FlushingManager`]
pub(crate) struct ScheduleState {
    mode: FlushingMode,
    foreground: bool,
    timer: Option<JoinHandle<()>>,
    /// Immediate-mode delay still running; its flush has not started yet
    delayed: Option<JoinHandle<()>>,
}

impl ScheduleState {
    pub(crate) fn new(mode: FlushingMode) -> Self {
        Self {
            mode,
            foreground: true,
            timer: None,
            delayed: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            tracing::debug!("Stopped periodic flush timer");
        }
    }

    fn cancel_delayed(&mut self) {
        if let Some(delayed) = self.delayed.take() {
            delayed.abort();
            tracing::debug!("Cancelled delayed flush");
        }
    }
}

impl Drop for ScheduleState {
    fn drop(&mut self) {
        self.cancel_timer();
        self.cancel_delayed();
    }
}

impl FlushingManager {
    fn schedule_state(&self) -> MutexGuard<'_, ScheduleState> {
        self.schedule
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn flushing_mode(&self) -> FlushingMode {
        self.schedule_state().mode
    }

    /// Switch modes, cancelling the previous mode's timer and any delayed
    /// flush that has not started yet.
    pub fn set_flushing_mode(&self, mode: FlushingMode) {
        {
            let mut state = self.schedule_state();
            state.cancel_timer();
            state.cancel_delayed();
            self.delayed_flush_pending.store(false, Ordering::Release);
            state.mode = mode;
            if let Some(period) = mode.period() {
                if state.foreground {
                    state.timer = Some(self.spawn_periodic(period));
                }
            }
        }
        tracing::info!(mode = %mode, "Flushing mode set");

        if mode == FlushingMode::Immediate {
            self.schedule_immediate_flush();
        }
    }

    /// Called after a record is durably appended.
    ///
    /// In immediate mode this schedules a flush after the debounce delay;
    /// calls made while one is already scheduled are coalesced into it.
    pub fn schedule_immediate_flush(&self) {
        let mut state = self.schedule_state();
        if state.mode != FlushingMode::Immediate {
            return;
        }
        if self.delayed_flush_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = self.this.clone();
        let delay = self.immediate_delay;
        let runtime = self.runtime.clone();
        state.delayed = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = this.upgrade() else {
                return;
            };
            manager.delayed_flush_pending.store(false, Ordering::Release);
            // Detached, so a later mode switch cannot abort a send midway
            runtime.spawn(async move {
                log_result("immediate", manager.flush().await);
            });
        }));
    }

    /// Resume periodic flushing
    pub fn application_did_become_active(&self) {
        let mut state = self.schedule_state();
        state.foreground = true;
        if let Some(period) = state.mode.period() {
            if state.timer.is_none() {
                state.timer = Some(self.spawn_periodic(period));
            }
        }
    }

    /// Pause periodic flushing
    pub fn application_did_enter_background(&self) {
        let mut state = self.schedule_state();
        state.foreground = false;
        state.cancel_timer();
    }

    fn spawn_periodic(&self, period: Duration) -> JoinHandle<()> {
        let period = if period < MIN_PERIOD {
            tracing::warn!(
                period_ms = period.as_millis() as u64,
                "Periodic flush period too short, using 1s"
            );
            MIN_PERIOD
        } else {
            period
        };
        tracing::debug!(period_secs = period.as_secs(), "Started periodic flush timer");
        let this = self.this.clone();
        self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = this.upgrade() else {
                    break;
                };
                log_result("periodic", manager.flush().await);
            }
        })
    }
}

fn log_result(trigger: &str, result: FlushResult) {
    match result {
        FlushResult::Success(count) => {
            tracing::debug!(trigger, count, "Scheduled flush finished");
        }
        FlushResult::AlreadyInProgress => {
            tracing::debug!(trigger, "Scheduled flush skipped, another flush is running");
        }
        FlushResult::NoConnection => {
            tracing::debug!(trigger, "Scheduled flush skipped, no connection");
        }
        FlushResult::Error(e) => {
            tracing::warn!(trigger, error = %e, "Scheduled flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::DeliveryError;
    use crate::reachability::StaticReachability;
    use crate::tracking::TrackingRepository;
    use crate::types::{DataRecord, PendingRecord, RecordKind};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingRepository {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TrackingRepository for CountingRepository {
        async fn send(&self, _record: &PendingRecord) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup() -> (Arc<Database>, Arc<CountingRepository>, Arc<FlushingManager>) {
        let store = Database::open_in_memory().unwrap();
        store.migrate().unwrap();
        store.ensure_cookie().unwrap();
        let store = Arc::new(store);
        let repository = Arc::new(CountingRepository::default());
        let manager = FlushingManager::new(
            store.clone(),
            repository.clone(),
            Arc::new(StaticReachability::default()),
            5,
            Duration::from_millis(3000),
        )
        .unwrap();
        (store, repository, manager)
    }

    fn add_event(store: &Database) {
        store
            .append(
                RecordKind::Event,
                &[
                    DataRecord::ProjectToken("token".to_string()),
                    DataRecord::EventType("tick".to_string()),
                ],
            )
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_mode_coalesces_bursts() {
        let (store, repository, manager) = setup();
        manager.set_flushing_mode(FlushingMode::Immediate);

        for _ in 0..3 {
            add_event(&store);
            manager.schedule_immediate_flush();
        }

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(repository.calls.load(Ordering::SeqCst), 3);
        assert!(!store.has_any_pending().unwrap());
        assert!(!manager.delayed_flush_pending.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_mode_never_flushes() {
        let (store, repository, manager) = setup();
        add_event(&store);
        manager.schedule_immediate_flush();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(repository.calls.load(Ordering::SeqCst), 0);
        assert!(store.has_any_pending().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_mode_flushes_only_in_foreground() {
        let (store, repository, manager) = setup();
        manager.set_flushing_mode(FlushingMode::Periodic(10));
        add_event(&store);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(repository.calls.load(Ordering::SeqCst), 1);

        manager.application_did_enter_background();
        add_event(&store);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(repository.calls.load(Ordering::SeqCst), 1);

        manager.application_did_become_active();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(repository.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_mode_cancels_timer() {
        let (store, repository, manager) = setup();
        manager.set_flushing_mode(FlushingMode::Periodic(10));
        manager.set_flushing_mode(FlushingMode::Manual);
        assert_eq!(manager.flushing_mode(), FlushingMode::Manual);

        add_event(&store);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(repository.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_to_manual_cancels_delayed_flush() {
        let (store, repository, manager) = setup();
        manager.set_flushing_mode(FlushingMode::Immediate);
        add_event(&store);
        manager.schedule_immediate_flush();

        manager.set_flushing_mode(FlushingMode::Manual);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(repository.calls.load(Ordering::SeqCst), 0);
        assert!(store.has_any_pending().unwrap());
        assert!(!manager.delayed_flush_pending.load(Ordering::SeqCst));

        // Back in immediate mode a new delayed flush can be scheduled
        manager.set_flushing_mode(FlushingMode::Immediate);
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_eq!(repository.calls.load(Ordering::SeqCst), 1);
        assert!(!store.has_any_pending().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_runs_at_minimum_period() {
        let (store, repository, manager) = setup();
        manager.set_flushing_mode(FlushingMode::Periodic(0));
        assert_eq!(manager.flushing_mode(), FlushingMode::Periodic(0));
        add_event(&store);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(repository.calls.load(Ordering::SeqCst), 1);

        add_event(&store);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(repository.calls.load(Ordering::SeqCst), 2);
    }
}
