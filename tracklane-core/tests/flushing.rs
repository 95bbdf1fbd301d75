//! Integration tests for the flushing pipeline
//!
//! These tests drive the store and the flushing manager through a scripted
//! tracking repository, so every send is observable and no server is needed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{Notify, Semaphore};
use tracklane_core::{
    DataRecord, Database, DeliveryError, FlushResult, FlushingManager, PendingRecord, Properties,
    RecordId, RecordKind, StaticReachability, TrackingRepository,
};

/// Tracking repository answering from a script, falling back to a fixed result.
struct ScriptedRepository {
    script: Mutex<VecDeque<Result<(), DeliveryError>>>,
    fallback: Result<(), DeliveryError>,
    sent: Mutex<Vec<PendingRecord>>,
    started: Notify,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedRepository {
    fn answering(fallback: Result<(), DeliveryError>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            sent: Mutex::new(Vec::new()),
            started: Notify::new(),
            gate: None,
        })
    }

    fn scripted(script: Vec<Result<(), DeliveryError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: Ok(()),
            sent: Mutex::new(Vec::new()),
            started: Notify::new(),
            gate: None,
        })
    }

    /// Every send blocks until a permit is added to `gate`
    fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(()),
            sent: Mutex::new(Vec::new()),
            started: Notify::new(),
            gate: Some(gate),
        })
    }

    fn sent(&self) -> Vec<PendingRecord> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrackingRepository for ScriptedRepository {
    async fn send(&self, record: &PendingRecord) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(record.clone());
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

fn store() -> Arc<Database> {
    let db = Database::open_in_memory().unwrap();
    db.migrate().unwrap();
    db.ensure_cookie().unwrap();
    Arc::new(db)
}

fn manager(store: &Arc<Database>, repository: Arc<ScriptedRepository>) -> Arc<FlushingManager> {
    FlushingManager::new(
        store.clone(),
        repository,
        Arc::new(StaticReachability::default()),
        5,
        Duration::from_secs(3),
    )
    .unwrap()
}

fn props(value: serde_json::Value) -> Properties {
    value.as_object().cloned().unwrap()
}

fn track(store: &Database, event_type: &str) -> RecordId {
    store
        .append(
            RecordKind::Event,
            &[
                DataRecord::ProjectToken("token".to_string()),
                DataRecord::EventType(event_type.to_string()),
            ],
        )
        .unwrap()
}

// ============================================
// Flush lock
// ============================================

#[tokio::test]
async fn test_at_most_one_concurrent_flush() {
    tracklane_core::logging::init_test();
    let store = store();
    track(&store, "purchase");

    let gate = Arc::new(Semaphore::new(0));
    let repository = ScriptedRepository::gated(gate.clone());
    let manager = manager(&store, repository.clone());

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.flush().await })
    };
    repository.started.notified().await;

    let others = futures::future::join_all((0..5).map(|_| manager.flush())).await;
    assert!(others
        .iter()
        .all(|result| *result == FlushResult::AlreadyInProgress));
    assert!(manager.has_pending_data());

    gate.add_permits(1);
    assert_eq!(running.await.unwrap(), FlushResult::Success(1));
    assert_eq!(repository.sent().len(), 1);

    // Lock is free again
    assert_eq!(manager.flush().await, FlushResult::Success(0));
}

#[tokio::test]
async fn test_records_added_during_flush_wait_for_next() {
    let store = store();
    track(&store, "first");

    let gate = Arc::new(Semaphore::new(0));
    let repository = ScriptedRepository::gated(gate.clone());
    let manager = manager(&store, repository.clone());

    let running = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.flush().await })
    };
    repository.started.notified().await;
    track(&store, "second");

    gate.add_permits(1);
    assert_eq!(running.await.unwrap(), FlushResult::Success(1));
    assert_eq!(store.count_events().unwrap(), 1);

    gate.add_permits(1);
    assert_eq!(manager.flush().await, FlushResult::Success(1));
    let sent: Vec<_> = repository
        .sent()
        .into_iter()
        .filter_map(|r| r.event_type)
        .collect();
    assert_eq!(sent, vec!["first", "second"]);
}

// ============================================
// Ordering
// ============================================

#[tokio::test]
async fn test_fifo_delivery_order() {
    let store = store();
    for i in 1..=5 {
        store
            .append(
                RecordKind::CustomerUpdate,
                &[
                    DataRecord::ProjectToken("token".to_string()),
                    DataRecord::Properties(props(json!({ "id": i }))),
                ],
            )
            .unwrap();
    }

    let repository = ScriptedRepository::answering(Ok(()));
    let manager = manager(&store, repository.clone());
    assert_eq!(manager.flush().await, FlushResult::Success(5));

    let ids: Vec<i64> = repository
        .sent()
        .iter()
        .map(|r| r.properties["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_customer_updates_sent_before_events() {
    let store = store();
    track(&store, "early_event");
    store
        .append(
            RecordKind::CustomerUpdate,
            &[DataRecord::ProjectToken("token".to_string())],
        )
        .unwrap();

    let repository = ScriptedRepository::answering(Ok(()));
    let manager = manager(&store, repository.clone());
    manager.flush().await;

    let kinds: Vec<RecordKind> = repository.sent().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![RecordKind::CustomerUpdate, RecordKind::Event]);
}

// ============================================
// Retry policy
// ============================================

#[tokio::test]
async fn test_retry_ceiling_discards_record() {
    tracklane_core::logging::init_test();
    let store = store();
    let id = track(&store, "purchase");
    let repository =
        ScriptedRepository::answering(Err(DeliveryError::BadRequest("I'm a teapot".into())));
    let manager = manager(&store, repository.clone());

    for expected in 1..=4 {
        assert_eq!(manager.flush().await, FlushResult::Success(1));
        assert_eq!(store.get(id).unwrap().unwrap().retries, expected);
    }

    assert_eq!(manager.flush().await, FlushResult::Success(1));
    assert!(store.get(id).unwrap().is_none());
    assert_eq!(repository.sent().len(), 5);
}

#[tokio::test]
async fn test_server_errors_never_consume_retries() {
    let store = store();
    let id = track(&store, "purchase");
    let repository = ScriptedRepository::answering(Err(DeliveryError::Server(None)));
    let manager = manager(&store, repository.clone());

    for _ in 0..10 {
        assert_eq!(manager.flush().await, FlushResult::Success(1));
    }
    assert_eq!(store.get(id).unwrap().unwrap().retries, 0);
    assert_eq!(repository.sent().len(), 10);
}

#[tokio::test]
async fn test_one_failure_does_not_abort_batch() {
    let store = store();
    let first = track(&store, "a");
    let second = track(&store, "b");
    let third = track(&store, "c");

    let repository = ScriptedRepository::scripted(vec![
        Ok(()),
        Err(DeliveryError::NotFound(None)),
        Err(DeliveryError::Connection("reset".into())),
    ]);
    let manager = manager(&store, repository);

    assert_eq!(manager.flush().await, FlushResult::Success(3));
    assert!(store.get(first).unwrap().is_none());
    assert_eq!(store.get(second).unwrap().unwrap().retries, 1);
    assert_eq!(store.get(third).unwrap().unwrap().retries, 0);
}

#[tokio::test]
async fn test_empty_customer_ids_skip_network() {
    // No cookie: records carry no customer ids
    let db = Database::open_in_memory().unwrap();
    db.migrate().unwrap();
    let store = Arc::new(db);
    let id = track(&store, "orphan");

    let repository = ScriptedRepository::answering(Ok(()));
    let manager = manager(&store, repository.clone());

    assert_eq!(manager.flush().await, FlushResult::Success(1));
    assert!(repository.sent().is_empty());
    assert!(store.get(id).unwrap().is_none());
}

// ============================================
// Store contract
// ============================================

#[test]
fn test_idempotent_delete() {
    let store = store();
    let id = track(&store, "purchase");
    store.delete(id).unwrap();
    store.delete(id).unwrap();
    store.delete(RecordId(424242)).unwrap();
}

#[test]
fn test_property_merge() {
    let store = store();
    store
        .append(
            RecordKind::Event,
            &[
                DataRecord::ProjectToken("token".to_string()),
                DataRecord::EventType("merge".to_string()),
                DataRecord::Properties(props(json!({"a": 1, "shared": "old"}))),
                DataRecord::Properties(props(json!({"b": 2, "shared": "new"}))),
            ],
        )
        .unwrap();

    let events = store.fetch_all_events().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(
        serde_json::Value::Object(events[0].properties.clone()),
        json!({"a": 1, "b": 2, "shared": "new"})
    );
}

#[tokio::test]
async fn test_has_pending_data() {
    let store = store();
    let manager = manager(&store, ScriptedRepository::answering(Ok(())));
    assert!(!manager.has_pending_data());

    track(&store, "purchase");
    assert!(manager.has_pending_data());

    assert_eq!(manager.flush().await, FlushResult::Success(1));
    assert!(!manager.has_pending_data());
}

#[tokio::test]
async fn test_offline_flush_keeps_records() {
    let store = store();
    track(&store, "purchase");
    let reachability = Arc::new(StaticReachability::new(false));
    let repository = ScriptedRepository::answering(Ok(()));
    let manager = FlushingManager::new(
        store.clone(),
        repository.clone(),
        reachability.clone(),
        5,
        Duration::from_secs(3),
    )
    .unwrap();

    assert_eq!(manager.flush().await, FlushResult::NoConnection);
    assert!(repository.sent().is_empty());

    reachability.set_connected(true);
    assert_eq!(manager.flush().await, FlushResult::Success(1));
}
