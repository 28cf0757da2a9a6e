use async_trait::async_trait;
use lifesync_sync::memory::MemoryBackend;
use lifesync_sync::{
    ChangeFeed, ChangeHandlers, ChangeListener, ChannelRegistry, ChannelStatus, RealtimeTransport,
    SubscriptionError, SyncConfig, SyncResult,
};
use lifesync_types::{ChannelKey, CollectionName, EntityId, Row, RowChange, UserId};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn changes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| !e.starts_with("status:"))
            .collect()
    }

    fn statuses(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with("status:"))
            .collect()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ChangeListener for Recorder {
    fn on_insert(&self, row: &Row) {
        self.push(format!("insert:{}", row.entity_id().unwrap()));
    }

    fn on_update(&self, row: &Row) {
        self.push(format!("update:{}", row.entity_id().unwrap()));
    }

    fn on_delete(&self, id: &EntityId) {
        self.push(format!("delete:{id}"));
    }

    fn on_status(&self, status: &ChannelStatus) {
        let name = match status {
            ChannelStatus::Degraded(_) => "Degraded".to_string(),
            other => format!("{other:?}"),
        };
        self.push(format!("status:{name}"));
    }
}

struct Panicker;

impl ChangeListener for Panicker {
    fn on_insert(&self, _row: &Row) {
        panic!("listener bug");
    }

    fn on_update(&self, _row: &Row) {
        panic!("listener bug");
    }

    fn on_delete(&self, _id: &EntityId) {
        panic!("listener bug");
    }
}

/// Memory transport that records the order of opens and completed closes.
/// Closing takes a few milliseconds, like a network round trip.
#[derive(Default)]
struct OrderedTransport {
    inner: MemoryBackend,
    log: Mutex<Vec<&'static str>>,
}

impl OrderedTransport {
    fn log(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl RealtimeTransport for OrderedTransport {
    async fn open(&self, key: &ChannelKey) -> SyncResult<ChangeFeed> {
        self.log.lock().unwrap().push("open");
        self.inner.open(key).await
    }

    async fn close(&self, key: &ChannelKey) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.inner.close(key).await;
        self.log.lock().unwrap().push("close");
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup(config: SyncConfig) -> (Arc<MemoryBackend>, ChannelRegistry, ChannelKey) {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let registry = ChannelRegistry::new(backend.clone(), config);
    let key = ChannelKey::new(CollectionName::new("meals").unwrap(), UserId::new());
    (backend, registry, key)
}

fn row(id: &str, owner: &UserId) -> Row {
    Row::from_value(json!({ "id": id, "user_id": owner.to_string(), "name": "Oatmeal" })).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ── Reference counting ───────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn channel_opened_once_for_many_listeners() {
    let (backend, registry, key) = setup(SyncConfig::default());

    let _a = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    let _b = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    settle().await;

    assert_eq!(backend.open_count(&key), 1);
    assert_eq!(registry.channel_count(), 1);
    assert_eq!(registry.listener_count(&key), 2);
}

#[tokio::test(start_paused = true)]
async fn channels_are_keyed_by_user() {
    let (backend, registry, key) = setup(SyncConfig::default());
    let other = ChannelKey::new(key.collection.clone(), UserId::new());

    let _a = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    let _b = registry.subscribe(other.clone(), Arc::new(Recorder::default()));
    settle().await;

    assert_eq!(registry.channel_count(), 2);
    assert_eq!(backend.open_count(&key), 1);
    assert_eq!(backend.open_count(&other), 1);
}

#[tokio::test(start_paused = true)]
async fn last_unsubscribe_closes_after_grace() {
    let (backend, registry, key) = setup(SyncConfig::default());

    let a = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    let b = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    settle().await;

    a.unsubscribe();
    assert!(registry.is_open(&key));
    b.unsubscribe();
    assert!(registry.is_open(&key), "closing waits for the grace period");
    assert_eq!(registry.listener_count(&key), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!registry.is_open(&key));
    assert_eq!(backend.open_count(&key), 1);
    assert_eq!(backend.close_count(&key), 1);
}

#[tokio::test(start_paused = true)]
async fn resubscribe_within_grace_reuses_channel() {
    let (backend, registry, key) = setup(SyncConfig::default());

    let sub = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    settle().await;
    sub.unsubscribe();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let _again = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(registry.is_open(&key));
    assert_eq!(backend.open_count(&key), 1);
    assert_eq!(backend.close_count(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_grace_closes_immediately() {
    let (backend, registry, key) = setup(SyncConfig {
        teardown_grace_ms: 0,
        ..Default::default()
    });

    let sub = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    settle().await;
    sub.unsubscribe();
    assert!(!registry.is_open(&key));

    settle().await;
    assert_eq!(backend.close_count(&key), 1);
}

#[tokio::test(start_paused = true)]
async fn reopen_waits_for_previous_close() {
    init_tracing();
    let transport = Arc::new(OrderedTransport::default());
    let registry = ChannelRegistry::new(
        transport.clone(),
        SyncConfig {
            teardown_grace_ms: 0,
            ..Default::default()
        },
    );
    let key = ChannelKey::new(CollectionName::new("meals").unwrap(), UserId::new());

    let first = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    settle().await;
    first.unsubscribe();

    let recorder = Arc::new(Recorder::default());
    let _second = registry.subscribe(key.clone(), recorder.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(transport.log(), vec!["open", "close", "open"]);
    assert_eq!(transport.inner.live_feeds(&key), 1);
    assert_eq!(recorder.statuses(), vec!["status:Connected"]);

    transport.inner.emit(&key, RowChange::insert(row("1", &key.user)));
    settle().await;
    assert_eq!(recorder.changes(), vec!["insert:1"]);
}

#[tokio::test(start_paused = true)]
async fn rapid_reopens_keep_open_close_paired() {
    init_tracing();
    let transport = Arc::new(OrderedTransport::default());
    let registry = ChannelRegistry::new(
        transport.clone(),
        SyncConfig {
            teardown_grace_ms: 0,
            ..Default::default()
        },
    );
    let key = ChannelKey::new(CollectionName::new("meals").unwrap(), UserId::new());

    for _ in 0..3 {
        let sub = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        sub.unsubscribe();
    }
    let _last = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        transport.log(),
        vec!["open", "close", "open", "close", "open", "close", "open"]
    );
}

#[tokio::test(start_paused = true)]
async fn dropping_subscription_unsubscribes() {
    let (_backend, registry, key) = setup(SyncConfig::default());

    {
        let _sub = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
        assert_eq!(registry.listener_count(&key), 1);
    }
    assert_eq!(registry.listener_count(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn subscription_ids_are_distinct() {
    let (_backend, registry, key) = setup(SyncConfig::default());
    let a = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    let b = registry.subscribe(key.clone(), Arc::new(Recorder::default()));

    assert_ne!(a.id(), b.id());
    assert_eq!(a.key(), &key);
}

// ── Delivery ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn events_delivered_in_transport_order() {
    let (backend, registry, key) = setup(SyncConfig::default());
    let recorder = Arc::new(Recorder::default());
    let _sub = registry.subscribe(key.clone(), recorder.clone());
    settle().await;

    backend.emit(&key, RowChange::insert(row("1", &key.user)));
    backend.emit(&key, RowChange::update(row("1", &key.user)));
    backend.emit(&key, RowChange::delete(row("1", &key.user)));
    settle().await;

    assert_eq!(recorder.changes(), vec!["insert:1", "update:1", "delete:1"]);
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_listener_stops_receiving() {
    let (backend, registry, key) = setup(SyncConfig::default());
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let a = registry.subscribe(key.clone(), first.clone());
    let _b = registry.subscribe(key.clone(), second.clone());
    settle().await;

    a.unsubscribe();
    backend.emit(&key, RowChange::insert(row("1", &key.user)));
    settle().await;

    assert!(first.changes().is_empty());
    assert_eq!(second.changes(), vec!["insert:1"]);
    assert_eq!(backend.open_count(&key), 1);
    assert_eq!(backend.close_count(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn rows_of_other_users_are_dropped() {
    let (backend, registry, key) = setup(SyncConfig::default());
    let recorder = Arc::new(Recorder::default());
    let _sub = registry.subscribe(key.clone(), recorder.clone());
    settle().await;

    backend.emit(&key, RowChange::insert(row("1", &UserId::new())));
    backend.emit(&key, RowChange::insert(row("2", &key.user)));
    settle().await;

    assert_eq!(recorder.changes(), vec!["insert:2"]);
}

#[tokio::test(start_paused = true)]
async fn delete_without_id_is_dropped() {
    let (backend, registry, key) = setup(SyncConfig::default());
    let recorder = Arc::new(Recorder::default());
    let _sub = registry.subscribe(key.clone(), recorder.clone());
    settle().await;

    backend.emit(&key, RowChange::delete(Row::new()));
    backend.emit(&key, RowChange::delete(row("3", &key.user)));
    settle().await;

    assert_eq!(recorder.changes(), vec!["delete:3"]);
}

#[tokio::test(start_paused = true)]
async fn panicking_listener_does_not_affect_others() {
    let (backend, registry, key) = setup(SyncConfig::default());
    let recorder = Arc::new(Recorder::default());
    let _bad = registry.subscribe(key.clone(), Arc::new(Panicker));
    let _good = registry.subscribe(key.clone(), recorder.clone());
    settle().await;

    backend.emit(&key, RowChange::insert(row("1", &key.user)));
    backend.emit(&key, RowChange::insert(row("2", &key.user)));
    settle().await;

    assert_eq!(recorder.changes(), vec!["insert:1", "insert:2"]);
}

#[tokio::test(start_paused = true)]
async fn closure_handlers_receive_events() {
    let (backend, registry, key) = setup(SyncConfig::default());
    let inserts = Arc::new(AtomicUsize::new(0));
    let deletes = Arc::new(AtomicUsize::new(0));

    let handlers = {
        let inserts = inserts.clone();
        let deletes = deletes.clone();
        ChangeHandlers::new(
            move |_| {
                inserts.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
            move |_| {
                deletes.fetch_add(1, Ordering::SeqCst);
            },
        )
    };
    let _sub = registry.subscribe_with(key.clone(), handlers);
    settle().await;

    backend.emit(&key, RowChange::insert(row("1", &key.user)));
    backend.emit(&key, RowChange::delete(row("1", &key.user)));
    settle().await;

    assert_eq!(inserts.load(Ordering::SeqCst), 1);
    assert_eq!(deletes.load(Ordering::SeqCst), 1);
}

// ── Status & reconnection ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connected_status_reported() {
    let (_backend, registry, key) = setup(SyncConfig::default());
    let recorder = Arc::new(Recorder::default());
    let _sub = registry.subscribe(key.clone(), recorder.clone());
    assert_eq!(registry.channel_status(&key), Some(ChannelStatus::Connecting));
    settle().await;

    assert_eq!(recorder.statuses(), vec!["status:Connected"]);
    assert_eq!(registry.channel_status(&key), Some(ChannelStatus::Connected));
}

#[tokio::test(start_paused = true)]
async fn late_listener_told_current_status() {
    let (_backend, registry, key) = setup(SyncConfig::default());
    let _first = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    settle().await;

    let late = Arc::new(Recorder::default());
    let _second = registry.subscribe(key.clone(), late.clone());
    assert_eq!(late.statuses(), vec!["status:Connected"]);
}

#[tokio::test(start_paused = true)]
async fn dropped_feed_reconnects() {
    let (backend, registry, key) = setup(SyncConfig::default());
    let recorder = Arc::new(Recorder::default());
    let _sub = registry.subscribe(key.clone(), recorder.clone());
    settle().await;

    backend.disconnect(&key);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        recorder.statuses(),
        vec!["status:Connected", "status:Reconnecting", "status:Reconnected"]
    );
    assert_eq!(backend.open_count(&key), 2);
    assert_eq!(backend.close_count(&key), 1);

    backend.emit(&key, RowChange::insert(row("1", &key.user)));
    settle().await;
    assert_eq!(recorder.changes(), vec!["insert:1"]);
}

#[tokio::test(start_paused = true)]
async fn retries_exhausted_degrades_once() {
    let (backend, registry, key) = setup(SyncConfig {
        reconnect_attempts: 2,
        reconnect_backoff_ms: 10,
        ..Default::default()
    });
    backend.fail_next_opens(10);

    let recorder = Arc::new(Recorder::default());
    let _sub = registry.subscribe(key.clone(), recorder.clone());
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(recorder.statuses(), vec!["status:Degraded"]);
    assert_eq!(backend.open_count(&key), 0);
    assert_eq!(
        registry.channel_status(&key),
        Some(ChannelStatus::Degraded(SubscriptionError::RetriesExhausted {
            key: key.clone(),
            attempts: 2,
        }))
    );

    let late = Arc::new(Recorder::default());
    let _late = registry.subscribe(key.clone(), late.clone());
    assert_eq!(late.statuses(), vec!["status:Degraded"]);
}

#[tokio::test(start_paused = true)]
async fn transient_open_failure_recovers() {
    let (backend, registry, key) = setup(SyncConfig::default());
    backend.fail_next_opens(1);

    let recorder = Arc::new(Recorder::default());
    let _sub = registry.subscribe(key.clone(), recorder.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(recorder.statuses(), vec!["status:Connected"]);
    assert_eq!(backend.open_count(&key), 1);
}

#[tokio::test(start_paused = true)]
async fn closing_a_degraded_channel_removes_it() {
    let (backend, registry, key) = setup(SyncConfig {
        reconnect_attempts: 0,
        teardown_grace_ms: 0,
        ..Default::default()
    });
    backend.fail_next_opens(1);

    let sub = registry.subscribe(key.clone(), Arc::new(Recorder::default()));
    settle().await;
    assert!(matches!(
        registry.channel_status(&key),
        Some(ChannelStatus::Degraded(_))
    ));

    sub.unsubscribe();
    assert!(!registry.is_open(&key));
}
