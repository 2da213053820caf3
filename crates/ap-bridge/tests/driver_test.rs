//! Snapshot driver: timer publish, event forwarding and burst coalescing.

use std::sync::Arc;
use std::time::Duration;

use ap_bridge::driver::SnapshotDriver;
use ap_bridge::event_bus::EventBus;
use ap_bridge::git::ProjectScanner;
use ap_bridge::hub::{Hub, Subscription};
use ap_bridge::metrics::MetricsScanner;
use ap_bridge::protocol::{events, BridgeMessage, EventPayload};
use ap_bridge::snapshot::{Labels, RuntimeProbe, SnapshotAssembler};
use ap_core::log_ring::LogRing;
use ap_core::task_store::TaskStore;
use ap_core::types::{Priority, TaskId};
use tokio_util::sync::CancellationToken;

// ===========================================================================
// Helpers
// ===========================================================================

struct IdleProbe;

impl RuntimeProbe for IdleProbe {
    fn is_running(&self, _id: TaskId) -> bool {
        false
    }
    fn is_generating(&self, _id: TaskId) -> bool {
        false
    }
    fn running_projects(&self) -> Vec<String> {
        Vec::new()
    }
    fn pause_reason(&self) -> Option<String> {
        None
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<TaskStore>,
    bus: EventBus,
    hub: Hub,
    driver: SnapshotDriver,
    refresh: ap_bridge::driver::RefreshHandle,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TaskStore::new(dir.path().join("tasks.json")));
    let assembler = Arc::new(SnapshotAssembler::new(
        store.clone(),
        Arc::new(LogRing::in_memory(100)),
        Arc::new(IdleProbe),
        ProjectScanner::new(dir.path().join("projects")),
        MetricsScanner::new(dir.path().join("claude")),
        Labels::default(),
    ));
    let bus = EventBus::new();
    let hub = Hub::new(64);
    let (driver, refresh) = SnapshotDriver::new(assembler, hub.clone(), bus.clone());
    Fixture {
        _dir: dir,
        store,
        bus,
        hub,
        driver: driver.with_interval(Duration::from_secs(60)),
        refresh,
    }
}

fn drain(sub: &Subscription) -> (usize, usize) {
    let mut snapshots = 0;
    let mut events = 0;
    while let Some(msg) = sub.try_recv() {
        match &*msg {
            BridgeMessage::Snapshot(_) => snapshots += 1,
            BridgeMessage::Event(_) => events += 1,
            BridgeMessage::Error { .. } => {}
        }
    }
    (snapshots, events)
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn publishes_initial_snapshot() {
    let fx = fixture();
    let sub = fx.hub.subscribe();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(fx.driver.run(cancel.clone()));

    let msg = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(&*msg, BridgeMessage::Snapshot(_)));

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn burst_of_events_coalesces_into_one_publish() {
    let fx = fixture();
    let sub = fx.hub.subscribe();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(fx.driver.run(cancel.clone()));

    // Let the initial tick publish.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (initial, _) = drain(&sub);
    assert_eq!(initial, 1);

    for n in 0..10 {
        fx.bus.emit(EventPayload::for_project(events::TASK_CHANGED, "demo", format!("e{n}")));
    }
    tokio::time::sleep(Duration::from_millis(600)).await;

    let (snapshots, forwarded) = drain(&sub);
    assert_eq!(forwarded, 10, "every event is forwarded to the hub");
    assert_eq!(snapshots, 1, "the burst coalesces into a single snapshot");

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn explicit_refresh_reflects_latest_store_state() {
    let fx = fixture();
    let sub = fx.hub.subscribe();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(fx.driver.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    drain(&sub);

    let task = fx.store.add("demo", "hello", Priority::Med).unwrap();
    fx.refresh.request();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let mut seen = false;
    while let Some(msg) = sub.try_recv() {
        if let BridgeMessage::Snapshot(snap) = &*msg {
            seen = snap.task(task.id).is_some();
        }
    }
    assert!(seen);

    cancel.cancel();
    handle.await.unwrap();
}
