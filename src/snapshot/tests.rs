use super::*;
use crate::event::NewEvent;
use crate::store::{Database, EventStore};
use serde_json::json;
use uuid::Uuid;

struct Fixture {
    events: Arc<EventStore>,
    snapshots: Arc<SnapshotStore>,
    bus: Arc<EventBus>,
    manager: SnapshotManager,
}

fn fixture(policy: SnapshotPolicy) -> Fixture {
    let db = Database::open_in_memory().unwrap();
    let events = Arc::new(EventStore::new(db.clone()));
    let snapshots = Arc::new(SnapshotStore::new(db));
    let reconstructor = Arc::new(StateReconstructor::new(
        Arc::clone(&events),
        Arc::clone(&snapshots),
    ));
    let manager = SnapshotManager::new(Arc::clone(&snapshots), reconstructor, policy);
    Fixture {
        events,
        snapshots,
        bus: EventBus::new(),
        manager,
    }
}

fn ingest(fixture: &Fixture, entity_id: &str, state: &str) -> Event {
    let event = fixture
        .events
        .create(NewEvent {
            external_id: Uuid::new_v4().to_string(),
            event_id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            domain: crate::event::domain_of(entity_id).to_string(),
            event_type: "state_changed".to_string(),
            timestamp: Utc::now(),
            state: Some(state.to_string()),
            unit: None,
            data: json!({}),
            metadata: json!({}),
        })
        .unwrap();
    fixture.bus.publish(DomainEvent::EntityStateChanged {
        entity_id: event.entity_id.clone(),
        state: event.state.clone(),
        event: event.clone(),
    });
    event
}

#[tokio::test]
async fn cold_start_snapshots_on_first_event() {
    // Interval far in the future; cold-start rule must fire anyway
    let fixture = fixture(SnapshotPolicy::elapsed_time(3600));
    fixture.manager.initialize(&fixture.bus).unwrap();
    let _subscription = fixture.manager.attach(&fixture.bus);

    let event = ingest(&fixture, "light.a", "on");
    fixture.bus.wait_all().await;

    let snapshot = fixture.snapshots.get_latest().unwrap().unwrap();
    assert_eq!(snapshot.last_event_id, event.serial);
    assert_eq!(snapshot.state["light.a"].value, Some("on".to_string()));
}

#[tokio::test]
async fn quiet_policy_takes_no_second_snapshot() {
    let fixture = fixture(SnapshotPolicy::elapsed_time(3600));
    fixture.manager.initialize(&fixture.bus).unwrap();
    let _subscription = fixture.manager.attach(&fixture.bus);

    ingest(&fixture, "light.a", "on");
    ingest(&fixture, "light.a", "off");
    ingest(&fixture, "light.b", "on");
    fixture.bus.wait_all().await;

    // Only the cold-start snapshot exists
    let latest = fixture.snapshots.get_latest().unwrap().unwrap();
    assert_eq!(latest.id, 1);
    assert_eq!(latest.last_event_id, 1);
}

#[tokio::test]
async fn event_count_policy_snapshots_at_threshold() {
    let fixture = fixture(SnapshotPolicy::EventCount { max_events: 3 });
    fixture.manager.initialize(&fixture.bus).unwrap();
    let _subscription = fixture.manager.attach(&fixture.bus);

    for i in 0..4 {
        ingest(&fixture, "light.a", if i % 2 == 0 { "on" } else { "off" });
    }
    fixture.bus.wait_all().await;

    // Serial 1 (cold start) and serial 4 (three events later)
    let latest = fixture.snapshots.get_latest().unwrap().unwrap();
    assert_eq!(latest.last_event_id, 4);
    assert_eq!(fixture.snapshots.get_by_id(1).unwrap().unwrap().last_event_id, 1);
}

#[tokio::test]
async fn snapshot_folds_whole_cache_not_just_last_event() {
    let fixture = fixture(SnapshotPolicy::EventCount { max_events: 2 });
    fixture.manager.initialize(&fixture.bus).unwrap();
    let _subscription = fixture.manager.attach(&fixture.bus);

    ingest(&fixture, "light.a", "on"); // cold-start snapshot
    ingest(&fixture, "light.b", "on");
    ingest(&fixture, "sensor.t", "21"); // second snapshot: serial 3
    fixture.bus.wait_all().await;

    let latest = fixture.snapshots.get_latest().unwrap().unwrap();
    assert_eq!(latest.last_event_id, 3);
    assert_eq!(latest.state.len(), 3);
    assert_eq!(latest.state["light.a"].value, Some("on".to_string()));
}

#[tokio::test]
async fn initialize_seeds_cache_from_reconstructed_state() {
    let fixture = fixture(SnapshotPolicy::elapsed_time(3600));
    // History exists before the manager starts
    ingest(&fixture, "light.a", "on");
    ingest(&fixture, "light.b", "off");

    fixture.manager.initialize(&fixture.bus).unwrap();

    let cache = fixture.manager.state_cache();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache["light.b"].value, Some("off".to_string()));
}

#[tokio::test]
async fn initialize_publishes_state_reconstructed() {
    let fixture = fixture(SnapshotPolicy::elapsed_time(3600));
    ingest(&fixture, "light.a", "on");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let _subscription = fixture.bus.subscribe(
        EventKind::StateReconstructed,
        "recorder",
        Arc::new(move |event| {
            let seen = Arc::clone(&seen_clone);
            Box::pin(async move {
                if let DomainEvent::StateReconstructed { last_event_id, .. } = event {
                    seen.lock().unwrap().push(last_event_id);
                }
                Ok(())
            })
        }),
    );

    fixture.manager.initialize(&fixture.bus).unwrap();
    fixture.bus.wait_all().await;

    assert_eq!(*seen.lock().unwrap(), vec![Some(1)]);
}
