//! Policy-driven snapshot creation.
//!
//! The manager mirrors live state changes into an in-memory cache and asks
//! its policy, per event, whether to persist the cache as a snapshot.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::bus::{DomainEvent, EventBus, EventKind, Subscription};
use crate::event::{EntityState, Event, StateMap};
use crate::state::StateReconstructor;
use crate::store::{NewSnapshot, SnapshotStore, StorageError};

pub mod policy;

pub use policy::SnapshotPolicy;

#[cfg(test)]
mod tests;

struct Tracking {
    state_cache: StateMap,
    last_snapshot_time: Option<DateTime<Utc>>,
    last_snapshot_event_id: i64,
}

struct Inner {
    snapshots: Arc<SnapshotStore>,
    policy: SnapshotPolicy,
    tracking: Mutex<Tracking>,
}

pub struct SnapshotManager {
    reconstructor: Arc<StateReconstructor>,
    inner: Arc<Inner>,
}

impl SnapshotManager {
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        reconstructor: Arc<StateReconstructor>,
        policy: SnapshotPolicy,
    ) -> Self {
        Self {
            reconstructor,
            inner: Arc::new(Inner {
                snapshots,
                policy,
                tracking: Mutex::new(Tracking {
                    state_cache: StateMap::new(),
                    last_snapshot_time: None,
                    last_snapshot_event_id: 0,
                }),
            }),
        }
    }

    /// Seed the cache and bookkeeping from the current reconstructed state,
    /// then announce the reconstruction on the bus.
    pub fn initialize(&self, bus: &EventBus) -> Result<(), StorageError> {
        let current = self.reconstructor.get_state_at(Utc::now())?;

        let mut tracking = self.inner.tracking.lock().unwrap();
        tracking.last_snapshot_time = current.snapshot_time;
        tracking.last_snapshot_event_id = current.last_event_id.unwrap_or(0);
        tracking.state_cache = current.state.clone();
        info!(
            last_event_id = tracking.last_snapshot_event_id,
            entities = tracking.state_cache.len(),
            "snapshot manager seeded"
        );
        drop(tracking);

        bus.publish(DomainEvent::StateReconstructed {
            state: current.state,
            last_event_id: current.last_event_id,
        });
        Ok(())
    }

    /// Subscribe to `EntityStateChanged` on the bus.
    pub fn attach(&self, bus: &Arc<EventBus>) -> Subscription {
        let inner = Arc::clone(&self.inner);
        bus.subscribe(
            EventKind::EntityStateChanged,
            "snapshot_manager",
            Arc::new(move |event| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    if let DomainEvent::EntityStateChanged { state, event, .. } = event {
                        inner.on_entity_state_changed(&event, state)?;
                    }
                    Ok(())
                })
            }),
        )
    }

    #[cfg(test)]
    fn state_cache(&self) -> StateMap {
        self.inner.tracking.lock().unwrap().state_cache.clone()
    }
}

impl Inner {
    fn on_entity_state_changed(
        &self,
        event: &Event,
        state: Option<String>,
    ) -> Result<(), StorageError> {
        let mut tracking = self.tracking.lock().unwrap();
        tracking.state_cache.insert(
            event.entity_id.clone(),
            EntityState {
                value: state,
                unit: event.unit.clone(),
            },
        );

        let events_since_snapshot = event.serial - tracking.last_snapshot_event_id;
        let due = match tracking.last_snapshot_time {
            // Cold start: the first event snapshots regardless of policy
            None => true,
            Some(last) => self.policy.should_snapshot(events_since_snapshot, last),
        };
        if !due {
            return Ok(());
        }

        let stored = self.snapshots.create(NewSnapshot {
            last_event_id: event.serial,
            state: tracking.state_cache.clone(),
        })?;
        tracking.last_snapshot_time = Some(stored.created_at);
        tracking.last_snapshot_event_id = stored.last_event_id;
        info!(
            snapshot_id = stored.id,
            last_event_id = stored.last_event_id,
            "snapshot taken"
        );
        Ok(())
    }
}
