//! Ingestion pipeline: upstream source → entity filter → event log → bus.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, info};

use crate::bus::{DomainEvent, EventBus};
use crate::event::NewEvent;
use crate::filter::EntityBlockList;
use crate::store::{EventStore, StorageError};

pub struct IngestionEngine {
    events: Arc<EventStore>,
    bus: Arc<EventBus>,
    blocklist: EntityBlockList,
}

impl IngestionEngine {
    pub fn new(events: Arc<EventStore>, bus: Arc<EventBus>, blocklist: EntityBlockList) -> Self {
        Self {
            events,
            bus,
            blocklist,
        }
    }

    /// Drain `source`, persisting and publishing every unblocked event.
    ///
    /// Returns Ok when the source ends (upstream disconnect) and Err on a
    /// storage failure; either way the caller tears the stream down and the
    /// reconnect supervisor starts a fresh one.
    pub async fn run<S>(&self, mut source: S) -> Result<(), StorageError>
    where
        S: Stream<Item = NewEvent> + Unpin,
    {
        info!("ingestion started");
        while let Some(raw) = source.next().await {
            if self.blocklist.should_block(&raw.entity_id) {
                debug!(entity_id = %raw.entity_id, "event blocked by entity filter");
                continue;
            }
            self.process(raw)?;
        }
        info!("ingestion source drained");
        Ok(())
    }

    /// Persist one event and publish it. Duplicates (same external id) are
    /// persisted as no-ops and still published; the serial downstream
    /// consumers see is the one from the first successful persist.
    fn process(&self, raw: NewEvent) -> Result<(), StorageError> {
        let event = self.events.create(raw)?;
        info!(
            event_id = %event.event_id,
            entity_id = %event.entity_id,
            serial = event.serial,
            event_type = %event.event_type,
            "event persisted"
        );
        self.bus.publish(DomainEvent::EntityStateChanged {
            entity_id: event.entity_id.clone(),
            state: event.state.clone(),
            event,
        });
        Ok(())
    }
}
