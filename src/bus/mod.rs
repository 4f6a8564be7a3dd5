//! In-process typed event bus.
//!
//! Handlers subscribe to one variant of the closed [`DomainEvent`] enum.
//! Each handler owns an unbounded FIFO queue drained by its own task, so a
//! handler sees events in publish order and a failing handler never blocks
//! its siblings.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error};

use crate::event::{Event, StateMap};
use crate::registry::Registry;


/// Application events carried between producers and subscribers.
#[derive(Clone, Debug)]
pub enum DomainEvent {
    EntityStateChanged {
        entity_id: String,
        state: Option<String>,
        event: Event,
    },
    RegistryUpdated {
        registry: Registry,
    },
    StateReconstructed {
        state: StateMap,
        last_event_id: Option<i64>,
    },
}

/// Variant tags used as subscription keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    EntityStateChanged,
    RegistryUpdated,
    StateReconstructed,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::EntityStateChanged { .. } => EventKind::EntityStateChanged,
            Self::RegistryUpdated { .. } => EventKind::RegistryUpdated,
            Self::StateReconstructed { .. } => EventKind::StateReconstructed,
        }
    }
}

/// Async callback invoked once per matching published event.
pub type Handler =
    Arc<dyn Fn(DomainEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Slot {
    id: u64,
    kind: EventKind,
    tx: mpsc::UnboundedSender<DomainEvent>,
}

/// Tracks events handed to dispatch tasks but not yet handled.
#[derive(Default)]
struct Inflight {
    count: AtomicUsize,
    drained: Notify,
}

impl Inflight {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct EventBus {
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
    inflight: Arc<Inflight>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            inflight: Arc::new(Inflight::default()),
        })
    }

    /// Register `handler` for one event variant. Dispatch is FIFO per
    /// handler; the returned token unsubscribes idempotently.
    pub fn subscribe(self: &Arc<Self>, kind: EventKind, name: &'static str, handler: Handler) -> Subscription {
        let (tx, mut rx) = mpsc::unbounded_channel::<DomainEvent>();
        let inflight = Arc::clone(&self.inflight);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = handler(event).await {
                    error!(handler = name, error = %e, "event handler failed");
                }
                inflight.exit();
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.slots.lock().unwrap().push(Slot { id, kind, tx });
        debug!(handler = name, kind = ?kind, "handler subscribed");

        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Enqueue `event` to every handler registered for its variant and
    /// return immediately. Handler failures are logged inside the dispatch
    /// task and never reach the caller.
    pub fn publish(&self, event: DomainEvent) {
        let kind = event.kind();
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter().filter(|slot| slot.kind == kind) {
            self.inflight.enter();
            if slot.tx.send(event.clone()).is_err() {
                self.inflight.exit();
            }
        }
    }

    /// Await completion of all outstanding dispatches. Used by tests and
    /// graceful shutdown.
    pub async fn wait_all(&self) {
        self.inflight.wait().await;
    }

    fn remove(&self, id: u64) {
        self.slots.lock().unwrap().retain(|slot| slot.id != id);
    }

    #[cfg(test)]
    fn handler_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

/// Unsubscribe token returned by [`EventBus::subscribe`].
///
/// The bus owns the handler; the token holds only a weak reference, so
/// subscriber and bus never own each other. In-flight dispatches to the
/// handler may still run to completion after `unsubscribe`.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}
