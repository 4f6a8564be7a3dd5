//! Subscriber session management.
//!
//! The manager owns the set of open sessions and the per-subscription
//! session sets. It subscribes once to `EntityStateChanged` on the bus and
//! fans live changes out to every session carrying the `entity_states`
//! subscription. The WebSocket plumbing that drives each session's sender
//! and receiver loops lives in `api::websocket`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::bus::{DomainEvent, EventBus, EventKind, Subscription};
use crate::event::Event;
use crate::registry::RegistryCache;
use crate::state::StateReconstructor;
use crate::store::StorageError;

pub mod protocol;

pub use protocol::{ClientMessage, ServerMessage, StateChangePayload};


/// The closed set of subscription names a session may carry.
pub const SUBSCRIPTION_ENTITY_STATES: &str = "entity_states";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

pub struct SessionManager {
    sessions: DashMap<Uuid, mpsc::UnboundedSender<ServerMessage>>,
    subscriptions: Mutex<HashMap<String, HashSet<Uuid>>>,
    reconstructor: Arc<StateReconstructor>,
    registry: Arc<RegistryCache>,
}

impl SessionManager {
    pub fn new(reconstructor: Arc<StateReconstructor>, registry: Arc<RegistryCache>) -> Self {
        Self {
            sessions: DashMap::new(),
            subscriptions: Mutex::new(HashMap::new()),
            reconstructor,
            registry,
        }
    }

    /// Subscribe to `EntityStateChanged` on the bus. The handler holds only
    /// a weak reference to the manager, so the bus never keeps it alive.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus>) -> Subscription {
        let manager = Arc::downgrade(self);
        bus.subscribe(
            EventKind::EntityStateChanged,
            "session_manager",
            Arc::new(move |event| {
                let manager: Weak<SessionManager> = Weak::clone(&manager);
                Box::pin(async move {
                    if let DomainEvent::EntityStateChanged { state, event, .. } = event {
                        if let Some(manager) = manager.upgrade() {
                            manager.fan_out_state_change(&event, state);
                        }
                    }
                    Ok(())
                })
            }),
        )
    }

    /// Register a session; returns its id and the outbound frame receiver.
    pub fn connect(&self) -> (Uuid, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(id, tx);
        info!(session_id = %id, sessions = self.sessions.len(), "session connected");
        (id, rx)
    }

    /// Drop a session from the connected set and every subscription set.
    pub fn disconnect(&self, id: Uuid) {
        self.sessions.remove(&id);
        let mut subscriptions = self.subscriptions.lock().unwrap();
        for members in subscriptions.values_mut() {
            members.remove(&id);
        }
        info!(session_id = %id, sessions = self.sessions.len(), "session disconnected");
    }

    /// Route one inbound frame for `id`.
    pub fn handle_message(&self, id: Uuid, message: ClientMessage) -> Result<(), ProtocolError> {
        match message {
            ClientMessage::Ping => {
                self.enqueue(id, ServerMessage::Pong);
                Ok(())
            }
            ClientMessage::Subscribe(name) => self.subscribe_session(id, &name),
            ClientMessage::Unsubscribe(name) => self.unsubscribe_session(id, &name),
        }
    }

    fn subscribe_session(&self, id: Uuid, name: &str) -> Result<(), ProtocolError> {
        if name != SUBSCRIPTION_ENTITY_STATES {
            return Err(ProtocolError::UnknownSubscription(name.to_string()));
        }
        self.subscriptions
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .insert(id);
        info!(session_id = %id, subscription = name, "subscribed");
        Ok(())
    }

    fn unsubscribe_session(&self, id: Uuid, name: &str) -> Result<(), ProtocolError> {
        if name != SUBSCRIPTION_ENTITY_STATES {
            return Err(ProtocolError::UnknownSubscription(name.to_string()));
        }
        if let Some(members) = self.subscriptions.lock().unwrap().get_mut(name) {
            members.remove(&id);
        }
        info!(session_id = %id, subscription = name, "unsubscribed");
        Ok(())
    }

    /// Unsolicited registry frame, sent on connect.
    pub fn send_registry(&self, id: Uuid) {
        let registry = self.registry.get_registry();
        self.enqueue(
            id,
            ServerMessage::Registry {
                registry: (*registry).clone(),
            },
        );
    }

    /// Unsolicited snapshot frame, sent on connect. Everything after the
    /// snapshot's last folded serial arrives through the live fan-out.
    pub fn send_snapshot(&self, id: Uuid) -> Result<(), StorageError> {
        let current = self.reconstructor.get_state_at(Utc::now())?;
        self.enqueue(
            id,
            ServerMessage::Snapshot {
                state: current.state,
            },
        );
        Ok(())
    }

    pub fn send_error(&self, id: Uuid, message: String) {
        self.enqueue(id, ServerMessage::Error { message });
    }

    fn fan_out_state_change(&self, event: &Event, state: Option<String>) {
        let subscribed: Vec<Uuid> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .get(SUBSCRIPTION_ENTITY_STATES)
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default()
        };

        let frame = ServerMessage::EntityStateChange {
            data: StateChangePayload {
                id: event.serial,
                timestamp: event.timestamp.timestamp_millis(),
                entity_id: event.entity_id.clone(),
                state,
                unit: event.unit.clone(),
            },
        };
        for id in subscribed {
            self.enqueue(id, frame.clone());
        }
    }

    fn enqueue(&self, id: Uuid, message: ServerMessage) {
        // A session can disappear between fan-out and enqueue; drop silently.
        if let Some(tx) = self.sessions.get(&id) {
            let _ = tx.send(message);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
