use serde::{Deserialize, Serialize};

use crate::event::StateMap;
use crate::registry::Registry;

/// Client → server frames.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Subscribe(String),
    Unsubscribe(String),
}

/// Payload of an `entity.state_change` frame.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StateChangePayload {
    /// Event serial; subscribers dedupe on it across the snapshot join point
    pub id: i64,
    /// Unix epoch milliseconds
    pub timestamp: i64,
    pub entity_id: String,
    pub state: Option<String>,
    pub unit: Option<String>,
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registry {
        registry: Registry,
    },
    Snapshot {
        state: StateMap,
    },
    #[serde(rename = "entity.state_change")]
    EntityStateChange {
        data: StateChangePayload,
    },
    Pong,
    Error {
        message: String,
    },
}
