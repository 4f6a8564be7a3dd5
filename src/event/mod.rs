use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;


/// Leading component of a dotted entity id ("light.kitchen" → "light").
pub fn domain_of(entity_id: &str) -> &str {
    entity_id.split('.').next().unwrap_or(entity_id)
}

/// A state change received from the upstream hub, not yet persisted.
///
/// `external_id` is the upstream-minted context identifier; the event log
/// deduplicates on it. `event_id` is minted locally (UUIDv4).
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub external_id: String,
    pub event_id: Uuid,
    pub entity_id: String,
    pub domain: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub state: Option<String>,
    pub unit: Option<String>,
    /// Opaque upstream payload (the new state object)
    pub data: Value,
    /// Opaque structured metadata
    pub metadata: Value,
}

/// A persisted state-change event.
///
/// `serial` is assigned by the event log on insert and is strictly monotonic
/// in commit order; it is the primary ordering key everywhere downstream.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Event {
    pub serial: i64,
    pub external_id: String,
    pub event_id: Uuid,
    pub entity_id: String,
    pub domain: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub state: Option<String>,
    pub unit: Option<String>,
    pub data: Value,
    pub metadata: Value,
}

/// Minimal event projection used for timeline replay; drops the heavyweight
/// `data`/`metadata` payloads.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CompactEvent {
    #[serde(rename = "id")]
    pub serial: i64,
    pub entity_id: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
    pub state: Option<String>,
    pub unit: Option<String>,
}

/// Value/unit pair held per entity in a state map.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    pub value: Option<String>,
    pub unit: Option<String>,
}

/// Full world state: entity id → current value/unit.
pub type StateMap = HashMap<String, EntityState>;
