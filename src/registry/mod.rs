//! Topology metadata mirrored from the upstream hub.
//!
//! The registry is read-mostly: it is fetched wholesale on every successful
//! upstream connection and swapped into the cache atomically.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::bus::{DomainEvent, EventBus, EventKind, Subscription};


#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: String,
    pub domain: String,
    pub display_name: String,
    pub area_id: Option<String>,
    pub device_id: Option<String>,
    pub entity_category: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: String,
    pub area_id: Option<String>,
    pub display_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Area {
    pub id: String,
    pub display_name: String,
    pub floor_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Floor {
    pub id: String,
    pub display_name: String,
    pub level: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Registry {
    pub entities: HashMap<String, Entity>,
    pub devices: HashMap<String, Device>,
    pub areas: HashMap<String, Area>,
    pub floors: HashMap<String, Floor>,
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

impl Entity {
    /// Build from one upstream entity-registry row. Returns None when the row
    /// has no entity id.
    pub fn from_upstream(value: &Value) -> Option<Self> {
        let id = string_field(value, "entity_id")?;
        let display_name = string_field(value, "name")
            .or_else(|| string_field(value, "original_name"))
            .unwrap_or_else(|| id.clone());
        Some(Self {
            domain: crate::event::domain_of(&id).to_string(),
            display_name,
            area_id: string_field(value, "area_id"),
            device_id: string_field(value, "device_id"),
            entity_category: string_field(value, "entity_category"),
            id,
        })
    }
}

impl Device {
    pub fn from_upstream(value: &Value) -> Option<Self> {
        let id = string_field(value, "id")?;
        let display_name = string_field(value, "name_by_user")
            .or_else(|| string_field(value, "name"))
            .unwrap_or_else(|| id.clone());
        Some(Self {
            id,
            area_id: string_field(value, "area_id"),
            display_name,
        })
    }
}

impl Area {
    pub fn from_upstream(value: &Value) -> Option<Self> {
        Some(Self {
            id: string_field(value, "area_id")?,
            display_name: string_field(value, "name")?,
            floor_id: string_field(value, "floor_id"),
        })
    }
}

impl Floor {
    pub fn from_upstream(value: &Value) -> Option<Self> {
        Some(Self {
            id: string_field(value, "floor_id")?,
            display_name: string_field(value, "name")?,
            level: value.get("level").and_then(Value::as_i64),
        })
    }
}

/// Process-wide holder of the current registry.
///
/// Single writer (the `RegistryUpdated` handler), many readers; updates swap
/// the inner `Arc` so readers never observe a partial registry.
pub struct RegistryCache {
    current: Arc<RwLock<Arc<Registry>>>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(Registry::default()))),
        }
    }

    pub fn get_registry(&self) -> Arc<Registry> {
        Arc::clone(&self.current.read().unwrap())
    }

    /// Subscribe to `RegistryUpdated` on the bus, replacing the held value on
    /// each receipt.
    pub fn attach(&self, bus: &Arc<EventBus>) -> Subscription {
        let current = Arc::clone(&self.current);
        bus.subscribe(
            EventKind::RegistryUpdated,
            "registry_cache",
            Arc::new(move |event| {
                let current = Arc::clone(&current);
                Box::pin(async move {
                    if let DomainEvent::RegistryUpdated { registry } = event {
                        info!(
                            entities = registry.entities.len(),
                            devices = registry.devices.len(),
                            areas = registry.areas.len(),
                            floors = registry.floors.len(),
                            "registry cache refreshed"
                        );
                        *current.write().unwrap() = Arc::new(registry);
                    }
                    Ok(())
                })
            }),
        )
    }
}

impl Default for RegistryCache {
    fn default() -> Self {
        Self::new()
    }
}
