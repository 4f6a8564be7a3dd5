use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use tracing::debug;

use crate::event::{CompactEvent, Event, NewEvent};
use crate::store::{format_timestamp, parse_timestamp, Database, StorageError};

const EVENT_COLUMNS: &str =
    "id, external_id, event_id, entity_id, domain, event_type, timestamp, state, unit, data, metadata";

/// Append-only event log keyed by a monotonic serial, deduplicated on the
/// upstream-assigned external id.
pub struct EventStore {
    db: Database,
}

impl EventStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert `event`, assigning its serial. A second insert with the same
    /// external id is a no-op that returns the original row unchanged.
    pub fn create(&self, event: NewEvent) -> Result<Event, StorageError> {
        let conn = self.db.lock();
        let inserted = conn.execute(
            r#"
            INSERT INTO events (
                event_id,
                event_type,
                external_id,
                domain,
                entity_id,
                timestamp,
                state,
                unit,
                data,
                metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (external_id) DO NOTHING
            "#,
            params![
                event.event_id.to_string(),
                event.event_type,
                event.external_id,
                event.domain,
                event.entity_id,
                format_timestamp(event.timestamp),
                event.state,
                event.unit,
                event.data.to_string(),
                event.metadata.to_string(),
            ],
        )?;

        // On conflict the original row stays untouched; either way the row
        // owning this external id is the authoritative result.
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE external_id = ?1"
        ))?;
        let mut rows = stmt.query([&event.external_id])?;
        let row = rows.next()?.ok_or_else(|| {
            StorageError::Malformed(format!(
                "event with external_id '{}' vanished after insert",
                event.external_id
            ))
        })?;
        let stored = event_from_row(row)?;

        if inserted == 0 {
            debug!(
                external_id = %stored.external_id,
                serial = stored.serial,
                "duplicate event, returning original row"
            );
        }
        Ok(stored)
    }

    pub fn get_by_serial(&self, serial: i64) -> Result<Option<Event>, StorageError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"
        ))?;
        let mut rows = stmt.query([serial])?;
        match rows.next()? {
            Some(row) => Ok(Some(event_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Events strictly after `after_serial` with `timestamp < before`, in
    /// `(timestamp, serial)` order.
    pub fn get_timeline_between(
        &self,
        after_serial: i64,
        before: DateTime<Utc>,
    ) -> Result<Vec<CompactEvent>, StorageError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, entity_id, timestamp, state, unit
            FROM events
            WHERE id > ?1 AND timestamp < ?2
            ORDER BY timestamp, id
            "#,
        )?;
        let mut rows = stmt.query(params![after_serial, format_timestamp(before)])?;

        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(compact_event_from_row(row)?);
        }
        Ok(events)
    }
}

fn event_from_row(row: &Row<'_>) -> Result<Event, StorageError> {
    let event_id: String = row.get("event_id")?;
    let timestamp: String = row.get("timestamp")?;
    let data: String = row.get("data")?;
    let metadata: String = row.get("metadata")?;

    Ok(Event {
        serial: row.get("id")?,
        external_id: row.get("external_id")?,
        event_id: event_id
            .parse()
            .map_err(|e| StorageError::Malformed(format!("bad event_id '{event_id}': {e}")))?,
        entity_id: row.get("entity_id")?,
        domain: row.get("domain")?,
        event_type: row.get("event_type")?,
        timestamp: parse_timestamp(&timestamp)?,
        state: row.get("state")?,
        unit: row.get("unit")?,
        data: serde_json::from_str(&data)?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn compact_event_from_row(row: &Row<'_>) -> Result<CompactEvent, StorageError> {
    let timestamp: String = row.get("timestamp")?;
    Ok(CompactEvent {
        serial: row.get("id")?,
        entity_id: row.get("entity_id")?,
        timestamp: parse_timestamp(&timestamp)?.timestamp_millis(),
        state: row.get("state")?,
        unit: row.get("unit")?,
    })
}
