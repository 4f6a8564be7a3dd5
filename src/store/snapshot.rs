use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::event::StateMap;
use crate::store::{format_timestamp, parse_timestamp, Database, StorageError};

/// Whole-state snapshot ready to be persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct NewSnapshot {
    /// Serial of the newest event folded into `state`
    pub last_event_id: i64,
    pub state: StateMap,
}

/// A persisted snapshot, anchored at the serial of its newest folded event.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub id: i64,
    pub last_event_id: i64,
    pub state: StateMap,
    pub created_at: DateTime<Utc>,
}

pub struct SnapshotStore {
    db: Database,
}

impl SnapshotStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert `snapshot`, assigning its id and `created_at`. The row is read
    /// back so callers observe the authoritative stored timestamp.
    pub fn create(&self, snapshot: NewSnapshot) -> Result<Snapshot, StorageError> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO snapshots (last_event_id, state, created_at) VALUES (?1, ?2, ?3)",
            params![
                snapshot.last_event_id,
                serde_json::to_string(&snapshot.state)?,
                format_timestamp(Utc::now()),
            ],
        )?;
        let id = conn.last_insert_rowid();

        Self::query_one(&conn, "SELECT * FROM snapshots WHERE id = ?1", params![id])?
            .ok_or_else(|| StorageError::Malformed(format!("snapshot {id} vanished after insert")))
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<Snapshot>, StorageError> {
        let conn = self.db.lock();
        Self::query_one(&conn, "SELECT * FROM snapshots WHERE id = ?1", params![id])
    }

    pub fn get_latest(&self) -> Result<Option<Snapshot>, StorageError> {
        let conn = self.db.lock();
        Self::query_one(
            &conn,
            "SELECT * FROM snapshots ORDER BY id DESC LIMIT 1",
            params![],
        )
    }

    /// Newest snapshot created strictly before `timestamp`.
    pub fn get_before_timestamp(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Snapshot>, StorageError> {
        let conn = self.db.lock();
        Self::query_one(
            &conn,
            "SELECT * FROM snapshots WHERE created_at < ?1 ORDER BY id DESC LIMIT 1",
            params![format_timestamp(timestamp)],
        )
    }

    fn query_one(
        conn: &rusqlite::Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Snapshot>, StorageError> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            Some(row) => Ok(Some(snapshot_from_row(row)?)),
            None => Ok(None),
        }
    }
}

fn snapshot_from_row(row: &Row<'_>) -> Result<Snapshot, StorageError> {
    let state: String = row.get("state")?;
    let created_at: String = row.get("created_at")?;
    Ok(Snapshot {
        id: row.get("id")?,
        last_event_id: row.get("last_event_id")?,
        state: serde_json::from_str(&state)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EntityState;
    use std::collections::HashMap;

    fn store() -> SnapshotStore {
        SnapshotStore::new(Database::open_in_memory().unwrap())
    }

    fn state_of(entries: &[(&str, &str)]) -> StateMap {
        entries
            .iter()
            .map(|(entity_id, value)| {
                (
                    entity_id.to_string(),
                    EntityState {
                        value: Some(value.to_string()),
                        unit: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn create_assigns_id_and_created_at() {
        let store = store();
        let before = Utc::now();

        let snapshot = store
            .create(NewSnapshot {
                last_event_id: 5,
                state: state_of(&[("light.living_room", "on")]),
            })
            .unwrap();

        assert_eq!(snapshot.id, 1);
        assert_eq!(snapshot.last_event_id, 5);
        assert!(snapshot.created_at >= before - chrono::Duration::seconds(1));
        assert_eq!(
            snapshot.state["light.living_room"].value,
            Some("on".to_string())
        );
    }

    #[test]
    fn get_latest_returns_newest_by_id() {
        let store = store();
        store
            .create(NewSnapshot {
                last_event_id: 1,
                state: HashMap::new(),
            })
            .unwrap();
        store
            .create(NewSnapshot {
                last_event_id: 2,
                state: HashMap::new(),
            })
            .unwrap();

        let latest = store.get_latest().unwrap().unwrap();
        assert_eq!(latest.id, 2);
        assert_eq!(latest.last_event_id, 2);
    }

    #[test]
    fn get_latest_empty_is_none() {
        assert!(store().get_latest().unwrap().is_none());
    }

    #[test]
    fn get_before_timestamp_excludes_newer_snapshots() {
        let store = store();
        let created = store
            .create(NewSnapshot {
                last_event_id: 1,
                state: HashMap::new(),
            })
            .unwrap();

        let before = store
            .get_before_timestamp(created.created_at + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(before.map(|s| s.id), Some(created.id));

        let none = store
            .get_before_timestamp(created.created_at - chrono::Duration::seconds(1))
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn get_by_id_round_trips_state() {
        let store = store();
        let created = store
            .create(NewSnapshot {
                last_event_id: 3,
                state: state_of(&[("sensor.temp", "21.5"), ("light.kitchen", "off")]),
            })
            .unwrap();

        let fetched = store.get_by_id(created.id).unwrap().unwrap();
        assert_eq!(fetched, created);
    }
}
