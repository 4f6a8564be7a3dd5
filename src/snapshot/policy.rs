use chrono::{DateTime, Duration, Utc};

/// Decides when the snapshot manager should persist a new snapshot.
#[derive(Clone, Copy, Debug)]
pub enum SnapshotPolicy {
    /// Snapshot once `interval` has elapsed since the last snapshot.
    ElapsedTime { interval: Duration },
    /// Snapshot once `max_events` have accumulated since the last snapshot.
    EventCount { max_events: i64 },
    /// Snapshot when either the event-count or elapsed-time condition holds.
    Hybrid { max_events: i64, interval: Duration },
}

impl SnapshotPolicy {
    pub fn elapsed_time(interval_seconds: i64) -> Self {
        Self::ElapsedTime {
            interval: Duration::seconds(interval_seconds),
        }
    }

    pub fn should_snapshot(
        &self,
        events_since_snapshot: i64,
        last_snapshot_time: DateTime<Utc>,
    ) -> bool {
        match *self {
            Self::ElapsedTime { interval } => Utc::now() - last_snapshot_time >= interval,
            Self::EventCount { max_events } => events_since_snapshot >= max_events,
            Self::Hybrid {
                max_events,
                interval,
            } => {
                Self::EventCount { max_events }
                    .should_snapshot(events_since_snapshot, last_snapshot_time)
                    || Self::ElapsedTime { interval }
                        .should_snapshot(events_since_snapshot, last_snapshot_time)
            }
        }
    }
}
