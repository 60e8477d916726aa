use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync_config::{SyncDirection, SyncStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Scheduled,
    Manual,
    Initial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub id: Uuid,
    pub sync_config_id: Uuid,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_synced: u64,
    pub records_failed: u64,
    /// Compact JSON array of `{kind, message, record_key?}`, capped at
    /// persistence time (§7: at most 10 entries durable, 20 synchronous).
    pub errors: serde_json::Value,
    pub triggered_by: TriggeredBy,
    pub direction: SyncDirection,
}

impl RunLog {
    pub fn start(sync_config_id: Uuid, triggered_by: TriggeredBy, direction: SyncDirection) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_config_id,
            status: SyncStatus::Success,
            started_at: Utc::now(),
            completed_at: None,
            records_synced: 0,
            records_failed: 0,
            errors: serde_json::Value::Array(Vec::new()),
            triggered_by,
            direction,
        }
    }

    /// §3: a RunLog with `completed_at == null` younger than 5 minutes is the
    /// single-flight signal the scheduler checks before dispatching a new run.
    pub fn is_in_flight(&self, now: DateTime<Utc>) -> bool {
        self.completed_at.is_none() && now - self.started_at < chrono::Duration::minutes(5)
    }

    /// §8: `completed_at >= started_at` is a hard invariant of every finalized run.
    pub fn finalize(&mut self, status: SyncStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now().max(self.started_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_window_is_five_minutes() {
        let mut log = RunLog::start(Uuid::nil(), TriggeredBy::Scheduled, SyncDirection::SorToGrid);
        assert!(log.is_in_flight(Utc::now()));
        log.started_at = Utc::now() - chrono::Duration::minutes(6);
        assert!(!log.is_in_flight(Utc::now()));
    }

    #[test]
    fn finalize_never_precedes_start() {
        let mut log = RunLog::start(Uuid::nil(), TriggeredBy::Manual, SyncDirection::GridToSor);
        log.finalize(SyncStatus::Success);
        assert!(log.completed_at.unwrap() >= log.started_at);
    }
}
