use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Either the SOR record id (when known) or a synthetic `row_<index>` key
/// for an unmatched grid row. See GLOSSARY "Record key".
pub type RecordKey = String;

pub fn row_key(row_index: usize) -> RecordKey {
    format!("row_{row_index}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashEntry {
    pub content_hash: String,
    pub captured_at: DateTime<Utc>,
    pub sor_modified_at: Option<DateTime<Utc>>,
    pub grid_modified_at: Option<DateTime<Utc>>,
}

/// §3/§4.5: the per-`SyncConfig` snapshot the detector diffs the current run
/// against. Rebuildable from scratch by a full re-scan (first-sync path).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashSnapshot {
    pub entries: HashMap<RecordKey, HashEntry>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl HashSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_first_sync(&self) -> bool {
        self.entries.is_empty() && self.last_sync_time.is_none()
    }
}
