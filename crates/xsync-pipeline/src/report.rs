//! `RunReport`: the shape every pipeline hands back to `RunLogger` and, for
//! `ManualTrigger`/`RunInitial`, directly to the caller (§6/§8).

use serde::{Deserialize, Serialize};

use xsync_schemas::{EngineError, ErrorKind, SyncStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub message: String,
    pub record_key: Option<String>,
}

/// §8 scenario 4: conflict tallies a bidirectional run's report carries
/// alongside the usual counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConflictCounts {
    pub total: u64,
    pub sor_wins: u64,
    pub grid_wins: u64,
    pub deleted: u64,
    pub skipped: u64,
}

/// §6's `RunManual`/`RunInitial` return value; §8's per-run invariants are
/// phrased directly in terms of this struct's fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: SyncStatus,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub failed: u64,
    /// §7: capped at 20 entries for the synchronous response (the durable
    /// `RunLog.errors` column keeps its own 10-entry cap independently).
    pub errors: Vec<ErrorSummary>,
    pub warnings: Vec<String>,
    /// `None` for a unidirectional run; always present for Bidirectional.
    pub conflicts: Option<ConflictCounts>,
}

impl RunReport {
    /// §8: `recordsSynced == added + updated`.
    pub fn records_synced(&self) -> u64 {
        self.added + self.updated
    }

    /// A phase-fatal abort (schema fetch, auth, grid read) never reaches the
    /// per-record accumulator; it produces a report directly.
    pub fn fatal(error: EngineError) -> Self {
        Self {
            status: SyncStatus::Failed,
            added: 0,
            updated: 0,
            deleted: 0,
            failed: 1,
            errors: vec![ErrorSummary { kind: error.kind, message: error.message, record_key: error.record_key }],
            warnings: Vec::new(),
            conflicts: None,
        }
    }
}
