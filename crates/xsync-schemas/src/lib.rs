//! Shared domain types for the synchronization engine.
//!
//! Every other crate in the workspace depends on this one for the entities
//! described in the data model: users, provider connections, sync
//! configurations, run logs, hash snapshots, and usage stats. No IO, no
//! business logic beyond the invariants each type itself enforces.

pub mod connection;
pub mod error;
pub mod hash_snapshot;
pub mod run_log;
pub mod sor;
pub mod sync_config;
pub mod usage;
pub mod user;

pub use connection::{ConnStatus, Connection, Provider};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use hash_snapshot::{row_key, HashEntry, HashSnapshot, RecordKey};
pub use run_log::{RunLog, TriggeredBy};
pub use sor::{FieldSchema, SorFieldType, SorRecord, TableSchema};
pub use sync_config::{
    ConflictStrategy, GridColumnIndex, SyncConfig, SyncDirection, SyncStatus, RESERVED_ID_COLUMN,
};
pub use usage::{month_key, UsageStats};
pub use user::{SubscriptionStatus, User, TRIAL_DURATION_DAYS};
