//! Shared test fixtures: in-memory `SorClient`/`GridClient` doubles plus
//! Postgres seed helpers, reused across crates' integration tests instead
//! of each crate hand-rolling its own.
//!
//! Pipeline unit tests keep small, purpose-built fakes inline (see
//! `xsync-pipeline`'s `#[cfg(test)]` modules) where a scenario needs exact
//! control over a single call's behavior. This crate is for the coarser
//! fixtures `xsync-daemon` and `xsync-cli`'s scenario tests need: a
//! fully-seeded user/connection/sync-config row set plus working fakes for
//! both external APIs.

mod fake_grid;
mod fake_sor;

pub use fake_grid::FakeGridClient;
pub use fake_sor::FakeSorClient;

use chrono::Utc;
use uuid::Uuid;

use xsync_schemas::{Connection, ConnStatus, Provider, SyncConfig, SyncDirection, User};

/// A `User` row with no plan restrictions, ready to own sync configs.
pub fn seed_user() -> User {
    User {
        id: Uuid::new_v4(),
        email: format!("{}@example.test", Uuid::new_v4()),
        plan: Some("pro".to_string()),
        subscription_status: None,
        trial_started_at: None,
        trial_ends_at: None,
    }
}

/// A `Connection` row in the `Connected` state for the given user/provider.
pub fn seed_connection(user_id: Uuid, provider: Provider) -> Connection {
    Connection {
        id: Uuid::new_v4(),
        user_id,
        provider,
        encrypted_access_token: "encrypted-access-token".to_string(),
        encrypted_refresh_token: "encrypted-refresh-token".to_string(),
        token_expiry: Utc::now() + chrono::Duration::hours(1),
        needs_reauth: false,
        last_refresh_error: None,
        last_refresh_attempt: None,
    }
}

/// A minimal, valid `SyncConfig` mapping two columns for the given user.
pub fn seed_sync_config(user_id: Uuid) -> SyncConfig {
    let mut field_mappings = std::collections::HashMap::new();
    field_mappings.insert("Name".to_string(), 0);
    field_mappings.insert("Tier".to_string(), 1);

    SyncConfig {
        id: Uuid::new_v4(),
        user_id,
        name: "testkit sync".to_string(),
        sor_base_id: "base1".to_string(),
        sor_table_id: "table1".to_string(),
        sor_view_id: None,
        grid_workbook_id: "wb1".to_string(),
        grid_sheet_id: "sheet1".to_string(),
        field_mappings,
        direction: SyncDirection::Bidirectional,
        conflict_strategy: None,
        is_active: true,
        last_sync_at: None,
        last_sync_status: None,
        last_error_at: None,
        last_error_message: None,
    }
}

/// `xsync_db::connection_status`'s pure classification, re-exported so
/// scenario tests can assert against it without depending on `xsync-db`
/// directly for an enum already public from `xsync-schemas`.
pub fn expect_connected() -> ConnStatus {
    ConnStatus::Connected
}
