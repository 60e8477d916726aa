use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncDirection {
    SorToGrid,
    GridToSor,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    SorWins,
    GridWins,
    NewestWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Success,
    Partial,
    Failed,
}

/// Column index within a grid's mapped field layout. `26` ("AA") is reserved
/// for the SOR record id and must never appear in `field_mappings`.
pub type GridColumnIndex = u32;

pub const RESERVED_ID_COLUMN: GridColumnIndex = 26;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub sor_base_id: String,
    pub sor_table_id: String,
    pub sor_view_id: Option<String>,
    pub grid_workbook_id: String,
    pub grid_sheet_id: String,
    pub field_mappings: HashMap<String, GridColumnIndex>,
    pub direction: SyncDirection,
    pub conflict_strategy: Option<ConflictStrategy>,
    pub is_active: bool,
    pub last_sync_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_sync_status: Option<SyncStatus>,
    pub last_error_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error_message: Option<String>,
}

impl SyncConfig {
    /// Enforces the two structural invariants from §3: mapped column indices
    /// are unique and never the reserved id column, and BIDIRECTIONAL
    /// direction requires a conflict strategy.
    pub fn validate(&self) -> EngineResult<()> {
        let mut seen = std::collections::HashSet::new();
        for (field, col) in &self.field_mappings {
            if *col == RESERVED_ID_COLUMN {
                return Err(EngineError::validation(format!(
                    "field mapping {field} -> column {col} collides with the reserved id column"
                )));
            }
            if !seen.insert(*col) {
                return Err(EngineError::validation(format!(
                    "duplicate grid column index {col} in field mappings"
                )));
            }
        }
        if self.direction == SyncDirection::Bidirectional && self.conflict_strategy.is_none() {
            return Err(EngineError::validation(
                "BIDIRECTIONAL direction requires a conflict_strategy",
            ));
        }
        Ok(())
    }

    /// Field mappings sorted by destination column, the order in which
    /// header cells and row values must be written (§4.7).
    pub fn mappings_in_column_order(&self) -> Vec<(&str, GridColumnIndex)> {
        let mut v: Vec<(&str, GridColumnIndex)> = self
            .field_mappings
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        v.sort_by_key(|(_, col)| *col);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SyncConfig {
        SyncConfig {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            name: "test".into(),
            sor_base_id: "base".into(),
            sor_table_id: "table".into(),
            sor_view_id: None,
            grid_workbook_id: "wb".into(),
            grid_sheet_id: "sheet".into(),
            field_mappings: HashMap::new(),
            direction: SyncDirection::SorToGrid,
            conflict_strategy: None,
            is_active: true,
            last_sync_at: None,
            last_sync_status: None,
            last_error_at: None,
            last_error_message: None,
        }
    }

    #[test]
    fn rejects_reserved_column_collision() {
        let mut cfg = base_config();
        cfg.field_mappings.insert("Name".into(), RESERVED_ID_COLUMN);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_columns() {
        let mut cfg = base_config();
        cfg.field_mappings.insert("Name".into(), 0);
        cfg.field_mappings.insert("Tier".into(), 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bidirectional_requires_conflict_strategy() {
        let mut cfg = base_config();
        cfg.direction = SyncDirection::Bidirectional;
        assert!(cfg.validate().is_err());
        cfg.conflict_strategy = Some(ConflictStrategy::SorWins);
        assert!(cfg.validate().is_ok());
    }
}
