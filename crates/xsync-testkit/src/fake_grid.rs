use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use xsync_grid_client::{
    DropdownValidation, GridClient, SheetMetadata, WorkbookMetadata, WriteConfirmation,
};
use xsync_schemas::EngineResult;

/// In-memory `GridClient` double backed by a single sheet's row grid.
/// `update_values`/`append_rows` mutate the stored rows so a pipeline's
/// full run (read current state, write changes) round-trips the way it
/// would against the real API.
pub struct FakeGridClient {
    title: String,
    sheet_title: String,
    rows: Mutex<Vec<Vec<Value>>>,
}

impl FakeGridClient {
    pub fn new(sheet_title: impl Into<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { title: "fixture workbook".to_string(), sheet_title: sheet_title.into(), rows: Mutex::new(rows) }
    }

    pub fn rows(&self) -> Vec<Vec<Value>> {
        self.rows.lock().unwrap().clone()
    }
}

/// Parses the 1-based row number out of an `A1`-style range like
/// `Sheet1!A3:Z3`. Returns `None` for ranges this fixture doesn't model
/// (e.g. unbounded column ranges); callers only ever pass single-row
/// ranges, matching how the pipelines build them.
fn row_number(a1_range: &str) -> Option<usize> {
    let after_sheet = a1_range.rsplit('!').next()?;
    let first_cell = after_sheet.split(':').next()?;
    first_cell.trim_start_matches(|c: char| c.is_ascii_alphabetic()).parse().ok()
}

#[async_trait]
impl GridClient for FakeGridClient {
    async fn get_metadata(&self, _token: &str, _workbook_id: &str) -> EngineResult<WorkbookMetadata> {
        Ok(WorkbookMetadata {
            title: self.title.clone(),
            sheets: vec![SheetMetadata {
                sheet_id: 1,
                title: self.sheet_title.clone(),
                row_count: 1000,
                column_count: 30,
            }],
        })
    }

    async fn get_values(
        &self,
        _token: &str,
        _workbook_id: &str,
        _sheet_title: &str,
        _a1_range: Option<&str>,
    ) -> EngineResult<Vec<Vec<Value>>> {
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn update_values(
        &self,
        _token: &str,
        _workbook_id: &str,
        a1_range: &str,
        values: &[Vec<Value>],
    ) -> EngineResult<WriteConfirmation> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(start_row) = row_number(a1_range) {
            for (offset, new_row) in values.iter().enumerate() {
                let idx = start_row - 1 + offset;
                while rows.len() <= idx {
                    rows.push(Vec::new());
                }
                rows[idx] = new_row.clone();
            }
        }
        Ok(WriteConfirmation { updated_range: a1_range.to_string(), updated_rows: values.len() })
    }

    async fn append_rows(
        &self,
        _token: &str,
        _workbook_id: &str,
        _sheet_title: &str,
        values: &[Vec<Value>],
    ) -> EngineResult<WriteConfirmation> {
        let mut rows = self.rows.lock().unwrap();
        rows.extend(values.iter().cloned());
        Ok(WriteConfirmation { updated_range: String::new(), updated_rows: values.len() })
    }

    async fn ensure_column_count(&self, _token: &str, _workbook_id: &str, _sheet_id: i64, _n: u32) -> EngineResult<()> {
        Ok(())
    }

    async fn hide_column(&self, _token: &str, _workbook_id: &str, _sheet_id: i64, _column_index: u32) -> EngineResult<()> {
        Ok(())
    }

    async fn batch_set_dropdown_validation(
        &self,
        _token: &str,
        _workbook_id: &str,
        _sheet_id: i64,
        _validations: &[DropdownValidation],
    ) -> EngineResult<()> {
        Ok(())
    }
}
