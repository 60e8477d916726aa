//! Bidirectional pipeline (§4.7.3): fetch both sides → classify every
//! record key against the prior snapshot → resolve whatever classifies as a
//! conflict → apply the SOR-wins/grid-wins/non-conflicting changes to
//! whichever side is behind → persist the new snapshot.
//!
//! Conflicting keys go through [`xsync_conflict`]; everything else (a plain
//! one-sided create or edit) is applied directly, the same as the
//! unidirectional pipelines would, just picked per-record instead of
//! per-run.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use xsync_conflict::{detect_conflicts, resolve_conflicts, ConflictAction};
use xsync_hashstate::{classify, content_hash, is_empty_row, record_entry, ChangeKind, CurrentHashes, RowFields};
use xsync_runlog::RunAccumulator;
use xsync_schemas::{EngineError, ErrorKind, RecordKey, SorFieldType, SorRecord, SyncConfig};

use crate::common::{
    budget_exceeded, cell_at, preload_linked_primary_fields, read_reserved_id, reserved_id_letter,
    resolve_sheet, row_fields_from_sor_record, PipelineDeps, RunOptions,
};
use crate::report::{ConflictCounts, RunReport};

struct GridRowState {
    row_number: usize,
    record_id: Option<String>,
    fields: RowFields,
}

enum Action {
    WriteGridFromSor,
    WriteSorFromGrid,
    DeleteFromGrid,
    DeleteFromSor,
    NoOp,
}

pub async fn run(deps: &PipelineDeps, pool: &PgPool, cfg: &SyncConfig, opts: &RunOptions) -> RunReport {
    let strategy = match cfg.conflict_strategy {
        Some(s) => s,
        None => return RunReport::fatal(EngineError::config("BIDIRECTIONAL sync requires a conflict_strategy")),
    };

    let mut acc = RunAccumulator::new();
    let mut warnings = Vec::new();
    let now = Utc::now();
    let run_started_at = std::time::Instant::now();
    let mut budget_hit = false;

    let tables = match deps.sor.list_tables(&opts.sor_token, &cfg.sor_base_id).await {
        Ok(t) => t,
        Err(e) => return RunReport::fatal(e),
    };
    let schema = match tables.into_iter().find(|t| t.id == cfg.sor_table_id) {
        Some(s) => s,
        None => {
            return RunReport::fatal(EngineError::new(
                ErrorKind::Fetch,
                format!("table '{}' not found in SOR base '{}'", cfg.sor_table_id, cfg.sor_base_id),
            ))
        }
    };
    let linked_primary_fields =
        match preload_linked_primary_fields(&deps.sor, &opts.sor_token, &cfg.sor_base_id, &schema, cfg).await {
            Ok(m) => m,
            Err(e) => return RunReport::fatal(e),
        };
    let mut snapshot = match xsync_db::load_hash_snapshot(pool, cfg.id).await {
        Ok(s) => s,
        Err(e) => return RunReport::fatal(EngineError::database(e.to_string())),
    };

    let sheet = match resolve_sheet(&deps.grid, &opts.grid_token, &cfg.grid_workbook_id, &cfg.grid_sheet_id).await {
        Ok(s) => s,
        Err(e) => return RunReport::fatal(e),
    };
    let sheet_values = match deps.grid.get_values(&opts.grid_token, &cfg.grid_workbook_id, &sheet.title, None).await {
        Ok(v) => v,
        Err(e) => return RunReport::fatal(e),
    };
    let records = match deps
        .sor
        .list_records(&opts.sor_token, &cfg.sor_base_id, &cfg.sor_table_id, &xsync_sor_client::ListRecordsParams::default())
        .await
    {
        Ok(r) => r,
        Err(e) => return RunReport::fatal(e),
    };

    let mappings = cfg.mappings_in_column_order();
    let mut linked_field_ids: Vec<(String, String, String)> = Vec::new();
    for (field_id, _) in &mappings {
        if let Some(field) = schema.field(field_id) {
            if let SorFieldType::LinkedRecords { linked_table_id } = &field.field_type {
                let primary_field_id = linked_primary_fields.get(linked_table_id).cloned().unwrap_or_default();
                linked_field_ids.push((field_id.to_string(), linked_table_id.clone(), primary_field_id));
            }
        }
    }

    // SOR side: record id -> normalized fields, plus the original record (for
    // display-name conversion when writing that record's cells into the grid).
    let mut sor_fields: HashMap<RecordKey, RowFields> = HashMap::new();
    let mut sor_records_by_id: HashMap<RecordKey, &SorRecord> = HashMap::new();
    for record in &records {
        let fields = row_fields_from_sor_record(record, &schema, cfg);
        if is_empty_row(&fields) {
            continue;
        }
        sor_fields.insert(record.id.clone(), fields);
        sor_records_by_id.insert(record.id.clone(), record);
    }

    // One resolver call per linked field across all SOR records, so writing
    // any of them to the grid can render ids as display names.
    let mut sor_linked_names: HashMap<RecordKey, HashMap<String, Vec<String>>> = HashMap::new();
    for (field_id, linked_table_id, primary_field_id) in &linked_field_ids {
        let mut ids: Vec<String> = records
            .iter()
            .filter_map(|r| r.fields.get(field_id.as_str()).and_then(Value::as_array))
            .flatten()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            continue;
        }
        match deps
            .linked
            .resolve_ids_to_names(&opts.sor_token, &cfg.sor_base_id, linked_table_id, primary_field_id, &ids, false)
            .await
        {
            Ok(resolved) => {
                warnings.extend(resolved.warnings);
                let name_of: HashMap<String, String> = resolved.resolved.into_iter().collect();
                for record in &records {
                    let Some(arr) = record.fields.get(field_id.as_str()).and_then(Value::as_array) else { continue };
                    let names: Vec<String> =
                        arr.iter().filter_map(Value::as_str).filter_map(|id| name_of.get(id).cloned()).collect();
                    sor_linked_names.entry(record.id.clone()).or_default().insert(field_id.clone(), names);
                }
            }
            Err(e) => warnings.push(format!("linked field '{field_id}' resolution failed: {e}")),
        }
    }

    // Grid side: convert every data row, resolving linked display names to
    // ids so both sides hash on the same id-based representation.
    let mut grid_name_sets: HashMap<String, std::collections::HashSet<String>> = HashMap::new();
    let mut grid_raw: Vec<(usize, Option<String>, HashMap<String, Value>)> = Vec::new();
    for (i, row) in sheet_values.iter().enumerate().skip(1.min(sheet_values.len())) {
        let row_number = i + 1;
        let record_id = read_reserved_id(row);
        let mut converted = HashMap::new();
        for (field_id, col) in &mappings {
            let Some(field) = schema.field(field_id) else { continue };
            let cell = cell_at(row, *col);
            let conv = xsync_typemap::grid_to_sor(&field.field_type, &cell);
            if let SorFieldType::LinkedRecords { .. } = &field.field_type {
                if let Some(names) = conv.value.as_array() {
                    grid_name_sets
                        .entry(field_id.to_string())
                        .or_default()
                        .extend(names.iter().filter_map(|v| v.as_str().map(str::to_string)));
                }
            }
            converted.insert(field_id.to_string(), conv.value);
        }
        grid_raw.push((row_number, record_id, converted));
    }

    let mut resolved_ids: HashMap<String, HashMap<String, String>> = HashMap::new();
    for (field_id, linked_table_id, primary_field_id) in &linked_field_ids {
        let names: Vec<String> = grid_name_sets.get(field_id).cloned().unwrap_or_default().into_iter().collect();
        if names.is_empty() {
            continue;
        }
        match deps
            .linked
            .resolve_names_to_ids(&opts.sor_token, &cfg.sor_base_id, linked_table_id, primary_field_id, &names, false)
            .await
        {
            Ok(result) => {
                warnings.extend(result.warnings);
                resolved_ids.insert(field_id.clone(), result.resolved.into_iter().collect());
            }
            Err(e) => warnings.push(format!("linked field '{field_id}' resolution failed: {e}")),
        }
    }

    let mut grid_rows: HashMap<RecordKey, GridRowState> = HashMap::new();
    for (row_number, record_id, converted) in grid_raw {
        let mut fields: RowFields = BTreeMap::new();
        for (field_id, _) in &mappings {
            let value = converted.get(field_id.as_str()).cloned().unwrap_or(Value::Null);
            let normalized = if let Some(map) = resolved_ids.get(field_id.as_str()) {
                let ids: Vec<String> = value
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str()).filter_map(|n| map.get(n).cloned()).collect())
                    .unwrap_or_default();
                xsync_hashstate::normalize_linked_ids(&ids)
            } else {
                value
            };
            fields.insert(field_id.to_string(), normalized);
        }
        if is_empty_row(&fields) {
            continue;
        }
        let key = record_id.clone().unwrap_or_else(|| xsync_schemas::row_key(row_number));
        grid_rows.insert(key, GridRowState { row_number, record_id, fields });
    }

    let mut current: BTreeMap<RecordKey, CurrentHashes> = BTreeMap::new();
    for (key, fields) in &sor_fields {
        current.entry(key.clone()).or_default().sor_hash = Some(content_hash(fields));
    }
    for (key, state) in &grid_rows {
        current.entry(key.clone()).or_default().grid_hash = Some(content_hash(&state.fields));
    }

    let conflicts = detect_conflicts(&snapshot, &current);
    let decisions = resolve_conflicts(&conflicts, strategy);
    let decision_by_key: HashMap<&RecordKey, &xsync_conflict::Decision> =
        decisions.iter().map(|d| (&d.key, d)).collect();
    let conflict_kind_by_key: HashMap<&RecordKey, ChangeKind> =
        conflicts.iter().map(|c| (&c.key, c.kind)).collect();

    let mut counts = ConflictCounts::default();
    counts.total = conflicts.len() as u64;
    for d in &decisions {
        match d.action {
            ConflictAction::UseSor => counts.sor_wins += 1,
            ConflictAction::UseGrid => counts.grid_wins += 1,
            ConflictAction::Delete => counts.deleted += 1,
            ConflictAction::Skip => counts.skipped += 1,
        }
    }

    let mut added = 0u64;
    let mut updated = 0u64;
    let mut deleted = 0u64;
    let id_letter = reserved_id_letter();

    for (key, hashes) in &current {
        if opts.cancellation.is_cancelled() {
            warnings.push("cancelled before every record was reconciled".to_string());
            break;
        }
        if budget_exceeded(run_started_at, opts) {
            budget_hit = true;
            warnings.push("soft budget exceeded before every record was reconciled".to_string());
            break;
        }
        if let Some(max) = opts.max_records {
            if added + updated + deleted >= max {
                warnings.push(format!(
                    "run hit its plan cap of {max} record(s); remaining records were left for a later run"
                ));
                break;
            }
        }

        let kind = classify(&snapshot, key, hashes);
        let action = match kind {
            ChangeKind::NewInSor | ChangeKind::SorOnlyChange => Action::WriteGridFromSor,
            ChangeKind::NewInGrid | ChangeKind::GridOnlyChange => Action::WriteSorFromGrid,
            ChangeKind::Unchanged => Action::NoOp,
            ChangeKind::BothModified | ChangeKind::DeletedInGrid | ChangeKind::DeletedInSor => {
                match decision_by_key.get(key).map(|d| d.action) {
                    Some(ConflictAction::UseSor) => Action::WriteGridFromSor,
                    Some(ConflictAction::UseGrid) => Action::WriteSorFromGrid,
                    Some(ConflictAction::Delete) => {
                        match conflict_kind_by_key.get(key) {
                            Some(ChangeKind::DeletedInSor) => Action::DeleteFromGrid,
                            _ => Action::DeleteFromSor,
                        }
                    }
                    _ => Action::NoOp,
                }
            }
        };

        match action {
            Action::NoOp => {
                if let Some(fields) = sor_fields.get(key).or_else(|| grid_rows.get(key).map(|r| &r.fields)) {
                    record_entry(&mut snapshot, key.clone(), content_hash(fields), None, None, now);
                }
                acc.record_success();
            }
            Action::WriteGridFromSor => {
                let Some(fields) = sor_fields.get(key) else { continue };
                let hash = content_hash(fields);
                if opts.dry_run {
                    updated += 1;
                } else if let Some(existing) = grid_rows.get(key) {
                    let width = crate::common::mapped_width(cfg);
                    let last_letter = xsync_grid_client::column_index_to_letter(width.saturating_sub(1));
                    let range = format!("{}!A{}:{last_letter}{}", sheet.title, existing.row_number, existing.row_number);
                    let row = materialize_from_sor(fields, &mappings, width);
                    match deps.grid.update_values(&opts.grid_token, &cfg.grid_workbook_id, &range, &[row]).await {
                        Ok(_) => updated += 1,
                        Err(e) => {
                            acc.record_error(e.with_record_key(key.clone()));
                            continue;
                        }
                    }
                } else {
                    let width = crate::common::mapped_width(cfg);
                    let row = materialize_from_sor(fields, &mappings, width);
                    match deps.grid.append_rows(&opts.grid_token, &cfg.grid_workbook_id, &sheet.title, &[row]).await {
                        Ok(confirmation) => {
                            added += 1;
                            let new_row = sheet_values.len() + confirmation.updated_rows;
                            let range = format!("{}!{id_letter}{new_row}:{id_letter}{new_row}", sheet.title);
                            let _ = deps
                                .grid
                                .update_values(&opts.grid_token, &cfg.grid_workbook_id, &range, &[vec![Value::String(key.clone())]])
                                .await;
                        }
                        Err(e) => {
                            acc.record_error(e.with_record_key(key.clone()));
                            continue;
                        }
                    }
                }
                acc.record_success();
                record_entry(&mut snapshot, key.clone(), hash, Some(now), None, now);
            }
            Action::WriteSorFromGrid => {
                let Some(state) = grid_rows.get(key) else { continue };
                let hash = content_hash(&state.fields);
                let field_map: HashMap<String, Value> =
                    state.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                if opts.dry_run {
                    if state.record_id.is_some() {
                        updated += 1;
                    } else {
                        added += 1;
                    }
                } else if let Some(id) = &state.record_id {
                    let payload = vec![SorRecord { id: id.clone(), fields: field_map }];
                    match deps.sor.update_records(&opts.sor_token, &cfg.sor_base_id, &cfg.sor_table_id, &payload).await {
                        Ok(_) => updated += 1,
                        Err(e) => {
                            acc.record_error(e.with_record_key(key.clone()));
                            continue;
                        }
                    }
                } else {
                    let payload = vec![SorRecord { id: String::new(), fields: field_map }];
                    match deps.sor.create_records(&opts.sor_token, &cfg.sor_base_id, &cfg.sor_table_id, &payload).await {
                        Ok(created) => {
                            added += 1;
                            if let Some(new_record) = created.first() {
                                let range = format!("{}!{id_letter}{}:{id_letter}{}", sheet.title, state.row_number, state.row_number);
                                let _ = deps
                                    .grid
                                    .update_values(&opts.grid_token, &cfg.grid_workbook_id, &range, &[vec![Value::String(new_record.id.clone())]])
                                    .await;
                                acc.record_success();
                                record_entry(&mut snapshot, new_record.id.clone(), hash, None, Some(now), now);
                                continue;
                            }
                        }
                        Err(e) => {
                            acc.record_error(e.with_record_key(key.clone()));
                            continue;
                        }
                    }
                }
                acc.record_success();
                record_entry(&mut snapshot, key.clone(), hash, None, Some(now), now);
            }
            Action::DeleteFromGrid => {
                if let Some(state) = grid_rows.get(key) {
                    if !opts.dry_run {
                        let last = xsync_grid_client::column_index_to_letter(crate::common::mapped_width(cfg).saturating_sub(1));
                        let range = format!("{}!A{}:{last}{}", sheet.title, state.row_number, state.row_number);
                        let blank = vec![vec![Value::String(String::new()); mappings.len()]];
                        let _ = deps.grid.update_values(&opts.grid_token, &cfg.grid_workbook_id, &range, &blank).await;
                    }
                }
                deleted += 1;
                acc.record_success();
                snapshot.entries.remove(key);
            }
            Action::DeleteFromSor => {
                if !opts.dry_run {
                    if let Err(e) =
                        deps.sor.delete_records(&opts.sor_token, &cfg.sor_base_id, &cfg.sor_table_id, std::slice::from_ref(key)).await
                    {
                        warnings.push(format!("could not delete SOR record '{key}': {e}"));
                    }
                }
                deleted += 1;
                acc.record_success();
                snapshot.entries.remove(key);
            }
        }
    }

    snapshot.last_sync_time = Some(now);
    if !opts.dry_run {
        if let Err(e) = xsync_db::save_hash_snapshot(pool, cfg.id, &snapshot).await {
            warnings.push(format!("run completed but hash snapshot did not persist: {e}"));
        }
    }

    RunReport {
        status: if budget_hit { xsync_schemas::SyncStatus::Partial } else { acc.implied_status() },
        added,
        updated,
        deleted,
        failed: acc.records_failed,
        errors: acc.synchronous_errors().iter().map(to_error_summary).collect(),
        warnings,
        conflicts: Some(counts),
    }
}

fn materialize_from_sor(fields: &RowFields, mappings: &[(&str, u32)], width: u32) -> Vec<Value> {
    let mut cells: BTreeMap<u32, Value> = BTreeMap::new();
    for (field_id, col) in mappings {
        cells.insert(*col, fields.get(*field_id).cloned().unwrap_or(Value::Null));
    }
    crate::common::materialize_row(&cells, width)
}

fn to_error_summary(e: &EngineError) -> crate::report::ErrorSummary {
    crate::report::ErrorSummary { kind: e.kind, message: e.message.clone(), record_key: e.record_key.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use xsync_grid_client::{DropdownValidation, GridClient, SheetMetadata, WorkbookMetadata, WriteConfirmation};
    use xsync_linked::LinkedRecordResolver;
    use xsync_schemas::{
        ConflictStrategy, EngineResult, FieldSchema, HashEntry, SorFieldType as FT, SyncDirection, TableSchema,
    };
    use xsync_sor_client::{ListRecordsParams, SorClient};

    struct FakeSor {
        schema: TableSchema,
        records: std::sync::Mutex<Vec<SorRecord>>,
    }

    #[async_trait]
    impl SorClient for FakeSor {
        async fn list_tables(&self, _token: &str, _base_id: &str) -> EngineResult<Vec<TableSchema>> {
            Ok(vec![self.schema.clone()])
        }
        async fn list_records(
            &self,
            _token: &str,
            _base_id: &str,
            _table_id: &str,
            _params: &ListRecordsParams,
        ) -> EngineResult<Vec<SorRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }
        async fn create_records(&self, _t: &str, _b: &str, _tb: &str, r: &[SorRecord]) -> EngineResult<Vec<SorRecord>> {
            Ok(r.to_vec())
        }
        async fn update_records(&self, _t: &str, _b: &str, _tb: &str, r: &[SorRecord]) -> EngineResult<Vec<SorRecord>> {
            Ok(r.to_vec())
        }
        async fn delete_records(&self, _t: &str, _b: &str, _tb: &str, _ids: &[String]) -> EngineResult<()> {
            Ok(())
        }
    }

    struct FakeGrid {
        values: std::sync::Mutex<Vec<Vec<Value>>>,
    }

    #[async_trait]
    impl GridClient for FakeGrid {
        async fn get_metadata(&self, _t: &str, _w: &str) -> EngineResult<WorkbookMetadata> {
            Ok(WorkbookMetadata {
                title: "wb".into(),
                sheets: vec![SheetMetadata { sheet_id: 1, title: "Sheet1".into(), row_count: 100, column_count: 30 }],
            })
        }
        async fn get_values(&self, _t: &str, _w: &str, _s: &str, _r: Option<&str>) -> EngineResult<Vec<Vec<Value>>> {
            Ok(self.values.lock().unwrap().clone())
        }
        async fn update_values(&self, _t: &str, _w: &str, _r: &str, values: &[Vec<Value>]) -> EngineResult<WriteConfirmation> {
            let mut rows = self.values.lock().unwrap();
            if let Some(row_num) = parse_row_number(_r) {
                while rows.len() < row_num {
                    rows.push(Vec::new());
                }
                rows[row_num - 1] = values[0].clone();
            }
            Ok(WriteConfirmation { updated_range: _r.to_string(), updated_rows: values.len() })
        }
        async fn append_rows(&self, _t: &str, _w: &str, _s: &str, values: &[Vec<Value>]) -> EngineResult<WriteConfirmation> {
            let mut rows = self.values.lock().unwrap();
            rows.extend(values.iter().cloned());
            Ok(WriteConfirmation { updated_range: String::new(), updated_rows: values.len() })
        }
        async fn ensure_column_count(&self, _t: &str, _w: &str, _s: i64, _n: u32) -> EngineResult<()> {
            Ok(())
        }
        async fn hide_column(&self, _t: &str, _w: &str, _s: i64, _c: u32) -> EngineResult<()> {
            Ok(())
        }
        async fn batch_set_dropdown_validation(
            &self,
            _t: &str,
            _w: &str,
            _s: i64,
            _v: &[DropdownValidation],
        ) -> EngineResult<()> {
            Ok(())
        }
    }

    fn parse_row_number(a1_range: &str) -> Option<usize> {
        let after_bang = a1_range.split('!').nth(1)?;
        let first_cell = after_bang.split(':').next()?;
        first_cell.trim_start_matches(|c: char| c.is_ascii_alphabetic()).parse().ok()
    }

    fn schema() -> TableSchema {
        TableSchema {
            id: "tbl1".into(),
            name: "People".into(),
            primary_field_id: "name".into(),
            fields: vec![
                FieldSchema { id: "name".into(), name: "Name".into(), field_type: FT::Text },
                FieldSchema { id: "tier".into(), name: "Tier".into(), field_type: FT::Text },
            ],
        }
    }

    fn config(strategy: ConflictStrategy) -> SyncConfig {
        SyncConfig {
            id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            name: "test".into(),
            sor_base_id: "base1".into(),
            sor_table_id: "tbl1".into(),
            sor_view_id: None,
            grid_workbook_id: "wb1".into(),
            grid_sheet_id: "1".into(),
            field_mappings: HashMap::from([("name".to_string(), 0u32), ("tier".to_string(), 1u32)]),
            direction: SyncDirection::Bidirectional,
            conflict_strategy: Some(strategy),
            is_active: true,
            last_sync_at: None,
            last_sync_status: None,
            last_error_at: None,
            last_error_message: None,
        }
    }

    fn deps(sor: FakeSor, grid: FakeGrid) -> PipelineDeps {
        let sor: Arc<dyn SorClient> = Arc::new(sor);
        PipelineDeps {
            linked: Arc::new(LinkedRecordResolver::new(sor.clone())),
            sor,
            grid: Arc::new(grid),
        }
    }

    fn row(cells: &[&str], id: Option<&str>) -> Vec<Value> {
        let mut row: Vec<Value> = cells.iter().map(|c| Value::String(c.to_string())).collect();
        while row.len() <= xsync_schemas::RESERVED_ID_COLUMN as usize {
            row.push(Value::Null);
        }
        row[xsync_schemas::RESERVED_ID_COLUMN as usize] =
            id.map(|s| Value::String(s.to_string())).unwrap_or(Value::Null);
        row
    }

    /// §8 scenario 4: SOR changed `r1.Tier` to "Business" while the grid
    /// simultaneously changed the cell to "Enterprise". Under `SorWins`, the
    /// both-modified conflict must restore the SOR's value into the grid.
    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointed at a live Postgres instance"]
    async fn both_modified_conflict_sor_wins_restores_grid_cell() {
        let record = SorRecord {
            id: "r1".into(),
            fields: HashMap::from([
                ("name".to_string(), serde_json::json!("Ada")),
                ("tier".to_string(), serde_json::json!("Business")),
            ]),
        };
        let d = deps(
            FakeSor { schema: schema(), records: std::sync::Mutex::new(vec![record]) },
            FakeGrid {
                values: std::sync::Mutex::new(vec![
                    vec![Value::String("Name".into()), Value::String("Tier".into())],
                    row(&["Ada", "Enterprise"], Some("r1")),
                ]),
            },
        );
        let cfg = config(ConflictStrategy::SorWins);
        let pool = xsync_db::testkit_db_pool().await.unwrap();
        xsync_db::insert_sync_config(&pool, &cfg).await.unwrap();

        // Seed a prior snapshot where both sides held "Pro" so the current
        // hashes on both sides now disagree with it (both-modified).
        let mut snapshot = xsync_schemas::HashSnapshot::default();
        let prior_fields: xsync_hashstate::RowFields = [
            ("name".to_string(), serde_json::json!("Ada")),
            ("tier".to_string(), serde_json::json!("Pro")),
        ]
        .into_iter()
        .collect();
        let prior_hash = content_hash(&prior_fields);
        snapshot.entries.insert(
            "r1".to_string(),
            HashEntry { content_hash: prior_hash, captured_at: Utc::now(), sor_modified_at: None, grid_modified_at: None },
        );
        xsync_db::save_hash_snapshot(&pool, cfg.id, &snapshot).await.unwrap();

        let opts = RunOptions::standard("sor-tok".into(), "grid-tok".into());
        let report = run(&d, &pool, &cfg, &opts).await;

        let conflicts = report.conflicts.expect("bidirectional run always reports conflicts");
        assert_eq!(conflicts.total, 1);
        assert_eq!(conflicts.sor_wins, 1);
        assert_eq!(d.grid.get_values("t", "wb1", "Sheet1", None).await.unwrap()[1][1], Value::String("Business".into()));
    }
}
