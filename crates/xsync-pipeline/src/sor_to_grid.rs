//! SOR → Grid pipeline (§4.7.1): fetch schema, fetch records, transform each
//! record through the type mapper, read the grid to tell new rows from
//! existing ones, write in batches, propagate dropdown choices, and persist
//! the run's content hashes.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use xsync_grid_client::{column_index_to_letter, DropdownValidation};
use xsync_hashstate::{content_hash, is_empty_row, record_entry};
use xsync_runlog::RunAccumulator;
use xsync_schemas::{EngineError, ErrorKind, SorFieldType, SyncConfig, RESERVED_ID_COLUMN};
use xsync_sor_client::ListRecordsParams;

use crate::common::{
    budget_exceeded, enforce_max_records, header_row, mapped_width, materialize_row,
    preload_linked_primary_fields, read_reserved_id, reserved_id_letter, resolve_sheet,
    row_fields_from_sor_record, PipelineDeps, RunOptions,
};
use crate::report::RunReport;

struct TransformedRecord {
    record_id: String,
    cells: BTreeMap<u32, Value>,
    hash: String,
}

pub async fn run(deps: &PipelineDeps, pool: &PgPool, cfg: &SyncConfig, opts: &RunOptions) -> RunReport {
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

    let params = ListRecordsParams {
        view: cfg.sor_view_id.clone(),
        sort_field: if cfg.sor_view_id.is_none() { schema.primary_field().map(|f| f.id.clone()) } else { None },
        max_records: opts.max_records.and_then(|m| u32::try_from(m).ok()),
        filter_formula: None,
    };
    let records = match deps.sor.list_records(&opts.sor_token, &cfg.sor_base_id, &cfg.sor_table_id, &params).await {
        Ok(r) => r,
        Err(e) => return RunReport::fatal(e),
    };

    // One resolver call per linked field, batched across every record,
    // rather than one round trip per record per linked cell.
    let mut linked_names_by_record: HashMap<String, HashMap<String, Vec<String>>> = HashMap::new();
    for (field_id, _) in cfg.mappings_in_column_order() {
        let Some(field) = schema.field(field_id) else { continue };
        let linked_table_id = match &field.field_type {
            SorFieldType::LinkedRecords { linked_table_id } => linked_table_id.clone(),
            _ => continue,
        };
        let primary_field_id = linked_primary_fields.get(&linked_table_id).cloned().unwrap_or_default();

        let mut ids: Vec<String> = records
            .iter()
            .filter_map(|r| r.fields.get(field_id).and_then(Value::as_array))
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
            .resolve_ids_to_names(&opts.sor_token, &cfg.sor_base_id, &linked_table_id, &primary_field_id, &ids, false)
            .await
        {
            Ok(resolved) => {
                warnings.extend(resolved.warnings);
                let name_of: HashMap<String, String> = resolved.resolved.into_iter().collect();
                for record in &records {
                    let Some(arr) = record.fields.get(field_id).and_then(Value::as_array) else { continue };
                    let names: Vec<String> =
                        arr.iter().filter_map(Value::as_str).filter_map(|id| name_of.get(id).cloned()).collect();
                    linked_names_by_record.entry(record.id.clone()).or_default().insert(field_id.to_string(), names);
                }
            }
            Err(e) => warnings.push(format!("linked field '{field_id}' resolution failed: {e}")),
        }
    }

    let empty_names: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for record in &records {
        if opts.cancellation.is_cancelled() {
            warnings.push("cancelled before every record was transformed".to_string());
            break;
        }
        if budget_exceeded(run_started_at, opts) {
            budget_hit = true;
            warnings.push("soft time budget exceeded before every record was transformed".to_string());
            break;
        }

        let fields = row_fields_from_sor_record(record, &schema, cfg);
        if is_empty_row(&fields) {
            continue;
        }
        let hash = content_hash(&fields);

        let mut cells = BTreeMap::new();
        let mut row_error = None;
        let mut row_warnings = Vec::new();
        for (field_id, col) in cfg.mappings_in_column_order() {
            let Some(field) = schema.field(field_id) else { continue };
            let raw = record.fields.get(field_id);
            let names =
                linked_names_by_record.get(&record.id).and_then(|m| m.get(field_id)).unwrap_or(&empty_names);
            let conv = xsync_typemap::sor_to_grid(&field.field_type, raw, names);
            if let Some(first) = conv.errors.into_iter().next() {
                row_error.get_or_insert(
                    EngineError::validation(format!("field '{field_id}': {first}")).with_record_key(record.id.clone()),
                );
            }
            row_warnings.extend(conv.warnings);
            cells.insert(col, conv.value);
        }
        warnings.extend(row_warnings);

        match row_error {
            Some(e) => acc.record_error(e),
            None => rows.push(TransformedRecord { record_id: record.id.clone(), cells, hash }),
        }
    }

    let sheet_values = match deps.grid.get_values(&opts.grid_token, &cfg.grid_workbook_id, &sheet.title, None).await {
        Ok(v) => v,
        Err(e) => return RunReport::fatal(e),
    };
    let grid_is_empty = sheet_values.is_empty();

    // Rows already carrying a known SOR id are updates; everything else is
    // appended. A pre-existing row whose reserved column holds text that
    // isn't one of this run's record ids (rather than blank) is left
    // untouched and its id insertion skipped (§8).
    let known_record_ids: std::collections::HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
    let mut existing_row_of: HashMap<String, usize> = HashMap::new();
    for (i, row) in sheet_values.iter().enumerate().skip(if grid_is_empty { 0 } else { 1 }) {
        if let Some(id) = read_reserved_id(row) {
            if known_record_ids.contains(id.as_str()) {
                existing_row_of.insert(id, i + 1);
            } else {
                tracing::warn!(
                    sheet = %sheet.title,
                    row = i + 1,
                    "reserved id column already held non-id text; skipping id insertion for this row"
                );
            }
        }
    }

    let width = mapped_width(cfg);
    let id_letter = reserved_id_letter();
    let last_letter = column_index_to_letter(width.saturating_sub(1));

    if grid_is_empty && !opts.dry_run {
        let header = vec![header_row(&schema, cfg)];
        if let Err(e) = deps.grid.append_rows(&opts.grid_token, &cfg.grid_workbook_id, &sheet.title, &header).await {
            return RunReport::fatal(e);
        }
        if let Err(e) =
            deps.grid.ensure_column_count(&opts.grid_token, &cfg.grid_workbook_id, sheet.sheet_id, RESERVED_ID_COLUMN + 1).await
        {
            warnings.push(format!("could not extend sheet to the reserved id column: {e}"));
        } else if let Err(e) =
            deps.grid.hide_column(&opts.grid_token, &cfg.grid_workbook_id, sheet.sheet_id, RESERVED_ID_COLUMN).await
        {
            warnings.push(format!("could not hide the reserved id column: {e}"));
        }
    }

    let rows = enforce_max_records(rows, opts, &mut warnings);

    let mut added = 0u64;
    let mut updated = 0u64;
    let mut to_append = Vec::new();

    for row in rows {
        if let Some(&row_number) = existing_row_of.get(&row.record_id) {
            if let Some(prior) = snapshot.entries.get(&row.record_id) {
                if prior.content_hash == row.hash {
                    acc.record_success();
                    record_entry(&mut snapshot, row.record_id.clone(), row.hash.clone(), Some(now), None, now);
                    continue;
                }
            }

            if !opts.dry_run {
                let range = format!("{}!A{row_number}:{last_letter}{row_number}", sheet.title);
                let values = vec![materialize_row(&row.cells, width)];
                if let Err(e) = deps.grid.update_values(&opts.grid_token, &cfg.grid_workbook_id, &range, &values).await {
                    acc.record_error(e.with_record_key(row.record_id.clone()));
                    continue;
                }
            }
            updated += 1;
            acc.record_success();
            record_entry(&mut snapshot, row.record_id.clone(), row.hash.clone(), Some(now), None, now);
        } else {
            to_append.push(row);
        }
    }

    let mut next_row = if grid_is_empty { 2 } else { sheet_values.len() + 1 };
    for batch in to_append.chunks(crate::common::GRID_WRITE_BATCH) {
        if opts.cancellation.is_cancelled() {
            warnings.push("cancelled before every new row was written".to_string());
            break;
        }
        if budget_exceeded(run_started_at, opts) {
            budget_hit = true;
            warnings.push("soft time budget exceeded before every new row was written".to_string());
            break;
        }

        let values: Vec<Vec<Value>> = batch.iter().map(|r| materialize_row(&r.cells, width)).collect();
        if !opts.dry_run {
            if let Err(e) = deps.grid.append_rows(&opts.grid_token, &cfg.grid_workbook_id, &sheet.title, &values).await {
                for row in batch {
                    acc.record_error(e.clone().with_record_key(row.record_id.clone()));
                }
                next_row += batch.len();
                continue;
            }

            let id_range = format!("{}!{id_letter}{next_row}:{id_letter}{}", sheet.title, next_row + batch.len() - 1);
            let id_values: Vec<Vec<Value>> =
                batch.iter().map(|r| vec![Value::String(r.record_id.clone())]).collect();
            if let Err(e) = deps.grid.update_values(&opts.grid_token, &cfg.grid_workbook_id, &id_range, &id_values).await {
                warnings.push(format!("appended {} rows but could not stamp their ids: {e}", batch.len()));
            }
        }

        for row in batch {
            added += 1;
            acc.record_success();
            record_entry(&mut snapshot, row.record_id.clone(), row.hash.clone(), Some(now), None, now);
        }
        next_row += batch.len();
    }

    let validations: Vec<DropdownValidation> = cfg
        .mappings_in_column_order()
        .into_iter()
        .filter_map(|(field_id, col)| {
            let field = schema.field(field_id)?;
            match &field.field_type {
                SorFieldType::SingleSelect { options } => {
                    Some(DropdownValidation { column_index: col, choices: options.clone(), strict: true })
                }
                SorFieldType::MultipleSelects { options } => {
                    Some(DropdownValidation { column_index: col, choices: options.clone(), strict: false })
                }
                _ => None,
            }
        })
        .collect();
    if !validations.is_empty() && !opts.dry_run {
        if let Err(e) = deps
            .grid
            .batch_set_dropdown_validation(&opts.grid_token, &cfg.grid_workbook_id, sheet.sheet_id, &validations)
            .await
        {
            warnings.push(format!("dropdown validation propagation failed: {e}"));
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
        deleted: 0,
        failed: acc.records_failed,
        errors: acc.synchronous_errors().iter().map(to_error_summary).collect(),
        warnings,
        conflicts: None,
    }
}

fn to_error_summary(e: &EngineError) -> crate::report::ErrorSummary {
    crate::report::ErrorSummary { kind: e.kind, message: e.message.clone(), record_key: e.record_key.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use xsync_grid_client::{GridClient, SheetMetadata, WorkbookMetadata, WriteConfirmation};
    use xsync_linked::LinkedRecordResolver;
    use xsync_schemas::{EngineResult, FieldSchema, SorRecord, SyncDirection, TableSchema};
    use xsync_sor_client::SorClient;

    struct FakeSor {
        schema: TableSchema,
        records: Vec<SorRecord>,
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
            Ok(self.records.clone())
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
            for (i, row) in values.iter().enumerate() {
                if i >= rows.len() {
                    rows.push(row.clone());
                }
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

    fn config() -> SyncConfig {
        SyncConfig {
            id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            name: "test".into(),
            sor_base_id: "base1".into(),
            sor_table_id: "tbl1".into(),
            sor_view_id: None,
            grid_workbook_id: "wb1".into(),
            grid_sheet_id: "1".into(),
            field_mappings: HashMap::from([("name".to_string(), 0u32)]),
            direction: SyncDirection::SorToGrid,
            conflict_strategy: None,
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

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointed at a live Postgres instance"]
    async fn first_run_writes_header_and_appends_every_record() {
        let schema = TableSchema {
            id: "tbl1".into(),
            name: "People".into(),
            primary_field_id: "name".into(),
            fields: vec![FieldSchema { id: "name".into(), name: "Name".into(), field_type: SorFieldType::Text }],
        };
        let records = vec![
            SorRecord { id: "r1".into(), fields: HashMap::from([("name".to_string(), serde_json::json!("Ada"))]) },
            SorRecord { id: "r2".into(), fields: HashMap::from([("name".to_string(), serde_json::json!("Bob"))]) },
        ];
        let d = deps(FakeSor { schema, records }, FakeGrid { values: std::sync::Mutex::new(vec![]) });
        let cfg = config();
        let pool = xsync_db::testkit_db_pool().await.unwrap();
        xsync_db::insert_sync_config(&pool, &cfg).await.unwrap();

        let opts = RunOptions::standard("sor-tok".into(), "grid-tok".into());
        let report = run(&d, &pool, &cfg, &opts).await;

        assert_eq!(report.added, 2);
        assert_eq!(report.updated, 0);
        assert_eq!(report.failed, 0);
    }
}
