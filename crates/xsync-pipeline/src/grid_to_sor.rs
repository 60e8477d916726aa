//! Grid → SOR pipeline (§4.7.2): read the grid, resolve linked-record
//! display names back to ids, convert each mapped cell through the type
//! mapper, then create or update SOR records in batches and stamp newly
//! created ids back into the reserved column.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use xsync_hashstate::{content_hash, is_empty_row, record_entry, RowFields};
use xsync_runlog::RunAccumulator;
use xsync_schemas::{EngineError, SorFieldType, SorRecord, SyncConfig};
use xsync_sor_client::{ListRecordsParams, MAX_BATCH_SIZE};

use crate::common::{
    budget_exceeded, cell_at, enforce_max_records, preload_linked_primary_fields, read_reserved_id,
    reserved_id_letter, resolve_sheet, PipelineDeps, RunOptions,
};
use crate::report::RunReport;

struct GridRow {
    row_number: usize,
    record_id: Option<String>,
    fields: RowFields,
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
                xsync_schemas::ErrorKind::Fetch,
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
    if sheet_values.len() <= 1 {
        // No data rows beyond (or including) the header: nothing to push.
        return RunReport { status: xsync_schemas::SyncStatus::Success, added: 0, updated: 0, deleted: 0, failed: 0, errors: vec![], warnings, conflicts: None };
    }

    // Convert every mapped cell in every data row first, gathering linked
    // display names so each linked field resolves once across all rows
    // instead of once per cell.
    let mappings = cfg.mappings_in_column_order();
    let mut linked_field_ids: Vec<(String, String, String)> = Vec::new(); // (field_id, linked_table_id, primary_field_id)
    for (field_id, _) in &mappings {
        if let Some(field) = schema.field(field_id) {
            if let SorFieldType::LinkedRecords { linked_table_id } = &field.field_type {
                let primary_field_id = linked_primary_fields.get(linked_table_id).cloned().unwrap_or_default();
                linked_field_ids.push((field_id.to_string(), linked_table_id.clone(), primary_field_id));
            }
        }
    }

    let mut raw_cells: Vec<(usize, HashMap<String, Value>)> = Vec::new();
    let mut row_errors: HashMap<usize, EngineError> = HashMap::new();
    let mut linked_name_sets: HashMap<String, HashSet<String>> = HashMap::new(); // field_id -> names seen

    for (i, row) in sheet_values.iter().enumerate().skip(1) {
        if opts.cancellation.is_cancelled() {
            warnings.push("cancelled before every grid row was read".to_string());
            break;
        }
        if budget_exceeded(run_started_at, opts) {
            budget_hit = true;
            warnings.push("soft time budget exceeded before every grid row was read".to_string());
            break;
        }
        let row_number = i + 1;
        let mut converted = HashMap::new();
        for (field_id, col) in &mappings {
            let Some(field) = schema.field(field_id) else { continue };
            let cell = cell_at(row, *col);
            let conv = xsync_typemap::grid_to_sor(&field.field_type, &cell);
            for w in conv.warnings {
                warnings.push(format!("row {row_number} field '{field_id}': {w}"));
            }
            if let Some(first) = conv.errors.into_iter().next() {
                row_errors.entry(row_number).or_insert_with(|| {
                    EngineError::validation(format!("row {row_number} field '{field_id}': {first}"))
                        .with_record_key(row_number.to_string())
                });
            }
            if let SorFieldType::LinkedRecords { .. } = &field.field_type {
                if let Some(names) = conv.value.as_array() {
                    let set = linked_name_sets.entry(field_id.to_string()).or_default();
                    set.extend(names.iter().filter_map(|v| v.as_str().map(str::to_string)));
                }
            }
            converted.insert(field_id.to_string(), conv.value);
        }
        raw_cells.push((row_number, converted));
    }

    let mut resolved_ids: HashMap<String, HashMap<String, String>> = HashMap::new(); // field_id -> name -> id
    for (field_id, linked_table_id, primary_field_id) in &linked_field_ids {
        let names: Vec<String> = linked_name_sets.get(field_id).cloned().unwrap_or_default().into_iter().collect();
        if names.is_empty() {
            continue;
        }
        match deps
            .linked
            .resolve_names_to_ids(
                &opts.sor_token,
                &cfg.sor_base_id,
                linked_table_id,
                primary_field_id,
                &names,
                opts.create_missing_linked_records,
            )
            .await
        {
            Ok(result) => {
                warnings.extend(result.warnings);
                let mut map: HashMap<String, String> = result.resolved.into_iter().collect();
                map.extend(result.created);
                resolved_ids.insert(field_id.clone(), map);
            }
            Err(e) => warnings.push(format!("linked field '{field_id}' name resolution failed: {e}")),
        }
    }

    let mut grid_rows = Vec::new();
    for (row_number, converted) in raw_cells {
        if let Some(err) = row_errors.remove(&row_number) {
            if opts.strict_validation {
                acc.record_error(err);
            } else {
                warnings.push(format!("row {row_number} skipped: {}", err.message));
            }
            continue;
        }

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

        let row = sheet_values.get(row_number - 1).cloned().unwrap_or_default();
        grid_rows.push(GridRow { row_number, record_id: read_reserved_id(&row), fields });
    }

    let mut grid_rows = enforce_max_records(grid_rows, opts, &mut warnings);

    let mut added = 0u64;
    let mut updated = 0u64;
    let id_letter = reserved_id_letter();

    // §4.7.2 step 4: an ID-less grid row whose primary-field value matches
    // an existing SOR record's primary field (case-insensitively) updates
    // that record instead of creating a duplicate; the matched id is
    // stamped back into the reserved column just like a freshly created one.
    let existing_params = ListRecordsParams {
        view: cfg.sor_view_id.clone(),
        sort_field: None,
        max_records: None,
        filter_formula: None,
    };
    let existing_by_primary: HashMap<String, String> = match deps
        .sor
        .list_records(&opts.sor_token, &cfg.sor_base_id, &cfg.sor_table_id, &existing_params)
        .await
    {
        Ok(records) => records
            .into_iter()
            .filter_map(|r| {
                let name = r.fields.get(&schema.primary_field_id)?.as_str()?.to_ascii_lowercase();
                Some((name, r.id))
            })
            .collect(),
        Err(e) => {
            warnings.push(format!("could not list existing SOR records for name matching: {e}"));
            HashMap::new()
        }
    };

    let mut matched_by_name: Vec<(usize, String)> = Vec::new();
    for row in grid_rows.iter_mut().filter(|r| r.record_id.is_none()) {
        let Some(name) = row.fields.get(&schema.primary_field_id).and_then(Value::as_str) else { continue };
        if let Some(id) = existing_by_primary.get(&name.to_ascii_lowercase()) {
            row.record_id = Some(id.clone());
            matched_by_name.push((row.row_number, id.clone()));
        }
    }
    if !opts.dry_run {
        for (row_number, id) in &matched_by_name {
            let range = format!("{}!{id_letter}{row_number}:{id_letter}{row_number}", sheet.title);
            if let Err(e) = deps
                .grid
                .update_values(&opts.grid_token, &cfg.grid_workbook_id, &range, &[vec![Value::String(id.clone())]])
                .await
            {
                warnings.push(format!("matched existing SOR record {id} but could not stamp its id into row {row_number}: {e}"));
            }
        }
    }

    let (to_create, to_update): (Vec<GridRow>, Vec<GridRow>) =
        grid_rows.into_iter().partition(|r| r.record_id.is_none());

    for chunk in to_update.chunks(MAX_BATCH_SIZE) {
        if opts.cancellation.is_cancelled() {
            break;
        }
        if budget_exceeded(run_started_at, opts) {
            budget_hit = true;
            warnings.push("soft time budget exceeded before every update was written".to_string());
            break;
        }
        let mut skip = Vec::new();
        let mut records = Vec::new();
        for row in chunk {
            let id = row.record_id.clone().unwrap();
            let hash = content_hash(&row.fields);
            if let Some(prior) = snapshot.entries.get(&id) {
                if prior.content_hash == hash {
                    skip.push((id, hash));
                    continue;
                }
            }
            records.push((id, hash, as_record_map(&row.fields)));
        }
        for (id, hash) in skip {
            acc.record_success();
            record_entry(&mut snapshot, id, hash, None, Some(now), now);
        }
        if records.is_empty() {
            continue;
        }
        let payload: Vec<SorRecord> =
            records.iter().map(|(id, _, fields)| SorRecord { id: id.clone(), fields: fields.clone() }).collect();
        if opts.dry_run {
            for (id, hash, _) in &records {
                updated += 1;
                acc.record_success();
                record_entry(&mut snapshot, id.clone(), hash.clone(), None, Some(now), now);
            }
            continue;
        }
        match deps.sor.update_records(&opts.sor_token, &cfg.sor_base_id, &cfg.sor_table_id, &payload).await {
            Ok(_) => {
                for (id, hash, _) in &records {
                    updated += 1;
                    acc.record_success();
                    record_entry(&mut snapshot, id.clone(), hash.clone(), None, Some(now), now);
                }
            }
            Err(e) => {
                for (id, _, _) in &records {
                    acc.record_error(e.clone().with_record_key(id.clone()));
                }
            }
        }
    }

    for chunk in to_create.chunks(MAX_BATCH_SIZE) {
        if opts.cancellation.is_cancelled() {
            break;
        }
        if budget_exceeded(run_started_at, opts) {
            budget_hit = true;
            warnings.push("soft time budget exceeded before every new record was created".to_string());
            break;
        }
        let payload: Vec<SorRecord> =
            chunk.iter().map(|row| SorRecord { id: String::new(), fields: as_record_map(&row.fields) }).collect();
        if opts.dry_run {
            added += chunk.len() as u64;
            for _ in chunk {
                acc.record_success();
            }
            continue;
        }
        match deps.sor.create_records(&opts.sor_token, &cfg.sor_base_id, &cfg.sor_table_id, &payload).await {
            Ok(created) => {
                for (row, record) in chunk.iter().zip(created.iter()) {
                    added += 1;
                    acc.record_success();
                    let hash = content_hash(&row.fields);
                    record_entry(&mut snapshot, record.id.clone(), hash, None, Some(now), now);

                    let range = format!("{}!{id_letter}{}:{id_letter}{}", sheet.title, row.row_number, row.row_number);
                    if let Err(e) = deps
                        .grid
                        .update_values(&opts.grid_token, &cfg.grid_workbook_id, &range, &[vec![Value::String(record.id.clone())]])
                        .await
                    {
                        warnings.push(format!("created SOR record {} but could not stamp its id into row {}: {e}", record.id, row.row_number));
                    }
                }
            }
            Err(e) => {
                for row in chunk {
                    acc.record_error(e.clone().with_record_key(row.row_number.to_string()));
                }
            }
        }
    }

    let mut deleted = 0u64;
    if opts.delete_extra_records {
        let present: HashSet<String> =
            to_update.iter().filter_map(|r| r.record_id.clone()).collect();
        let stale: Vec<String> = snapshot
            .entries
            .keys()
            .filter(|k| !present.contains(*k) && !k.starts_with("row_"))
            .cloned()
            .collect();
        for chunk in stale.chunks(MAX_BATCH_SIZE) {
            if opts.dry_run {
                deleted += chunk.len() as u64;
                continue;
            }
            match deps.sor.delete_records(&opts.sor_token, &cfg.sor_base_id, &cfg.sor_table_id, chunk).await {
                Ok(()) => deleted += chunk.len() as u64,
                Err(e) => warnings.push(format!("deleting {} stale SOR record(s) failed: {e}", chunk.len())),
            }
        }
        for id in &stale {
            snapshot.entries.remove(id);
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
        conflicts: None,
    }
}

fn as_record_map(fields: &RowFields) -> HashMap<String, Value> {
    fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
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
    use xsync_schemas::{EngineResult, FieldSchema, SorFieldType as FT, SyncDirection, TableSchema};
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
            let mut created = Vec::new();
            let mut recs = self.records.lock().unwrap();
            for rec in r {
                let new_id = format!("r{}", recs.len() + 1);
                let created_rec = SorRecord { id: new_id, fields: rec.fields.clone() };
                recs.push(created_rec.clone());
                created.push(created_rec);
            }
            Ok(created)
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
            // Test writes target row 3 ("AA3"); parse the row number out of
            // the A1 range so the stamped-back id is observable afterward.
            if let Some(row_num) = parse_row_number(_r) {
                let mut rows = self.values.lock().unwrap();
                while rows.len() < row_num {
                    rows.push(Vec::new());
                }
                let row = &mut rows[row_num - 1];
                while row.len() <= xsync_schemas::RESERVED_ID_COLUMN as usize {
                    row.push(Value::Null);
                }
                row[xsync_schemas::RESERVED_ID_COLUMN as usize] = values[0][0].clone();
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
            field_mappings: HashMap::from([("name".to_string(), 0u32), ("tier".to_string(), 1u32)]),
            direction: SyncDirection::GridToSor,
            conflict_strategy: None,
            is_active: true,
            last_sync_at: None,
            last_sync_status: None,
            last_error_at: None,
            last_error_message: None,
        }
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

    fn deps(sor: FakeSor, grid: FakeGrid) -> PipelineDeps {
        let sor: Arc<dyn SorClient> = Arc::new(sor);
        PipelineDeps {
            linked: Arc::new(LinkedRecordResolver::new(sor.clone())),
            sor,
            grid: Arc::new(grid),
        }
    }

    /// §8 scenario 3: an existing SOR record is left alone, an unmatched
    /// grid row becomes a new SOR record, and its id is stamped back into
    /// the reserved column.
    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointed at a live Postgres instance"]
    async fn new_grid_row_creates_record_and_stamps_id_back() {
        let existing = SorRecord {
            id: "r1".into(),
            fields: HashMap::from([
                ("name".to_string(), serde_json::json!("Ada")),
                ("tier".to_string(), serde_json::json!("Pro")),
            ]),
        };
        let d = deps(
            FakeSor { schema: schema(), records: std::sync::Mutex::new(vec![existing]) },
            FakeGrid {
                values: std::sync::Mutex::new(vec![
                    vec![Value::String("Name".into()), Value::String("Tier".into())],
                    row_with_id(&["Ada", "Pro"], Some("r1")),
                    row_with_id(&["Cat", "Free"], None),
                ]),
            },
        );
        let cfg = config();
        let pool = xsync_db::testkit_db_pool().await.unwrap();
        xsync_db::insert_sync_config(&pool, &cfg).await.unwrap();

        let opts = RunOptions::standard("sor-tok".into(), "grid-tok".into());
        let report = run(&d, &pool, &cfg, &opts).await;

        assert_eq!(report.added, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(report.failed, 0);
    }

    fn row_with_id(cells: &[&str], id: Option<&str>) -> Vec<Value> {
        let mut row: Vec<Value> = cells.iter().map(|c| Value::String(c.to_string())).collect();
        while row.len() <= xsync_schemas::RESERVED_ID_COLUMN as usize {
            row.push(Value::Null);
        }
        row[xsync_schemas::RESERVED_ID_COLUMN as usize] =
            id.map(|s| Value::String(s.to_string())).unwrap_or(Value::Null);
        row
    }
}
