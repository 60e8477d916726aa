//! Shared plumbing used by all three pipelines: the dependency bundle, the
//! cancellation handle (§5), and the grid-row <-> typed-field helpers that
//! keep the reserved id column (§4.7) and mapped-field layout consistent
//! between the SOR→Grid and Grid→SOR directions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use xsync_grid_client::{column_index_to_letter, GridClient, SheetMetadata};
use xsync_hashstate::RowFields;
use xsync_linked::LinkedRecordResolver;
use xsync_schemas::{
    EngineError, EngineResult, ErrorKind, SorFieldType, SorRecord, SyncConfig, TableSchema,
    RESERVED_ID_COLUMN,
};
use xsync_sor_client::SorClient;

/// Grid row writes use batches of up to 100 (§4.7).
pub const GRID_WRITE_BATCH: usize = 100;
/// SOR writes use the client's hard ceiling of 10 (§4.1).
pub const SOR_WRITE_BATCH: usize = xsync_sor_client::MAX_BATCH_SIZE;

/// §5: a cooperative cancellation handle threaded through every pipeline.
/// The in-flight batch always finishes; pipelines only consult
/// `is_cancelled()` at batch boundaries.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The externally-facing collaborators a pipeline run needs, composed once
/// by `xsync-runtime::Engine` and shared across concurrent runs targeting
/// different `SyncConfig`s (§5).
pub struct PipelineDeps {
    pub sor: Arc<dyn SorClient>,
    pub grid: Arc<dyn GridClient>,
    pub linked: Arc<LinkedRecordResolver>,
}

/// Per-invocation knobs distinct from the `SyncConfig` itself (§4.8/§9).
#[derive(Clone)]
pub struct RunOptions {
    pub sor_token: String,
    pub grid_token: String,
    /// §4.7.2: `strict` aborts the whole row on a per-field validation
    /// error; `lenient` skips the row and records a warning.
    pub strict_validation: bool,
    /// §4.4/§9: `RunInitial` enables speculative creation of missing
    /// linked records; the scheduled/manual default never does.
    pub create_missing_linked_records: bool,
    /// §9's open question: unidirectional pipelines never delete the other
    /// side's extra records unless the caller opts in (the `initial`
    /// variant flips this default).
    pub delete_extra_records: bool,
    /// `RunInitial`'s dry-run mode: every phase still runs, but no
    /// SOR/Grid write calls are issued.
    pub dry_run: bool,
    pub cancellation: CancellationToken,
    /// §5: soft budget after which an in-progress run finalizes as
    /// `PARTIAL` instead of continuing.
    pub soft_budget: Duration,
    /// §4.9: hard cap on records written this run, derived from
    /// `PlanGuard::max_records_per_sync` for the owning user's plan. `None`
    /// when no plan guard applies (direct pipeline tests, the testkit).
    pub max_records: Option<u64>,
}

impl RunOptions {
    pub fn standard(sor_token: String, grid_token: String) -> Self {
        Self {
            sor_token,
            grid_token,
            strict_validation: false,
            create_missing_linked_records: false,
            delete_extra_records: false,
            dry_run: false,
            cancellation: CancellationToken::new(),
            soft_budget: Duration::from_secs(15 * 60),
            max_records: None,
        }
    }

    pub fn initial(sor_token: String, grid_token: String, dry_run: bool) -> Self {
        Self {
            strict_validation: true,
            create_missing_linked_records: true,
            delete_extra_records: true,
            dry_run,
            ..Self::standard(sor_token, grid_token)
        }
    }
}

/// A transformed grid row: the mapped-field cells in column order plus,
/// once known, the SOR record id destined for the reserved column.
#[derive(Debug, Clone, Default)]
pub struct TransformedRow {
    pub cells_by_column: BTreeMap<u32, Value>,
    pub record_id: Option<String>,
    pub errors: Vec<EngineError>,
    pub warnings: Vec<String>,
}

impl TransformedRow {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn reserved_id_letter() -> String {
    column_index_to_letter(RESERVED_ID_COLUMN)
}

/// §5: true once `run_started_at` is far enough in the past that the run's
/// soft budget has elapsed. Checked at the same batch boundaries as
/// `CancellationToken::is_cancelled()`; a run that trips this finalizes as
/// `SyncStatus::Partial` rather than continuing.
pub fn budget_exceeded(run_started_at: Instant, opts: &RunOptions) -> bool {
    run_started_at.elapsed() >= opts.soft_budget
}

/// §4.9: truncates `items` to `opts.max_records` when the plan's cap is set
/// and the run would otherwise exceed it, pushing a warning naming how many
/// were left for a later run. A no-op when `max_records` is `None`.
pub fn enforce_max_records<T>(items: Vec<T>, opts: &RunOptions, warnings: &mut Vec<String>) -> Vec<T> {
    match opts.max_records {
        Some(max) if (items.len() as u64) > max => {
            let dropped = items.len() as u64 - max;
            warnings.push(format!(
                "run hit its plan cap of {max} record(s); {dropped} record(s) were left for a later run"
            ));
            items.into_iter().take(max as usize).collect()
        }
        _ => items,
    }
}

/// Cell at `col` (0-based) within a sparse sheet row, treating a missing
/// trailing cell as an empty string — the normal shape of a short row
/// returned by a spreadsheet API.
pub fn cell_at(row: &[Value], col: u32) -> Value {
    row.get(col as usize).cloned().unwrap_or(Value::Null)
}

pub fn cell_as_str(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The reserved id column's value for a grid row, or `None` when blank.
pub fn read_reserved_id(row: &[Value]) -> Option<String> {
    let raw = cell_as_str(&cell_at(row, RESERVED_ID_COLUMN));
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// §4.7: the header row, field names in `fieldMappings`' column order.
pub fn header_row(schema: &TableSchema, cfg: &SyncConfig) -> Vec<Value> {
    cfg.mappings_in_column_order()
        .into_iter()
        .map(|(field_id, _)| {
            let name = schema.field(field_id).map(|f| f.name.clone()).unwrap_or_else(|| field_id.to_string());
            Value::String(name)
        })
        .collect()
}

/// Resolves, once per run, the primary-field id of every linked table a
/// mapped `linkedRecords` field points at. Needed because
/// `LinkedRecordResolver` requires the *linked* table's primary field id,
/// which the host table's own schema doesn't carry.
pub async fn preload_linked_primary_fields(
    sor: &Arc<dyn SorClient>,
    token: &str,
    base_id: &str,
    schema: &TableSchema,
    cfg: &SyncConfig,
) -> EngineResult<HashMap<String, String>> {
    let mut linked_table_ids = Vec::new();
    for (field_id, _) in cfg.mappings_in_column_order() {
        if let Some(field) = schema.field(field_id) {
            if let SorFieldType::LinkedRecords { linked_table_id } = &field.field_type {
                if !linked_table_ids.contains(linked_table_id) {
                    linked_table_ids.push(linked_table_id.clone());
                }
            }
        }
    }
    if linked_table_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let tables = sor.list_tables(token, base_id).await?;
    let mut out = HashMap::new();
    for table_id in linked_table_ids {
        let table = tables.iter().find(|t| &t.id == &table_id).ok_or_else(|| {
            EngineError::new(ErrorKind::Fetch, format!("linked table '{table_id}' not found in base schema"))
        })?;
        out.insert(table_id, table.primary_field_id.clone());
    }
    Ok(out)
}

/// Builds the canonical, hash-ready field map for a SOR record: mapped
/// fields only, linked-record values reduced to their sorted id set, the
/// reserved id column never included (§4.5).
pub fn row_fields_from_sor_record(record: &SorRecord, schema: &TableSchema, cfg: &SyncConfig) -> RowFields {
    let mut out = RowFields::new();
    for (field_id, _) in cfg.mappings_in_column_order() {
        let value = record.fields.get(field_id).cloned().unwrap_or(Value::Null);
        let normalized = match schema.field(field_id).map(|f| &f.field_type) {
            Some(SorFieldType::LinkedRecords { .. }) => {
                let ids: Vec<String> = value
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                xsync_hashstate::normalize_linked_ids(&ids)
            }
            _ => value,
        };
        out.insert(field_id.to_string(), normalized);
    }
    out
}

/// Splits records into create/chunked batches of at most `SOR_WRITE_BATCH`.
pub fn chunk_sor_batches(records: Vec<SorRecord>) -> Vec<Vec<SorRecord>> {
    records.chunks(SOR_WRITE_BATCH).map(|c| c.to_vec()).collect()
}

pub fn chunk_grid_rows<T: Clone>(rows: Vec<T>) -> Vec<Vec<T>> {
    rows.chunks(GRID_WRITE_BATCH).map(|c| c.to_vec()).collect()
}

/// `SyncConfig.grid_sheet_id` stores the numeric sheet id as a string; value
/// reads/writes need the sheet's title, structural edits (column count,
/// hiding, dropdown validation) need the numeric id back. Resolved once per
/// run from the workbook's metadata rather than carried separately on
/// `SyncConfig`.
pub async fn resolve_sheet(
    grid: &Arc<dyn GridClient>,
    token: &str,
    workbook_id: &str,
    grid_sheet_id: &str,
) -> EngineResult<SheetMetadata> {
    let target: i64 = grid_sheet_id
        .parse()
        .map_err(|_| EngineError::config(format!("grid_sheet_id '{grid_sheet_id}' is not numeric")))?;
    let metadata = grid.get_metadata(token, workbook_id).await?;
    metadata
        .sheets
        .into_iter()
        .find(|s| s.sheet_id == target)
        .ok_or_else(|| EngineError::new(ErrorKind::Fetch, format!("sheet id {target} not found in workbook {workbook_id}")))
}

/// Fills in blank cells out to `width` columns so every grid write carries a
/// uniform row shape (§4.7: "rows are written with one cell per mapped
/// column, in column order").
pub fn materialize_row(cells: &BTreeMap<u32, Value>, width: u32) -> Vec<Value> {
    (0..width).map(|col| cells.get(&col).cloned().unwrap_or(Value::String(String::new()))).collect()
}

/// One past the highest mapped column index, i.e. the row width a write
/// must cover to reach every mapped field (§4.7).
pub fn mapped_width(cfg: &SyncConfig) -> u32 {
    cfg.field_mappings.values().copied().max().map(|c| c + 1).unwrap_or(0)
}
