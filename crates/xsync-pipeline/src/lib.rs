//! The three reconciliation pipelines (§4.7) and the glue that turns a
//! single invocation into a durably logged run (§4.8, §6).
//!
//! `run_pipeline` dispatches on `SyncConfig.direction`; `run_and_log` wraps
//! that with the RunLog lifecycle (open, run, finalize-with-SyncConfig in
//! one transaction) shared by the Scheduler and ManualTrigger.

pub mod bidirectional;
pub mod common;
pub mod grid_to_sor;
pub mod report;
pub mod sor_to_grid;

pub use common::{CancellationToken, PipelineDeps, RunOptions};
pub use report::{ConflictCounts, ErrorSummary, RunReport};

use sqlx::PgPool;

use xsync_schemas::{ErrorKind, RunLog, SyncConfig, SyncDirection, TriggeredBy};

/// Runs whichever pipeline `cfg.direction` selects.
pub async fn run_pipeline(deps: &PipelineDeps, pool: &PgPool, cfg: &SyncConfig, opts: &RunOptions) -> RunReport {
    match cfg.direction {
        SyncDirection::SorToGrid => sor_to_grid::run(deps, pool, cfg, opts).await,
        SyncDirection::GridToSor => grid_to_sor::run(deps, pool, cfg, opts).await,
        SyncDirection::Bidirectional => bidirectional::run(deps, pool, cfg, opts).await,
    }
}

/// §4.8: open a RunLog, run the matching pipeline, finalize the log and its
/// owning SyncConfig's summary fields in one transaction. Shared by the
/// Scheduler and ManualTrigger so neither can forget half of the contract.
pub async fn run_and_log(
    deps: &PipelineDeps,
    pool: &PgPool,
    cfg: &SyncConfig,
    opts: &RunOptions,
    triggered_by: TriggeredBy,
) -> anyhow::Result<RunReport> {
    let mut log = RunLog::start(cfg.id, triggered_by, cfg.direction);
    xsync_db::insert_run_log(pool, &log).await?;

    let report = run_pipeline(deps, pool, cfg, opts).await;

    log.records_synced = report.records_synced();
    log.records_failed = report.failed;
    log.errors = serde_json::to_value(
        report.errors.iter().take(xsync_runlog::MAX_DURABLE_ERRORS).collect::<Vec<_>>(),
    )?;
    log.finalize(report.status);

    // §7: OAuth errors supersede every other kind when picking the single
    // user-facing message.
    let error_message = report
        .errors
        .iter()
        .find(|e| e.kind == ErrorKind::OAuth)
        .or_else(|| report.errors.first())
        .map(|e| format!("{}: {}", e.kind, e.message));

    xsync_db::finalize_run_log_and_record_result(pool, &log, error_message.as_deref()).await?;

    Ok(report)
}
