//! RunLogger: opens, accumulates into, and atomically finalizes one
//! pipeline run's [`RunLog`] row alongside its owning SyncConfig's summary
//! fields (§4.8's "record the RunLog; update SyncConfig"; §7's per-kind
//! error aggregation and durable/synchronous caps).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use xsync_schemas::{EngineError, ErrorKind, RunLog, SyncDirection, SyncStatus, TriggeredBy};

/// §7: at most this many per-record errors are kept in the durably stored
/// RunLog row.
pub const MAX_DURABLE_ERRORS: usize = 10;
/// §7: a synchronous caller (ManualTrigger) may see up to this many.
pub const MAX_SYNCHRONOUS_ERRORS: usize = 20;

/// Accumulates per-record outcomes over the life of one pipeline run. Not
/// persisted itself — reduced into a [`RunLog`]'s fields at
/// [`RunLogger::finish`] time.
#[derive(Debug, Default)]
pub struct RunAccumulator {
    pub records_synced: u64,
    pub records_failed: u64,
    errors: Vec<EngineError>,
}

impl RunAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self) {
        self.records_synced += 1;
    }

    pub fn record_error(&mut self, error: EngineError) {
        self.records_failed += 1;
        self.errors.push(error);
    }

    /// §7: OAuth errors supersede every other kind when picking the single
    /// user-facing message.
    fn dominant_error(&self) -> Option<&EngineError> {
        self.errors.iter().find(|e| e.kind == ErrorKind::OAuth).or_else(|| self.errors.first())
    }

    /// The short `lastErrorMessage` derived from the run's dominant error
    /// kind, or `None` if nothing failed.
    pub fn last_error_message(&self) -> Option<String> {
        self.dominant_error().map(|e| format!("{}: {}", e.kind, e.message))
    }

    /// A run with no failures is `SUCCESS`; one where nothing got through at
    /// all is `FAILED`; anything in between is `PARTIAL`. Phase-fatal aborts
    /// (auth, schema, fetch) bypass this and set `FAILED` directly rather
    /// than going through the accumulator at all.
    pub fn implied_status(&self) -> SyncStatus {
        if self.errors.is_empty() {
            SyncStatus::Success
        } else if self.records_synced == 0 {
            SyncStatus::Failed
        } else {
            SyncStatus::Partial
        }
    }

    /// Errors truncated to the durable-storage cap, as the JSON value stored
    /// on the `RunLog` row.
    pub fn durable_errors_json(&self) -> serde_json::Value {
        serde_json::to_value(self.errors.iter().take(MAX_DURABLE_ERRORS).collect::<Vec<_>>())
            .expect("EngineError always serializes")
    }

    /// Errors truncated to the synchronous-response cap, for
    /// ManualTrigger-style callers that return the outcome directly.
    pub fn synchronous_errors(&self) -> &[EngineError] {
        let end = self.errors.len().min(MAX_SYNCHRONOUS_ERRORS);
        &self.errors[..end]
    }
}

/// Owns a run's RunLog lifecycle: open at the start of a pipeline invocation,
/// finalize once the pipeline has finished (successfully or not).
pub struct RunLogger {
    pool: PgPool,
}

impl RunLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a new RunLog row for a pipeline about to run.
    pub async fn start(
        &self,
        sync_config_id: Uuid,
        triggered_by: TriggeredBy,
        direction: SyncDirection,
    ) -> Result<RunLog> {
        let log = RunLog::start(sync_config_id, triggered_by, direction);
        xsync_db::insert_run_log(&self.pool, &log).await.context("RunLogger::start")?;
        Ok(log)
    }

    /// Finalizes `log` with the accumulator's tallies and `status`, then
    /// persists the RunLog and its owning SyncConfig's summary fields in one
    /// transaction (see [`xsync_db::finalize_run_log_and_record_result`]).
    /// `status` is supplied by the caller rather than derived purely from
    /// `accumulator.implied_status()` so a phase-fatal abort can force
    /// `FAILED` even when no per-record errors were accumulated.
    pub async fn finish(
        &self,
        mut log: RunLog,
        accumulator: &RunAccumulator,
        status: SyncStatus,
    ) -> Result<RunLog> {
        log.records_synced = accumulator.records_synced;
        log.records_failed = accumulator.records_failed;
        log.errors = accumulator.durable_errors_json();
        log.finalize(status);

        xsync_db::finalize_run_log_and_record_result(
            &self.pool,
            &log,
            accumulator.last_error_message().as_deref(),
        )
        .await
        .context("RunLogger::finish")?;

        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation_error(record_key: &str) -> EngineError {
        EngineError::validation("invalid option").with_record_key(record_key)
    }

    #[test]
    fn implied_status_is_success_with_no_errors() {
        let mut acc = RunAccumulator::new();
        acc.record_success();
        acc.record_success();
        assert_eq!(acc.implied_status(), SyncStatus::Success);
        assert!(acc.last_error_message().is_none());
    }

    #[test]
    fn implied_status_is_partial_when_some_records_succeed() {
        let mut acc = RunAccumulator::new();
        acc.record_success();
        acc.record_error(validation_error("r2"));
        assert_eq!(acc.implied_status(), SyncStatus::Partial);
    }

    #[test]
    fn implied_status_is_failed_when_nothing_gets_through() {
        let mut acc = RunAccumulator::new();
        acc.record_error(validation_error("r1"));
        acc.record_error(validation_error("r2"));
        assert_eq!(acc.implied_status(), SyncStatus::Failed);
    }

    #[test]
    fn oauth_errors_dominate_the_user_facing_message() {
        let mut acc = RunAccumulator::new();
        acc.record_error(validation_error("r1"));
        acc.record_error(EngineError::oauth("token revoked"));
        acc.record_error(validation_error("r3"));
        let message = acc.last_error_message().unwrap();
        assert!(message.starts_with("OAuth"), "expected OAuth to dominate, got {message}");
    }

    #[test]
    fn durable_errors_are_capped_at_ten() {
        let mut acc = RunAccumulator::new();
        for i in 0..25 {
            acc.record_error(validation_error(&format!("r{i}")));
        }
        let stored = acc.durable_errors_json();
        assert_eq!(stored.as_array().unwrap().len(), MAX_DURABLE_ERRORS);
        assert_eq!(acc.synchronous_errors().len(), MAX_SYNCHRONOUS_ERRORS);
    }
}
