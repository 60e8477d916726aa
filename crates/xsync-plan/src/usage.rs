//! `UsageTracker`: upserts `(userId, month)` usage rows (§4.9).

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use xsync_schemas::{month_key, UsageStats};

pub struct UsageTracker {
    pool: PgPool,
}

impl UsageTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Accrues `records_synced`/`sync_configs_created` deltas into the
    /// calendar-month row owning `at`, per §4.9's "month is the first day of
    /// the calendar month in UTC".
    pub async fn record(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        delta_records: u64,
        delta_configs: u64,
    ) -> Result<()> {
        let month = month_key(at);
        xsync_db::accrue_usage(&self.pool, user_id, month, delta_records, delta_configs).await
    }

    pub async fn current_month(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<UsageStats>> {
        xsync_db::fetch_usage(&self.pool, user_id, month_key(now)).await
    }
}
