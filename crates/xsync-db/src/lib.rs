//! Postgres persistence for the synchronization engine's domain types.
//!
//! Every function here takes a `&PgPool` and returns `anyhow::Result`;
//! callers that need the typed domain error instead (pipeline/daemon code)
//! wrap these calls with `.map_err(EngineError::database)`.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use xsync_schemas::{
    ConflictStrategy, ConnStatus, Connection, HashEntry, HashSnapshot, Provider, RunLog, SubscriptionStatus,
    SyncConfig, SyncDirection, SyncStatus, TriggeredBy, User,
};

pub const ENV_DB_URL: &str = "DATABASE_URL";

/// Connects to Postgres using the `DATABASE_URL` environment variable.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Test helper: connect using `DATABASE_URL` and ensure migrations are applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Runs the embedded SQLx migrations. Safe to call repeatedly.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_sync_configs_table: bool,
}

/// Simple status query (connectivity + schema presence), used by the
/// daemon's `/health` and `/status` endpoints.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'sync_configs'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_sync_configs_table: exists,
    })
}

// ---------------------------------------------------------------------------
// enum <-> text helpers (mirrors the on-disk check-constrained text columns)
// ---------------------------------------------------------------------------

fn provider_as_str(p: Provider) -> &'static str {
    p.as_str()
}

fn parse_provider(s: &str) -> Result<Provider> {
    match s {
        "sor" => Ok(Provider::Sor),
        "grid" => Ok(Provider::Grid),
        other => Err(anyhow!("invalid provider: {other}")),
    }
}

fn direction_as_str(d: SyncDirection) -> &'static str {
    match d {
        SyncDirection::SorToGrid => "SOR_TO_GRID",
        SyncDirection::GridToSor => "GRID_TO_SOR",
        SyncDirection::Bidirectional => "BIDIRECTIONAL",
    }
}

fn parse_direction(s: &str) -> Result<SyncDirection> {
    match s {
        "SOR_TO_GRID" => Ok(SyncDirection::SorToGrid),
        "GRID_TO_SOR" => Ok(SyncDirection::GridToSor),
        "BIDIRECTIONAL" => Ok(SyncDirection::Bidirectional),
        other => Err(anyhow!("invalid sync direction: {other}")),
    }
}

fn conflict_strategy_as_str(c: ConflictStrategy) -> &'static str {
    match c {
        ConflictStrategy::SorWins => "SOR_WINS",
        ConflictStrategy::GridWins => "GRID_WINS",
        ConflictStrategy::NewestWins => "NEWEST_WINS",
    }
}

fn parse_conflict_strategy(s: &str) -> Result<ConflictStrategy> {
    match s {
        "SOR_WINS" => Ok(ConflictStrategy::SorWins),
        "GRID_WINS" => Ok(ConflictStrategy::GridWins),
        "NEWEST_WINS" => Ok(ConflictStrategy::NewestWins),
        other => Err(anyhow!("invalid conflict strategy: {other}")),
    }
}

fn sync_status_as_str(s: SyncStatus) -> &'static str {
    match s {
        SyncStatus::Success => "SUCCESS",
        SyncStatus::Partial => "PARTIAL",
        SyncStatus::Failed => "FAILED",
    }
}

fn parse_sync_status(s: &str) -> Result<SyncStatus> {
    match s {
        "SUCCESS" => Ok(SyncStatus::Success),
        "PARTIAL" => Ok(SyncStatus::Partial),
        "FAILED" => Ok(SyncStatus::Failed),
        other => Err(anyhow!("invalid sync status: {other}")),
    }
}

fn triggered_by_as_str(t: TriggeredBy) -> &'static str {
    match t {
        TriggeredBy::Scheduled => "scheduled",
        TriggeredBy::Manual => "manual",
        TriggeredBy::Initial => "initial",
    }
}

fn parse_triggered_by(s: &str) -> Result<TriggeredBy> {
    match s {
        "scheduled" => Ok(TriggeredBy::Scheduled),
        "manual" => Ok(TriggeredBy::Manual),
        "initial" => Ok(TriggeredBy::Initial),
        other => Err(anyhow!("invalid triggered_by: {other}")),
    }
}

fn subscription_status_as_str(s: SubscriptionStatus) -> &'static str {
    match s {
        SubscriptionStatus::Active => "active",
        SubscriptionStatus::PastDue => "past_due",
        SubscriptionStatus::CancelAtPeriodEnd => "cancel_at_period_end",
        SubscriptionStatus::Deleted => "deleted",
    }
}

fn parse_subscription_status(s: &str) -> Result<SubscriptionStatus> {
    match s {
        "active" => Ok(SubscriptionStatus::Active),
        "past_due" => Ok(SubscriptionStatus::PastDue),
        "cancel_at_period_end" => Ok(SubscriptionStatus::CancelAtPeriodEnd),
        "deleted" => Ok(SubscriptionStatus::Deleted),
        other => Err(anyhow!("invalid subscription status: {other}")),
    }
}

// ---------------------------------------------------------------------------
// users
// ---------------------------------------------------------------------------

pub async fn insert_user(pool: &PgPool, user: &User) -> Result<()> {
    sqlx::query(
        r#"
        insert into users (id, email, plan, subscription_status, trial_started_at, trial_ends_at)
        values ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(user.id)
    .bind(&user.email)
    .bind(&user.plan)
    .bind(user.subscription_status.map(subscription_status_as_str))
    .bind(user.trial_started_at)
    .bind(user.trial_ends_at)
    .execute(pool)
    .await
    .context("insert_user failed")?;
    Ok(())
}

pub async fn fetch_user(pool: &PgPool, user_id: Uuid) -> Result<User> {
    let row = sqlx::query("select * from users where id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .context("fetch_user failed")?;
    row_to_user(&row)
}

pub async fn fetch_user_by_email(pool: &PgPool, email: &str) -> Result<Option<User>> {
    let row = sqlx::query("select * from users where lower(email) = lower($1)")
        .bind(email)
        .fetch_optional(pool)
        .await
        .context("fetch_user_by_email failed")?;
    row.as_ref().map(row_to_user).transpose()
}

fn row_to_user(row: &sqlx::postgres::PgRow) -> Result<User> {
    let status: Option<String> = row.try_get("subscription_status")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        plan: row.try_get("plan")?,
        subscription_status: status.map(|s| parse_subscription_status(&s)).transpose()?,
        trial_started_at: row.try_get("trial_started_at")?,
        trial_ends_at: row.try_get("trial_ends_at")?,
    })
}

// ---------------------------------------------------------------------------
// connections
// ---------------------------------------------------------------------------

pub async fn upsert_connection(pool: &PgPool, conn: &Connection) -> Result<()> {
    sqlx::query(
        r#"
        insert into connections (
          id, user_id, provider, encrypted_access_token, encrypted_refresh_token,
          token_expiry, needs_reauth, last_refresh_error, last_refresh_attempt
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        on conflict (user_id, provider) do update set
          encrypted_access_token = excluded.encrypted_access_token,
          encrypted_refresh_token = excluded.encrypted_refresh_token,
          token_expiry = excluded.token_expiry,
          needs_reauth = excluded.needs_reauth,
          last_refresh_error = excluded.last_refresh_error,
          last_refresh_attempt = excluded.last_refresh_attempt
        "#,
    )
    .bind(conn.id)
    .bind(conn.user_id)
    .bind(provider_as_str(conn.provider))
    .bind(&conn.encrypted_access_token)
    .bind(&conn.encrypted_refresh_token)
    .bind(conn.token_expiry)
    .bind(conn.needs_reauth)
    .bind(&conn.last_refresh_error)
    .bind(conn.last_refresh_attempt)
    .execute(pool)
    .await
    .context("upsert_connection failed")?;
    Ok(())
}

pub async fn fetch_connection(pool: &PgPool, user_id: Uuid, provider: Provider) -> Result<Option<Connection>> {
    let row = sqlx::query("select * from connections where user_id = $1 and provider = $2")
        .bind(user_id)
        .bind(provider_as_str(provider))
        .fetch_optional(pool)
        .await
        .context("fetch_connection failed")?;
    row.as_ref().map(row_to_connection).transpose()
}

fn row_to_connection(row: &sqlx::postgres::PgRow) -> Result<Connection> {
    let provider: String = row.try_get("provider")?;
    Ok(Connection {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider: parse_provider(&provider)?,
        encrypted_access_token: row.try_get("encrypted_access_token")?,
        encrypted_refresh_token: row.try_get("encrypted_refresh_token")?,
        token_expiry: row.try_get("token_expiry")?,
        needs_reauth: row.try_get("needs_reauth")?,
        last_refresh_error: row.try_get("last_refresh_error")?,
        last_refresh_attempt: row.try_get("last_refresh_attempt")?,
    })
}

/// §4.2: a connection's status for display purposes — distinct from the
/// `needs_reauth` flag alone, since an absent connection is `NotConnected`.
pub fn connection_status(conn: Option<&Connection>) -> ConnStatus {
    match conn {
        None => ConnStatus::NotConnected,
        Some(c) if c.needs_reauth => ConnStatus::NeedsReauth,
        Some(_) => ConnStatus::Connected,
    }
}

// ---------------------------------------------------------------------------
// sync_configs
// ---------------------------------------------------------------------------

pub async fn insert_sync_config(pool: &PgPool, cfg: &SyncConfig) -> Result<()> {
    cfg.validate().map_err(|e| anyhow!(e.to_string()))?;
    let mappings = serde_json::to_value(&cfg.field_mappings).context("serialize field_mappings")?;
    sqlx::query(
        r#"
        insert into sync_configs (
          id, user_id, name, sor_base_id, sor_table_id, sor_view_id,
          grid_workbook_id, grid_sheet_id, field_mappings, direction, conflict_strategy,
          is_active, last_sync_at, last_sync_status, last_error_at, last_error_message
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(cfg.id)
    .bind(cfg.user_id)
    .bind(&cfg.name)
    .bind(&cfg.sor_base_id)
    .bind(&cfg.sor_table_id)
    .bind(&cfg.sor_view_id)
    .bind(&cfg.grid_workbook_id)
    .bind(&cfg.grid_sheet_id)
    .bind(mappings)
    .bind(direction_as_str(cfg.direction))
    .bind(cfg.conflict_strategy.map(conflict_strategy_as_str))
    .bind(cfg.is_active)
    .bind(cfg.last_sync_at)
    .bind(cfg.last_sync_status.map(sync_status_as_str))
    .bind(cfg.last_error_at)
    .bind(&cfg.last_error_message)
    .execute(pool)
    .await
    .context("insert_sync_config failed")?;
    Ok(())
}

pub async fn fetch_sync_config(pool: &PgPool, id: Uuid) -> Result<SyncConfig> {
    let row = sqlx::query("select * from sync_configs where id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("fetch_sync_config failed")?;
    row_to_sync_config(&row)
}

/// Every `sync_configs` row with `is_active = true` — the scheduler's poll set.
pub async fn fetch_active_sync_configs(pool: &PgPool) -> Result<Vec<SyncConfig>> {
    let rows = sqlx::query("select * from sync_configs where is_active")
        .fetch_all(pool)
        .await
        .context("fetch_active_sync_configs failed")?;
    rows.iter().map(row_to_sync_config).collect()
}

pub async fn record_sync_result(
    pool: &PgPool,
    id: Uuid,
    at: DateTime<Utc>,
    status: SyncStatus,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update sync_configs set
          last_sync_at = $2,
          last_sync_status = $3,
          last_error_at = case when $4::text is null then last_error_at else $2 end,
          last_error_message = coalesce($4, last_error_message)
        where id = $1
        "#,
    )
    .bind(id)
    .bind(at)
    .bind(sync_status_as_str(status))
    .bind(error_message)
    .execute(pool)
    .await
    .context("record_sync_result failed")?;
    Ok(())
}

fn row_to_sync_config(row: &sqlx::postgres::PgRow) -> Result<SyncConfig> {
    let mappings_json: serde_json::Value = row.try_get("field_mappings")?;
    let direction: String = row.try_get("direction")?;
    let conflict_strategy: Option<String> = row.try_get("conflict_strategy")?;
    let last_sync_status: Option<String> = row.try_get("last_sync_status")?;

    Ok(SyncConfig {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        sor_base_id: row.try_get("sor_base_id")?,
        sor_table_id: row.try_get("sor_table_id")?,
        sor_view_id: row.try_get("sor_view_id")?,
        grid_workbook_id: row.try_get("grid_workbook_id")?,
        grid_sheet_id: row.try_get("grid_sheet_id")?,
        field_mappings: serde_json::from_value(mappings_json).context("deserialize field_mappings")?,
        direction: parse_direction(&direction)?,
        conflict_strategy: conflict_strategy.map(|s| parse_conflict_strategy(&s)).transpose()?,
        is_active: row.try_get("is_active")?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_sync_status: last_sync_status.map(|s| parse_sync_status(&s)).transpose()?,
        last_error_at: row.try_get("last_error_at")?,
        last_error_message: row.try_get("last_error_message")?,
    })
}

// ---------------------------------------------------------------------------
// run_logs
// ---------------------------------------------------------------------------

pub async fn insert_run_log(pool: &PgPool, log: &RunLog) -> Result<()> {
    sqlx::query(
        r#"
        insert into run_logs (
          id, sync_config_id, status, started_at, completed_at,
          records_synced, records_failed, errors, triggered_by, direction
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(log.id)
    .bind(log.sync_config_id)
    .bind(sync_status_as_str(log.status))
    .bind(log.started_at)
    .bind(log.completed_at)
    .bind(log.records_synced as i64)
    .bind(log.records_failed as i64)
    .bind(&log.errors)
    .bind(triggered_by_as_str(log.triggered_by))
    .bind(direction_as_str(log.direction))
    .execute(pool)
    .await
    .context("insert_run_log failed")?;
    Ok(())
}

pub async fn finalize_run_log(pool: &PgPool, log: &RunLog) -> Result<()> {
    sqlx::query(
        r#"
        update run_logs set
          status = $2, completed_at = $3, records_synced = $4, records_failed = $5, errors = $6
        where id = $1
        "#,
    )
    .bind(log.id)
    .bind(sync_status_as_str(log.status))
    .bind(log.completed_at)
    .bind(log.records_synced as i64)
    .bind(log.records_failed as i64)
    .bind(&log.errors)
    .execute(pool)
    .await
    .context("finalize_run_log failed")?;
    Ok(())
}

/// Finalizes a run log and updates its owning sync config's summary fields
/// in a single transaction, so a reader can never observe a finalized
/// `RunLog` next to a `SyncConfig.lastSyncAt` that hasn't caught up yet —
/// the scheduler's single-flight check (§9) depends on the two staying in
/// lockstep.
pub async fn finalize_run_log_and_record_result(
    pool: &PgPool,
    log: &RunLog,
    error_message: Option<&str>,
) -> Result<()> {
    let completed_at = log
        .completed_at
        .context("finalize_run_log_and_record_result: run log has not been finalized")?;
    let mut tx = pool.begin().await.context("finalize_run_log_and_record_result: begin")?;

    sqlx::query(
        r#"
        update run_logs set
          status = $2, completed_at = $3, records_synced = $4, records_failed = $5, errors = $6
        where id = $1
        "#,
    )
    .bind(log.id)
    .bind(sync_status_as_str(log.status))
    .bind(completed_at)
    .bind(log.records_synced as i64)
    .bind(log.records_failed as i64)
    .bind(&log.errors)
    .execute(&mut *tx)
    .await
    .context("finalize_run_log_and_record_result: update run_logs")?;

    sqlx::query(
        r#"
        update sync_configs set
          last_sync_at = $2,
          last_sync_status = $3,
          last_error_at = case when $4::text is null then last_error_at else $2 end,
          last_error_message = coalesce($4, last_error_message)
        where id = $1
        "#,
    )
    .bind(log.sync_config_id)
    .bind(completed_at)
    .bind(sync_status_as_str(log.status))
    .bind(error_message)
    .execute(&mut *tx)
    .await
    .context("finalize_run_log_and_record_result: update sync_configs")?;

    tx.commit().await.context("finalize_run_log_and_record_result: commit")?;
    Ok(())
}

/// §3: the most recent run log for a `SyncConfig`, the single-flight check
/// the scheduler performs before dispatching a new run.
pub async fn latest_run_log(pool: &PgPool, sync_config_id: Uuid) -> Result<Option<RunLog>> {
    let row = sqlx::query(
        "select * from run_logs where sync_config_id = $1 order by started_at desc limit 1",
    )
    .bind(sync_config_id)
    .fetch_optional(pool)
    .await
    .context("latest_run_log failed")?;
    row.as_ref().map(row_to_run_log).transpose()
}

pub async fn fetch_run_logs(pool: &PgPool, sync_config_id: Uuid, limit: i64) -> Result<Vec<RunLog>> {
    let rows = sqlx::query(
        "select * from run_logs where sync_config_id = $1 order by started_at desc limit $2",
    )
    .bind(sync_config_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("fetch_run_logs failed")?;
    rows.iter().map(row_to_run_log).collect()
}

fn row_to_run_log(row: &sqlx::postgres::PgRow) -> Result<RunLog> {
    let status: String = row.try_get("status")?;
    let triggered_by: String = row.try_get("triggered_by")?;
    let direction: String = row.try_get("direction")?;
    let records_synced: i64 = row.try_get("records_synced")?;
    let records_failed: i64 = row.try_get("records_failed")?;

    Ok(RunLog {
        id: row.try_get("id")?,
        sync_config_id: row.try_get("sync_config_id")?,
        status: parse_sync_status(&status)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        records_synced: records_synced as u64,
        records_failed: records_failed as u64,
        errors: row.try_get("errors")?,
        triggered_by: parse_triggered_by(&triggered_by)?,
        direction: parse_direction(&direction)?,
    })
}

// ---------------------------------------------------------------------------
// usage_stats
// ---------------------------------------------------------------------------

/// Adds `delta_records`/`delta_configs` to the `(user_id, month)` row,
/// creating it at zero if absent.
pub async fn accrue_usage(
    pool: &PgPool,
    user_id: Uuid,
    month: DateTime<Utc>,
    delta_records: u64,
    delta_configs: u64,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into usage_stats (user_id, month, records_synced, sync_configs_created)
        values ($1, $2, $3, $4)
        on conflict (user_id, month) do update set
          records_synced = usage_stats.records_synced + excluded.records_synced,
          sync_configs_created = usage_stats.sync_configs_created + excluded.sync_configs_created
        "#,
    )
    .bind(user_id)
    .bind(month)
    .bind(delta_records as i64)
    .bind(delta_configs as i64)
    .execute(pool)
    .await
    .context("accrue_usage failed")?;
    Ok(())
}

pub async fn fetch_usage(pool: &PgPool, user_id: Uuid, month: DateTime<Utc>) -> Result<Option<xsync_schemas::UsageStats>> {
    let row = sqlx::query("select * from usage_stats where user_id = $1 and month = $2")
        .bind(user_id)
        .bind(month)
        .fetch_optional(pool)
        .await
        .context("fetch_usage failed")?;
    row.map(|r| {
        let records_synced: i64 = r.try_get("records_synced")?;
        let sync_configs_created: i64 = r.try_get("sync_configs_created")?;
        Ok(xsync_schemas::UsageStats {
            user_id: r.try_get("user_id")?,
            month: r.try_get("month")?,
            records_synced: records_synced as u64,
            sync_configs_created: sync_configs_created as u64,
        })
    })
    .transpose()
}

// ---------------------------------------------------------------------------
// hash_snapshots
// ---------------------------------------------------------------------------

pub async fn load_hash_snapshot(pool: &PgPool, sync_config_id: Uuid) -> Result<HashSnapshot> {
    let row = sqlx::query("select * from hash_snapshots where sync_config_id = $1")
        .bind(sync_config_id)
        .fetch_optional(pool)
        .await
        .context("load_hash_snapshot failed")?;

    match row {
        None => Ok(HashSnapshot::empty()),
        Some(r) => {
            let entries_json: serde_json::Value = r.try_get("entries")?;
            let entries: std::collections::HashMap<String, HashEntry> =
                serde_json::from_value(entries_json).context("deserialize hash snapshot entries")?;
            Ok(HashSnapshot {
                entries,
                last_sync_time: r.try_get("last_sync_time")?,
            })
        }
    }
}

pub async fn save_hash_snapshot(pool: &PgPool, sync_config_id: Uuid, snapshot: &HashSnapshot) -> Result<()> {
    let entries = serde_json::to_value(&snapshot.entries).context("serialize hash snapshot entries")?;
    sqlx::query(
        r#"
        insert into hash_snapshots (sync_config_id, entries, last_sync_time)
        values ($1, $2, $3)
        on conflict (sync_config_id) do update set
          entries = excluded.entries,
          last_sync_time = excluded.last_sync_time
        "#,
    )
    .bind(sync_config_id)
    .bind(entries)
    .bind(snapshot.last_sync_time)
    .execute(pool)
    .await
    .context("save_hash_snapshot failed")?;
    Ok(())
}
