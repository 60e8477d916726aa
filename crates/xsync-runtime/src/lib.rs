//! Top-level composition root (§9: "these must be owned by a top-level
//! `Engine` value passed into pipelines; tests construct a fresh `Engine`
//! per case").
//!
//! `Engine` owns every singleton spec.md's source treats as a module-level
//! global — the credential cipher, both rate limiters, the linked-record
//! cache, the token manager, the plan guard, the usage tracker — and
//! exposes the operations §6 names (`RunManual`, `RunInitial`,
//! `RunScheduled`, `ResolveConnectionStatus`, `MarkReauthRequired`) as
//! methods. `xsync-daemon` and `xsync-cli` are both thin hosts around one
//! `Engine`.

mod connection_store;
mod token_refresher;

pub use connection_store::DbConnectionStore;
pub use token_refresher::HttpOAuthRefresher;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Mutex as TokioMutex;
use uuid::Uuid;

use xsync_config::ResolvedConfig;
use xsync_crypto::EncryptionService;
use xsync_grid_client::{GridClient, HttpGridClient};
use xsync_linked::LinkedRecordResolver;
use xsync_pipeline::{PipelineDeps, RunOptions};
use xsync_plan::{PlanGuard, PlanLimits, UsageTracker};
use xsync_ratelimit::RateLimiter;
use xsync_schemas::{ConnStatus, Provider, TriggeredBy};
use xsync_sor_client::{HttpSorClient, SorClient};
use xsync_token::TokenManager;

pub use xsync_pipeline::RunReport;

/// §4.8's batch execution entry point's return value: a tally, not a list
/// of RunReports, since a scheduler pass can span hundreds of configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSummary {
    pub considered: u64,
    pub executed: u64,
    pub skipped_paused: u64,
    pub skipped_in_flight: u64,
    pub dispatch_failed: u64,
    pub succeeded: u64,
    pub partial: u64,
    pub failed: u64,
}

/// §6: `ResolveConnectionStatus(userId) -> {sor, grid}`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnectionStatusPair {
    pub sor: ConnStatus,
    pub grid: ConnStatus,
}

pub struct Engine {
    pub pool: PgPool,
    pub config: ResolvedConfig,
    pub crypto: Arc<EncryptionService>,
    pub sor: Arc<dyn SorClient>,
    pub grid: Arc<dyn GridClient>,
    pub linked: Arc<LinkedRecordResolver>,
    pub tokens: Arc<TokenManager>,
    pub plan_guard: Arc<PlanGuard>,
    pub usage: Arc<UsageTracker>,
    /// §5/§9: in-process lock keyed by `SyncConfig.id`, paired with the
    /// RunLog single-flight check so the same process never overlaps two
    /// runs of one configuration even if the 5-minute window races.
    config_locks: TokioMutex<HashMap<Uuid, Arc<TokioMutex<()>>>>,
}

impl Engine {
    /// Builds every shared singleton from a resolved configuration and an
    /// already-migrated pool. Production entry point is [`Engine::from_env`];
    /// this constructor is what `xsync-testkit` uses to build a fresh
    /// `Engine` per test case with fake clients swapped in.
    pub fn new(config: ResolvedConfig, pool: PgPool) -> Result<Self> {
        let crypto = Arc::new(
            EncryptionService::new(&config.encryption_key).map_err(|e| anyhow!(e.to_string()))?,
        );
        let sor_limiter = Arc::new(RateLimiter::new(config.rate_limit_rps));
        let grid_limiter = Arc::new(RateLimiter::new(config.rate_limit_rps));
        let sor: Arc<dyn SorClient> = Arc::new(HttpSorClient::new(config.sor_api_base_url.clone(), sor_limiter));
        let grid: Arc<dyn GridClient> = Arc::new(HttpGridClient::new(config.grid_api_base_url.clone(), grid_limiter));
        let linked = Arc::new(LinkedRecordResolver::new(sor.clone()));

        let store = Arc::new(DbConnectionStore::new(pool.clone()));
        let refresher = Arc::new(HttpOAuthRefresher::new(config.clone()));
        let tokens = Arc::new(TokenManager::new(store, refresher, crypto.clone()));

        let plan_guard = Arc::new(PlanGuard::new(PlanLimits::default()));
        let usage = Arc::new(UsageTracker::new(pool.clone()));

        Ok(Self {
            pool,
            config,
            crypto,
            sor,
            grid,
            linked,
            tokens,
            plan_guard,
            usage,
            config_locks: TokioMutex::new(HashMap::new()),
        })
    }

    /// Loads `.env.local` if present, resolves the environment, connects to
    /// Postgres, and runs migrations — the bootstrap every binary shares.
    pub async fn from_env() -> Result<Self> {
        xsync_config::load_dotenv();
        let config = xsync_config::resolve_from_env().context("resolving configuration")?;
        let pool = xsync_db::connect(&config.database_url).await?;
        xsync_db::migrate(&pool).await?;
        Self::new(config, pool)
    }

    async fn config_lock(&self, sync_config_id: Uuid) -> Arc<TokioMutex<()>> {
        let mut locks = self.config_locks.lock().await;
        locks.entry(sync_config_id).or_insert_with(|| Arc::new(TokioMutex::new(()))).clone()
    }

    fn deps(&self) -> PipelineDeps {
        PipelineDeps { sor: self.sor.clone(), grid: self.grid.clone(), linked: self.linked.clone() }
    }

    /// Shared body of RunManual/RunInitial: single-flight, PlanGuard, token
    /// acquisition, pipeline dispatch, usage accrual, approaching-limit
    /// warning. `triggered_by` and `opts` are the only axes that differ
    /// between the two public entry points.
    async fn execute(
        &self,
        sync_config_id: Uuid,
        user_id: Uuid,
        triggered_by: TriggeredBy,
        build_opts: impl FnOnce(String, String) -> RunOptions,
    ) -> Result<RunReport> {
        let cfg = xsync_db::fetch_sync_config(&self.pool, sync_config_id).await?;
        if cfg.user_id != user_id {
            bail!("sync config {sync_config_id} does not belong to user {user_id}");
        }

        let lock = self.config_lock(cfg.id).await;
        let _guard = lock.lock().await;

        if let Some(prior) = xsync_db::latest_run_log(&self.pool, cfg.id).await? {
            if prior.is_in_flight(Utc::now()) {
                bail!("a run for sync config {sync_config_id} is already in flight");
            }
        }

        let user = xsync_db::fetch_user(&self.pool, user_id).await?;
        if self.plan_guard.should_pause_syncs(&user, Utc::now()) {
            bail!("sync config {sync_config_id} is paused: subscription/trial does not admit runs");
        }

        let sor_token = self.tokens.get_valid_token(user_id, Provider::Sor).await.map_err(|e| anyhow!(e.to_string()))?;
        let grid_token = self.tokens.get_valid_token(user_id, Provider::Grid).await.map_err(|e| anyhow!(e.to_string()))?;
        let mut opts = build_opts(sor_token, grid_token);
        opts.max_records = Some(self.plan_guard.max_records_per_sync(user.plan.as_deref()));

        let mut report = xsync_pipeline::run_and_log(&self.deps(), &self.pool, &cfg, &opts, triggered_by).await?;

        self.usage.record(user_id, Utc::now(), report.records_synced(), 0).await?;
        if let Some(warning) = self.plan_guard.approaching_limit_warning(user.plan.as_deref(), report.records_synced()) {
            report.warnings.push(warning);
        }

        Ok(report)
    }

    /// §6: `RunManual(syncConfigId, userId) -> RunReport`.
    pub async fn run_manual(&self, sync_config_id: Uuid, user_id: Uuid) -> Result<RunReport> {
        self.execute(sync_config_id, user_id, TriggeredBy::Manual, RunOptions::standard).await
    }

    /// §6: `RunInitial(syncConfigId, userId, {dryRun}) -> RunReport`.
    pub async fn run_initial(&self, sync_config_id: Uuid, user_id: Uuid, dry_run: bool) -> Result<RunReport> {
        self.execute(sync_config_id, user_id, TriggeredBy::Initial, |sor, grid| {
            RunOptions::initial(sor, grid, dry_run)
        })
        .await
    }

    /// §4.8/§6: `RunScheduled() -> JobSummary`. Selects active configs
    /// oldest-`lastSyncAt`-first, applies PlanGuard, checks single-flight,
    /// and runs whichever configs remain eligible.
    pub async fn run_scheduled(&self) -> Result<JobSummary> {
        let mut configs = xsync_db::fetch_active_sync_configs(&self.pool).await?;
        configs.sort_by_key(|c| c.last_sync_at.unwrap_or(chrono::DateTime::<Utc>::MIN_UTC));

        let mut summary = JobSummary::default();
        for cfg in configs {
            summary.considered += 1;

            let user = match xsync_db::fetch_user(&self.pool, cfg.user_id).await {
                Ok(u) => u,
                Err(e) => {
                    tracing::warn!(sync_config_id = %cfg.id, error = %e, "could not load owning user; skipping");
                    summary.dispatch_failed += 1;
                    continue;
                }
            };
            if self.plan_guard.should_pause_syncs(&user, Utc::now()) {
                summary.skipped_paused += 1;
                continue;
            }

            match xsync_db::latest_run_log(&self.pool, cfg.id).await {
                Ok(Some(prior)) if prior.is_in_flight(Utc::now()) => {
                    summary.skipped_in_flight += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(sync_config_id = %cfg.id, error = %e, "single-flight check failed; skipping");
                    summary.dispatch_failed += 1;
                    continue;
                }
            }

            match self.run_manual_as_scheduler(&cfg, user.id).await {
                Ok(report) => {
                    summary.executed += 1;
                    match report.status {
                        xsync_schemas::SyncStatus::Success => summary.succeeded += 1,
                        xsync_schemas::SyncStatus::Partial => summary.partial += 1,
                        xsync_schemas::SyncStatus::Failed => summary.failed += 1,
                    }
                }
                Err(e) => {
                    tracing::warn!(sync_config_id = %cfg.id, error = %e, "scheduled run dispatch failed");
                    summary.dispatch_failed += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Same body as [`Engine::execute`] with `TriggeredBy::Scheduled`, but
    /// called from [`Engine::run_scheduled`] which has already performed
    /// the PlanGuard/single-flight checks against the same snapshot it
    /// iterated, so this path re-derives tokens and dispatches directly.
    async fn run_manual_as_scheduler(&self, cfg: &xsync_schemas::SyncConfig, user_id: Uuid) -> Result<RunReport> {
        let lock = self.config_lock(cfg.id).await;
        let _guard = lock.lock().await;

        let user = xsync_db::fetch_user(&self.pool, user_id).await?;
        let sor_token = self.tokens.get_valid_token(user_id, Provider::Sor).await.map_err(|e| anyhow!(e.to_string()))?;
        let grid_token = self.tokens.get_valid_token(user_id, Provider::Grid).await.map_err(|e| anyhow!(e.to_string()))?;
        let mut opts = RunOptions::standard(sor_token, grid_token);
        opts.max_records = Some(self.plan_guard.max_records_per_sync(user.plan.as_deref()));

        let report = xsync_pipeline::run_and_log(&self.deps(), &self.pool, cfg, &opts, TriggeredBy::Scheduled).await?;
        self.usage.record(user_id, Utc::now(), report.records_synced(), 0).await?;
        Ok(report)
    }

    /// §6: `ResolveConnectionStatus(userId) -> {sor, grid}`.
    pub async fn resolve_connection_status(&self, user_id: Uuid) -> Result<ConnectionStatusPair> {
        let sor = xsync_db::fetch_connection(&self.pool, user_id, Provider::Sor).await?;
        let grid = xsync_db::fetch_connection(&self.pool, user_id, Provider::Grid).await?;
        Ok(ConnectionStatusPair {
            sor: xsync_db::connection_status(sor.as_ref()),
            grid: xsync_db::connection_status(grid.as_ref()),
        })
    }

    /// §6: `MarkReauthRequired(userId, provider, reason)`.
    pub async fn mark_reauth_required(&self, user_id: Uuid, provider: Provider, reason: &str) -> Result<()> {
        let mut conn = xsync_db::fetch_connection(&self.pool, user_id, provider)
            .await?
            .ok_or_else(|| anyhow!("no {} connection on file for user {user_id}", provider.as_str()))?;
        conn.needs_reauth = true;
        conn.last_refresh_error = Some(reason.to_string());
        conn.last_refresh_attempt = Some(Utc::now());
        xsync_db::upsert_connection(&self.pool, &conn).await?;
        Ok(())
    }
}
