//! `xsync` operator CLI.
//!
//! Thin wrapper around [`xsync_runtime::Engine`]: every subcommand loads
//! `.env.local`, builds an `Engine` against the configured Postgres
//! instance, and calls the same methods `xsync-daemon`'s HTTP handlers
//! call. Nothing here duplicates engine logic.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use xsync_runtime::Engine;

#[derive(Parser)]
#[command(name = "xsync")]
#[command(about = "SOR <-> Grid sync engine operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database maintenance commands.
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// §6 RunManual: run one sync config on demand.
    RunManual {
        /// Sync config id.
        #[arg(long)]
        sync_config_id: Uuid,
        /// Owning user id (must match the config's `user_id`).
        #[arg(long)]
        user_id: Uuid,
    },

    /// §6 RunInitial: first-run backfill for a newly created sync config.
    RunInitial {
        #[arg(long)]
        sync_config_id: Uuid,
        #[arg(long)]
        user_id: Uuid,
        /// Report what would change without writing to either side.
        #[arg(long)]
        dry_run: bool,
    },

    /// §4.8/§6 RunScheduled: run one scheduler pass across all active,
    /// eligible sync configs and print the resulting job summary.
    RunScheduledOnce,

    /// §6 ResolveConnectionStatus: print a user's SOR/Grid connection state.
    ConnectionStatus {
        #[arg(long)]
        user_id: Uuid,
    },

    /// §6 MarkReauthRequired: force a connection into `needs_reauth`.
    MarkReauth {
        #[arg(long)]
        user_id: Uuid,
        /// "sor" or "grid".
        #[arg(long)]
        provider: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Print connectivity and migration status.
    Status,
    /// Apply pending migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = xsync_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = xsync_db::status(&pool).await?;
                    println!("db_ok={} has_sync_configs_table={}", s.ok, s.has_sync_configs_table);
                }
                DbCmd::Migrate => {
                    xsync_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::RunManual { sync_config_id, user_id } => {
            let engine = Engine::from_env().await.context("building engine")?;
            let report = engine.run_manual(sync_config_id, user_id).await?;
            print_report(&report)?;
        }

        Commands::RunInitial { sync_config_id, user_id, dry_run } => {
            let engine = Engine::from_env().await.context("building engine")?;
            let report = engine.run_initial(sync_config_id, user_id, dry_run).await?;
            print_report(&report)?;
        }

        Commands::RunScheduledOnce => {
            let engine = Engine::from_env().await.context("building engine")?;
            let summary = engine.run_scheduled().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::ConnectionStatus { user_id } => {
            let engine = Engine::from_env().await.context("building engine")?;
            let pair = engine.resolve_connection_status(user_id).await?;
            println!("sor={:?} grid={:?}", pair.sor, pair.grid);
        }

        Commands::MarkReauth { user_id, provider, reason } => {
            let engine = Engine::from_env().await.context("building engine")?;
            let provider = parse_provider(&provider)?;
            engine.mark_reauth_required(user_id, provider, &reason).await?;
            println!("marked {provider:?} connection for {user_id} as needs_reauth");
        }
    }

    Ok(())
}

fn print_report(report: &xsync_runtime::RunReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn parse_provider(s: &str) -> Result<xsync_schemas::Provider> {
    match s {
        "sor" => Ok(xsync_schemas::Provider::Sor),
        "grid" => Ok(xsync_schemas::Provider::Grid),
        other => anyhow::bail!("unknown provider '{other}', expected 'sor' or 'grid'"),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
