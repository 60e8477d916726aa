//! Runtime configuration & secret resolution.
//!
//! # Contract
//! - Every secret and connection string is read from the process
//!   environment exactly once, at startup, via [`resolve_from_env`].
//! - The returned [`ResolvedConfig`] is passed into constructors; callers
//!   never scatter `std::env::var` calls across the codebase.
//! - `Debug` on [`ResolvedConfig`] redacts every secret field.
//! - Error messages reference the env var NAME, never the value.

use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_RPS: u32 = 5;
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;

/// Defaults for the two external API hosts (§4.1/§6); not named in §6's
/// required env var list because the core's contract is against whatever
/// host the operator points it at — `SOR_API_BASE_URL`/`GRID_API_BASE_URL`
/// override these, same override-with-sane-default pattern as the
/// scheduler tuning knobs below.
const DEFAULT_SOR_API_BASE_URL: &str = "https://api.sor.example.com/v0";
const DEFAULT_GRID_API_BASE_URL: &str = "https://grid.example.com/v4";
const DEFAULT_SOR_OAUTH_TOKEN_URL: &str = "https://api.sor.example.com/oauth2/token";
const DEFAULT_GRID_OAUTH_TOKEN_URL: &str = "https://grid.example.com/oauth2/token";

/// All runtime-resolved secrets and tuning knobs for one engine instantiation.
///
/// Built **once** at startup via [`resolve_from_env`]. Do **not** scatter
/// `std::env::var` calls elsewhere. **Secret fields are redacted in `Debug`
/// output.**
#[derive(Clone)]
pub struct ResolvedConfig {
    pub encryption_key: String,

    pub sor_client_id: String,
    pub sor_client_secret: String,
    pub sor_redirect_uri: String,

    pub grid_client_id: String,
    pub grid_client_secret: String,
    pub grid_redirect_uri: String,

    pub database_url: String,

    pub sor_api_base_url: String,
    pub grid_api_base_url: String,
    pub sor_oauth_token_url: String,
    pub grid_oauth_token_url: String,

    /// How often the scheduler checks each active `SyncConfig` for a due run.
    pub poll_interval: Duration,
    /// Token-bucket ceiling per provider (§4.1/§5): requests per second.
    pub rate_limit_rps: u32,
    /// A run still in-flight past this age is no longer treated as a
    /// single-flight lock (`RunLog::is_in_flight`).
    pub run_timeout: Duration,
}

impl std::fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("encryption_key", &"<REDACTED>")
            .field("sor_client_id", &"<REDACTED>")
            .field("sor_client_secret", &"<REDACTED>")
            .field("sor_redirect_uri", &self.sor_redirect_uri)
            .field("grid_client_id", &"<REDACTED>")
            .field("grid_client_secret", &"<REDACTED>")
            .field("grid_redirect_uri", &self.grid_redirect_uri)
            .field("database_url", &"<REDACTED>")
            .field("sor_api_base_url", &self.sor_api_base_url)
            .field("grid_api_base_url", &self.grid_api_base_url)
            .field("sor_oauth_token_url", &self.sor_oauth_token_url)
            .field("grid_oauth_token_url", &self.grid_oauth_token_url)
            .field("poll_interval", &self.poll_interval)
            .field("rate_limit_rps", &self.rate_limit_rps)
            .field("run_timeout", &self.run_timeout)
            .finish()
    }
}

/// Resolve a required environment variable.
/// Returns `Err` naming the variable if it is unset or blank; the value
/// itself never appears in the error.
fn require_env(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => bail!("CONFIG_MISSING: required env var '{var_name}' is not set or empty"),
    }
}

/// Resolve an optional environment variable, parsing it with `parse` and
/// falling back to `default` when unset, blank, or unparseable.
fn optional_env<T: std::str::FromStr>(var_name: &str, default: T) -> T {
    std::env::var(var_name)
        .ok()
        .and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse().ok()
            }
        })
        .unwrap_or(default)
}

/// Loads `.env.local` into the process environment if present. Best-effort:
/// a missing file is not an error, since production deployments set these
/// variables directly.
pub fn load_dotenv() {
    let _ = dotenvy::from_filename(".env.local");
}

/// Resolves the complete [`ResolvedConfig`] from the process environment.
///
/// # Errors
/// Returns `Err` naming the first missing required variable. The required
/// set is: `ENCRYPTION_KEY`, `SOR_CLIENT_ID`, `SOR_CLIENT_SECRET`,
/// `SOR_REDIRECT_URI`, `GRID_CLIENT_ID`, `GRID_CLIENT_SECRET`,
/// `GRID_REDIRECT_URI`, `DATABASE_URL`. Scheduler tuning variables
/// (`POLL_INTERVAL_SECS`, `RATE_LIMIT_RPS`, `RUN_TIMEOUT_SECS`) are optional
/// and fall back to their documented defaults.
pub fn resolve_from_env() -> Result<ResolvedConfig> {
    Ok(ResolvedConfig {
        encryption_key: require_env("ENCRYPTION_KEY")?,

        sor_client_id: require_env("SOR_CLIENT_ID")?,
        sor_client_secret: require_env("SOR_CLIENT_SECRET")?,
        sor_redirect_uri: require_env("SOR_REDIRECT_URI")?,

        grid_client_id: require_env("GRID_CLIENT_ID")?,
        grid_client_secret: require_env("GRID_CLIENT_SECRET")?,
        grid_redirect_uri: require_env("GRID_REDIRECT_URI")?,

        database_url: require_env("DATABASE_URL")?,

        sor_api_base_url: optional_env("SOR_API_BASE_URL", DEFAULT_SOR_API_BASE_URL.to_string()),
        grid_api_base_url: optional_env("GRID_API_BASE_URL", DEFAULT_GRID_API_BASE_URL.to_string()),
        sor_oauth_token_url: optional_env("SOR_OAUTH_TOKEN_URL", DEFAULT_SOR_OAUTH_TOKEN_URL.to_string()),
        grid_oauth_token_url: optional_env("GRID_OAUTH_TOKEN_URL", DEFAULT_GRID_OAUTH_TOKEN_URL.to_string()),

        poll_interval: Duration::from_secs(optional_env(
            "POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL_SECS,
        )),
        rate_limit_rps: optional_env("RATE_LIMIT_RPS", DEFAULT_RATE_LIMIT_RPS),
        run_timeout: Duration::from_secs(optional_env(
            "RUN_TIMEOUT_SECS",
            DEFAULT_RUN_TIMEOUT_SECS,
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn set_all_required() {
        std::env::set_var("ENCRYPTION_KEY", "a".repeat(64));
        std::env::set_var("SOR_CLIENT_ID", "sor-id");
        std::env::set_var("SOR_CLIENT_SECRET", "sor-secret");
        std::env::set_var("SOR_REDIRECT_URI", "https://example.test/sor/callback");
        std::env::set_var("GRID_CLIENT_ID", "grid-id");
        std::env::set_var("GRID_CLIENT_SECRET", "grid-secret");
        std::env::set_var("GRID_REDIRECT_URI", "https://example.test/grid/callback");
        std::env::set_var("DATABASE_URL", "postgres://localhost/xsync");
    }

    fn clear_all() {
        for var in [
            "ENCRYPTION_KEY",
            "SOR_CLIENT_ID",
            "SOR_CLIENT_SECRET",
            "SOR_REDIRECT_URI",
            "GRID_CLIENT_ID",
            "GRID_CLIENT_SECRET",
            "GRID_REDIRECT_URI",
            "DATABASE_URL",
            "POLL_INTERVAL_SECS",
            "RATE_LIMIT_RPS",
            "RUN_TIMEOUT_SECS",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn resolves_with_defaults_when_tuning_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        set_all_required();

        let cfg = resolve_from_env().unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS));
        assert_eq!(cfg.rate_limit_rps, DEFAULT_RATE_LIMIT_RPS);
        assert_eq!(cfg.run_timeout, Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS));

        clear_all();
    }

    #[test]
    fn missing_required_var_names_it_in_the_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        set_all_required();
        std::env::remove_var("DATABASE_URL");

        let err = resolve_from_env().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        clear_all();
    }

    #[test]
    fn debug_redacts_secrets_but_keeps_redirect_uris() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        set_all_required();
        let cfg = resolve_from_env().unwrap();
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("sor-secret"));
        assert!(!rendered.contains("grid-secret"));
        assert!(rendered.contains("https://example.test/sor/callback"));

        clear_all();
    }
}
